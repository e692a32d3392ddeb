// 采集与落库管道
pub mod driver;
pub mod gateway;
pub mod mapper;
pub mod persist;
pub mod watchdog;

pub use driver::{UpstreamActivity, UpstreamDriver};
pub use gateway::{BridgeGateway, QuoteGateway};
pub use mapper::RowMapper;
pub use persist::{spawn_persist_worker, PersistHandle, WorkerState};
pub use watchdog::{
    run_health_loop, HealthSample, Watchdog, WatchdogAction, WatchdogStatus, HEALTH_INTERVAL_SEC,
    WATCHDOG_EXIT_CODE,
};
