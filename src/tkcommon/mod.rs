// 共享基础模块
pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod logging_setup;
pub mod market_time;
pub mod metrics;
pub mod models;
pub mod queue;
pub mod seq_state;

// 常用类型直接导出
pub use backoff::ExponentialBackoff;
pub use config::Config;
pub use db::{db_path_for_trading_day, ensure_schema, TickStore, TickWriter, SCHEMA_VERSION};
pub use error::{classify_storage_error, AppError, Result, StorageErrorKind};
pub use market_time::{
    current_trading_day, now_ms, resolve_market_state, trading_day_from_ts_ms, MarketCalendar,
    MarketMode, MarketState,
};
pub use metrics::{Metrics, PipelineCounters};
pub use models::{CompositeKey, PersistResult, RawTickerRow, TickRow};
pub use queue::{OfferOutcome, TickQueue};
pub use seq_state::{SeqState, SeqTriple};
