// 导出模块
pub mod tkcommon;
pub mod tkdata;

// Re-export error types
pub use tkcommon::error::{AppError, Result};
