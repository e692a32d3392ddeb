use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    #[error("Mapping error: {0}")]
    MappingError(String),

    #[error("Gateway error: {0}")]
    GatewayError(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// 存储错误分类，决定持久化线程的处理策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// busy/locked，退避后原批次重试
    Transient,
    /// readonly/磁盘满/IO/损坏，重建连接后原批次重试
    Permanent,
    /// 其余异常，关闭连接下次重建
    Other,
}

impl StorageErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageErrorKind::Transient => "transient",
            StorageErrorKind::Permanent => "permanent",
            StorageErrorKind::Other => "other",
        }
    }
}

/// Classify a storage-side failure the way the persistence worker needs it.
///
/// busy/locked is the only class retried in place; everything that smells
/// like a broken file or filesystem forces a connection rebuild.
pub fn classify_storage_error(err: &AppError) -> StorageErrorKind {
    match err {
        AppError::SqliteError(e) => classify_sqlite_error(e),
        AppError::DatabaseError(msg) => {
            let text = msg.to_lowercase();
            if text.contains("locked") || text.contains("busy") {
                StorageErrorKind::Transient
            } else {
                StorageErrorKind::Other
            }
        }
        AppError::IoError(_) => StorageErrorKind::Permanent,
        _ => StorageErrorKind::Other,
    }
}

fn classify_sqlite_error(err: &rusqlite::Error) -> StorageErrorKind {
    use rusqlite::ErrorCode;

    if let Some(code) = sqlite_error_code(err) {
        return match code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => StorageErrorKind::Transient,
            ErrorCode::ReadOnly
            | ErrorCode::DiskFull
            | ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::DatabaseCorrupt
            | ErrorCode::NotADatabase => StorageErrorKind::Permanent,
            _ => StorageErrorKind::Other,
        };
    }

    let text = err.to_string().to_lowercase();
    if text.contains("locked") || text.contains("busy") {
        StorageErrorKind::Transient
    } else {
        StorageErrorKind::Other
    }
}

fn sqlite_error_code(err: &rusqlite::Error) -> Option<rusqlite::ErrorCode> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => Some(e.code),
        _ => None,
    }
}
