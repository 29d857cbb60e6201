use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum MetaSyncError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    /// 参数校验失败（缺 workspace_id / base_id 等），不产生任何状态变更
    Validation(String),
    /// 握手认证失败，连接不会被创建
    Auth(String),
    /// 服务端未能确认订阅/退订，调用方可重试
    Subscription(String),
    /// 事件应用失败：不支持的目标表
    UnsupportedTarget(String),
    /// 事件应用失败：存储层错误，游标不推进
    Apply(String),
    Database(String),
    Serialization(String),
    IO(String),
    Http(String),
    Transport(String),
    NotConnected,
    Config(String),
    ShuttingDown(String),
    Other(String),
}

impl fmt::Display for MetaSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaSyncError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            MetaSyncError::JsonError(e) => write!(f, "JSON error: {}", e),
            MetaSyncError::Validation(e) => write!(f, "Validation error: {}", e),
            MetaSyncError::Auth(e) => write!(f, "Authentication error: {}", e),
            MetaSyncError::Subscription(e) => write!(f, "Subscription error: {}", e),
            MetaSyncError::UnsupportedTarget(e) => {
                write!(f, "Unknown or unsupported metadata table: {}", e)
            }
            MetaSyncError::Apply(e) => write!(f, "Apply event failed: {}", e),
            MetaSyncError::Database(e) => write!(f, "Database error: {}", e),
            MetaSyncError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MetaSyncError::IO(e) => write!(f, "IO error: {}", e),
            MetaSyncError::Http(e) => write!(f, "HTTP error: {}", e),
            MetaSyncError::Transport(e) => write!(f, "Transport error: {}", e),
            MetaSyncError::NotConnected => write!(f, "Not connected"),
            MetaSyncError::Config(e) => write!(f, "Config error: {}", e),
            MetaSyncError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            MetaSyncError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for MetaSyncError {}

impl From<rusqlite::Error> for MetaSyncError {
    fn from(error: rusqlite::Error) -> Self {
        MetaSyncError::SqliteError(error)
    }
}

impl From<serde_json::Error> for MetaSyncError {
    fn from(error: serde_json::Error) -> Self {
        MetaSyncError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for MetaSyncError {
    fn from(error: std::io::Error) -> Self {
        MetaSyncError::IO(error.to_string())
    }
}

impl MetaSyncError {
    /// 判断该错误是否可安全重试（bootstrap / 增量拉取路径）
    ///
    /// 实时 apply 失败不在此列：盲目重试可能乱序重放，推荐从游标做增量恢复。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MetaSyncError::Http(_)
                | MetaSyncError::Transport(_)
                | MetaSyncError::Subscription(_)
                | MetaSyncError::NotConnected
        )
    }
}

pub type Result<T> = std::result::Result<T, MetaSyncError>;
