use std::fmt;
use rusqlite;

#[derive(Debug)]
pub enum SiteSyncSDKError {
    SqliteError(rusqlite::Error),
    JsonError(String),
    Serialization(String),
    IO(String),
    Database(String),
    Migration(String),
    KvStore(String),
    NotConnected(String),
    Transport(String),
    // 远端拒绝（HTTP 非 2xx），带状态码便于上层自行分类
    Remote { status: u16, message: String },
    Timeout(String),
    Config(String),
    NotInitialized(String),
    ShuttingDown(String),
    InvalidOperation(String),
    Other(String),
}

impl fmt::Display for SiteSyncSDKError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SiteSyncSDKError::SqliteError(e) => write!(f, "SQLite error: {}", e),
            SiteSyncSDKError::JsonError(e) => write!(f, "JSON error: {}", e),
            SiteSyncSDKError::Serialization(e) => write!(f, "Serialization error: {}", e),
            SiteSyncSDKError::IO(e) => write!(f, "IO error: {}", e),
            SiteSyncSDKError::Database(e) => write!(f, "Database error: {}", e),
            SiteSyncSDKError::Migration(e) => write!(f, "Migration error: {}", e),
            SiteSyncSDKError::KvStore(e) => write!(f, "KV store error: {}", e),
            SiteSyncSDKError::NotConnected(e) => write!(f, "Not connected: {}", e),
            SiteSyncSDKError::Transport(e) => write!(f, "Transport error: {}", e),
            SiteSyncSDKError::Remote { status, message } => {
                write!(f, "Remote error [{}]: {}", status, message)
            }
            SiteSyncSDKError::Timeout(e) => write!(f, "Timeout: {}", e),
            SiteSyncSDKError::Config(e) => write!(f, "Config error: {}", e),
            SiteSyncSDKError::NotInitialized(e) => write!(f, "Not initialized: {}", e),
            SiteSyncSDKError::ShuttingDown(e) => write!(f, "Shutting down: {}", e),
            SiteSyncSDKError::InvalidOperation(e) => write!(f, "Invalid operation: {}", e),
            SiteSyncSDKError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl std::error::Error for SiteSyncSDKError {}

impl From<rusqlite::Error> for SiteSyncSDKError {
    fn from(error: rusqlite::Error) -> Self {
        SiteSyncSDKError::SqliteError(error)
    }
}

impl From<serde_json::Error> for SiteSyncSDKError {
    fn from(error: serde_json::Error) -> Self {
        SiteSyncSDKError::JsonError(error.to_string())
    }
}

impl From<std::io::Error> for SiteSyncSDKError {
    fn from(error: std::io::Error) -> Self {
        SiteSyncSDKError::IO(error.to_string())
    }
}

impl SiteSyncSDKError {
    /// 获取远端 HTTP 状态码（如果这是一个远端拒绝错误）
    pub fn remote_status(&self) -> Option<u16> {
        match self {
            SiteSyncSDKError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SiteSyncSDKError>;
