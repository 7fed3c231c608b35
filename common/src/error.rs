use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("access of {len} bytes at offset {offset} exceeds storage capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("storage commit failed: {0}")]
    Commit(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("failed to persist record: {0}")]
    Save(#[source] StorageError),
    #[error("failed to erase record: {0}")]
    Erase(#[source] StorageError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("hour {0} is out of range (0-23)")]
    Hour(i64),
    #[error("minute {0} is out of range (0-59)")]
    Minute(i64),
    #[error("duration {0} minutes is out of range")]
    Duration(i64),
    #[error("enabled flag {0} is invalid (use 0 or 1)")]
    Enabled(i64),
    #[error("unknown schedule day `{0}`")]
    Day(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WifiError {
    #[error("station connection to `{ssid}` failed: {reason}")]
    ConnectFailed { ssid: String, reason: String },
    #[error("access point start failed: {0}")]
    AccessPoint(String),
    #[error("network scan failed: {0}")]
    Scan(String),
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("fallback access point unavailable: {0}")]
    AccessPoint(#[source] WifiError),
    #[error("captive DNS responder failed to start: {0}")]
    Dns(#[source] std::io::Error),
}
