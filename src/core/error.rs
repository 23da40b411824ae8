use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A node's pointer or entry list is already at its configured capacity.
    #[error("index node capacity exceeded (capacity {capacity})")]
    CapacityExceeded { capacity: usize },
    /// The tree cannot assign another node address.
    #[error("index full: node address limit {limit} reached")]
    IndexFull { limit: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Failure reported by a node store implementation.
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt node: {0}")]
    Corrupt(&'static str),
    #[error("unsupported node version: {0}")]
    UnsupportedVersion(u32),
    #[error("invalid config: {0}")]
    Config(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// True for failures that originate in node persistence rather than in
    /// the caller's arguments or the index's own limits.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Io(_) | Error::Corrupt(_) | Error::UnsupportedVersion(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
