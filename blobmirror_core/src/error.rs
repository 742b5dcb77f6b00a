/// Possible errors surfaced by the cache engine and its adapters.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The remote store has no object under this key.
    #[error("object {key:?} not found")]
    NotFound { key: String },

    /// The remote store failed in a way other than NotFound.
    #[error("remote store error for {key:?}: {message}")]
    Remote { key: String, message: String },

    /// Reading or writing the local cache file failed.
    #[error("local cache io error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// The cache has been closed; no further lookups are accepted.
    #[error("cache is closed")]
    Disposed,

    /// An operation was requested in a state that does not support it.
    #[error("{op} is not legal in state {state}")]
    InvalidState { op: &'static str, state: &'static str },
}

impl CacheError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}
