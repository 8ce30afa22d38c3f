//! Error types for rtcache.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] redis::RedisError),

    #[error("codec error: {0}")]
    Codec(String),

    /// The compute function failed; `message` is the stored failure text.
    #[error("for {id} we received error: {message}")]
    Computation { id: String, message: String },

    #[error("unable to retrieve result for id: {0}")]
    Unavailable(String),

    #[error("timed out after {waited:?} waiting for result of {id}")]
    TimedOut { id: String, waited: Duration },

    #[error("cache has been shut down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
