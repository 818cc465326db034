//! Error types for log store access.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Log store unavailable")]
    Unavailable,
}

pub type Result<T> = std::result::Result<T, Error>;
