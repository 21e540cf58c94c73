//! Redis connection management.

use redis::aio::ConnectionManager;
use thiserror::Error;

use regen_core::RegenError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis connection error: {0}")]
    Connection(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// ConnectionManager multiplexes internally; clone it per operation.
pub type RedisPool = ConnectionManager;

/// Connect to `redis_url`, e.g. `redis://127.0.0.1:6379`.
pub async fn init_pool(redis_url: &str) -> QueueResult<RedisPool> {
    let client = redis::Client::open(redis_url)?;
    let manager = ConnectionManager::new(client).await?;
    Ok(manager)
}

impl From<QueueError> for RegenError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Connection(e) if e.is_io_error() || e.is_timeout() => {
                RegenError::StoreUnavailable(format!("job queue: {e}"))
            }
            QueueError::Connection(e) => RegenError::Store(format!("job queue: {e}")),
            QueueError::Serialization(e) => RegenError::Json(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_message_maps_to_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let regen: RegenError = QueueError::from(err).into();
        assert_eq!(regen.kind(), "Json");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(redis::Client::open("not a url").is_err());
    }
}
