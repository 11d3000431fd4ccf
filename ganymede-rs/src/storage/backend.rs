//! Provides the primitives used to talk to a Redis backend and the classification of its errors.
//!
//! [HashCommands](HashCommands) abstracts the handful of hash and set commands required by the
//! [RedisStorage](crate::storage::redis::RedisStorage). It is implemented for the
//! **ConnectionManager** of the **redis** crate and can be replaced by an in-process fake in
//! tests.
//!
//! Each command is awaited via [bounded](bounded) which enforces the configured timeout and
//! classifies failures into a [BackendError](BackendError). The backend signalling that it is out
//! of memory is the only terminal failure, everything else (IO errors, dropped connections,
//! timeouts or unexpected replies) can be retried by the caller.
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, RedisError, RedisResult, Script};
use async_trait::async_trait;

use crate::fmt::format_duration;
use crate::storage::policy::CapacityPolicy;
use crate::storage::{Operation, StorageError};

/// Determines how long a single backend command may take if **storage.redis.command_timeout**
/// isn't set.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

lazy_static::lazy_static! {
    /// Replaces a hash field only if it still has the expected value and returns the value
    /// present before the call.
    static ref UPDATE_IF_UNCHANGED: Script = Script::new(
        r"
local previous = redis.call('HGET', KEYS[1], ARGV[1])
if previous == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
end
return previous
",
    );

    /// Removes a hash field and returns its value.
    static ref TAKE: Script = Script::new(
        r"
local previous = redis.call('HGET', KEYS[1], ARGV[1])
if previous then
    redis.call('HDEL', KEYS[1], ARGV[1])
end
return previous
",
    );
}

/// Enumerates the classified failures of a backend command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend has reached its memory limit.
    #[error("The backend is out of memory: {0}")]
    OutOfCapacity(String),

    /// The command failed but might succeed if repeated.
    #[error("{0}")]
    Retryable(String),
}

impl BackendError {
    /// Classifies the given error reported by the redis client.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::storage::backend::BackendError;
    /// # use redis::{ErrorKind, RedisError};
    /// let error = RedisError::from((
    ///     ErrorKind::ResponseError,
    ///     "OOM",
    ///     "command not allowed when used memory > 'maxmemory'.".to_owned(),
    /// ));
    /// assert_eq!(matches!(BackendError::classify(&error), BackendError::OutOfCapacity(_)), true);
    ///
    /// let error = RedisError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
    /// assert_eq!(matches!(BackendError::classify(&error), BackendError::Retryable(_)), true);
    /// ```
    pub fn classify(error: &RedisError) -> Self {
        let out_of_memory = error.code() == Some("OOM")
            || error
                .detail()
                .map(|detail| detail.contains("maxmemory"))
                .unwrap_or(false);

        if out_of_memory {
            BackendError::OutOfCapacity(error.to_string())
        } else {
            BackendError::Retryable(error.to_string())
        }
    }

    /// Translates this error into the storage error reported for the given operation.
    ///
    /// Running out of capacity is handed to the policy, which decides what to report.
    pub fn into_storage_error(
        self,
        policy: &dyn CapacityPolicy,
        service_id: &str,
        key: &str,
        operation: Operation,
    ) -> StorageError {
        match self {
            BackendError::OutOfCapacity(reason) => {
                log::warn!(
                    "The backend is out of capacity while trying to {} '{}' for '{}': {}",
                    operation,
                    key,
                    service_id,
                    reason
                );
                policy.on_capacity_exhausted(service_id, key, operation)
            }
            BackendError::Retryable(reason) => StorageError::Retryable {
                service_id: service_id.to_owned(),
                key: key.to_owned(),
                operation,
                reason,
            },
        }
    }
}

/// Awaits the given backend command for at most the given duration and classifies its failure.
pub async fn bounded<T>(
    timeout: Duration,
    command: impl Future<Output = RedisResult<T>>,
) -> Result<T, BackendError> {
    match tokio::time::timeout(timeout, command).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(error)) => Err(BackendError::classify(&error)),
        Err(_) => Err(BackendError::Retryable(format!(
            "The backend didn't respond within {}",
            format_duration(timeout)
        ))),
    }
}

/// Describes the backend commands used by the Redis storage engine.
#[async_trait]
pub trait HashCommands: Send + Sync {
    /// Sets the field only if it is absent. Returns **true** if the field was set.
    async fn hset_nx(&self, hash: &str, field: &str, value: &str) -> RedisResult<bool>;

    /// Sets the field unconditionally.
    async fn hset(&self, hash: &str, field: &str, value: &str) -> RedisResult<()>;

    /// Atomically replaces the field if it still contains **expected** and returns the value
    /// present before the call. The field was only written if that value equals **expected**.
    async fn hset_if_unchanged(
        &self,
        hash: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> RedisResult<Option<String>>;

    /// Reads the value of a field.
    async fn hget(&self, hash: &str, field: &str) -> RedisResult<Option<String>>;

    /// Atomically removes a field and returns its value.
    async fn htake(&self, hash: &str, field: &str) -> RedisResult<Option<String>>;

    /// Reads all fields of a hash.
    async fn hgetall(&self, hash: &str) -> RedisResult<HashMap<String, String>>;

    /// Removes the given fields of a hash.
    async fn hdel(&self, hash: &str, fields: &[String]) -> RedisResult<()>;

    /// Removes a whole key.
    async fn del(&self, key: &str) -> RedisResult<()>;

    /// Adds a member to a set.
    async fn sadd(&self, set: &str, member: &str) -> RedisResult<()>;

    /// Lists all members of a set.
    async fn smembers(&self, set: &str) -> RedisResult<Vec<String>>;
}

#[async_trait]
impl HashCommands for ConnectionManager {
    async fn hset_nx(&self, hash: &str, field: &str, value: &str) -> RedisResult<bool> {
        let mut con = self.clone();
        con.hset_nx(hash, field, value).await
    }

    async fn hset(&self, hash: &str, field: &str, value: &str) -> RedisResult<()> {
        let mut con = self.clone();
        let _: i64 = AsyncCommands::hset(&mut con, hash, field, value).await?;
        Ok(())
    }

    async fn hset_if_unchanged(
        &self,
        hash: &str,
        field: &str,
        expected: &str,
        value: &str,
    ) -> RedisResult<Option<String>> {
        let mut con = self.clone();
        UPDATE_IF_UNCHANGED
            .key(hash)
            .arg(field)
            .arg(expected)
            .arg(value)
            .invoke_async(&mut con)
            .await
    }

    async fn hget(&self, hash: &str, field: &str) -> RedisResult<Option<String>> {
        let mut con = self.clone();
        con.hget(hash, field).await
    }

    async fn htake(&self, hash: &str, field: &str) -> RedisResult<Option<String>> {
        let mut con = self.clone();
        TAKE.key(hash).arg(field).invoke_async(&mut con).await
    }

    async fn hgetall(&self, hash: &str) -> RedisResult<HashMap<String, String>> {
        let mut con = self.clone();
        con.hgetall(hash).await
    }

    async fn hdel(&self, hash: &str, fields: &[String]) -> RedisResult<()> {
        if fields.is_empty() {
            return Ok(());
        }

        let mut con = self.clone();
        let _: i64 = AsyncCommands::hdel(&mut con, hash, fields).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> RedisResult<()> {
        let mut con = self.clone();
        let _: i64 = AsyncCommands::del(&mut con, key).await?;
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> RedisResult<()> {
        let mut con = self.clone();
        let _: i64 = AsyncCommands::sadd(&mut con, set, member).await?;
        Ok(())
    }

    async fn smembers(&self, set: &str) -> RedisResult<Vec<String>> {
        let mut con = self.clone();
        con.smembers(set).await
    }
}
