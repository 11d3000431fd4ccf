//! Provides the client used by other services to talk to a Ganymede server.
//!
//! A [CachingClient](CachingClient) is bound to the service it acts for. This service id is
//! announced once via `CLIENT SETNAME` when connecting, therefore all operations are implicitly
//! scoped to the data of this service.
//!
//! The client itself holds no state besides its connection and never retries an operation.
//! Failures are reported as [CachingClientError](CachingClientError) which tells a rejected
//! operation (e.g. **NOT_FOUND** or **CONFLICT**) apart from a failed transport or an unexpected
//! response.
//!
//! # Example
//!
//! ```no_run
//! # use ganymede::client::{CachingClient, ListEntry};
//! # use serde::Serialize;
//! #[derive(Serialize)]
//! struct InvalidatedToken {
//!     token: String,
//!     expires: String,
//! }
//!
//! impl ListEntry for InvalidatedToken {
//!     fn entry_id(&self) -> &str {
//!         &self.token
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let client = CachingClient::connect("redis://127.0.0.1:2410", "gateway").await.unwrap();
//! client.create("session", "{}").await.unwrap();
//!
//! let token = InvalidatedToken { token: "abc".to_owned(), expires: "never".to_owned() };
//! client.append_to_list("invalidTokens", &token).await.unwrap();
//! # }
//! ```
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Cmd, ErrorKind, FromRedisValue, RedisError};
use serde::Serialize;

use crate::storage::{KeyValue, ListItems, Operation};

/// Enumerates the failures of a [CachingClient](CachingClient).
#[derive(Debug, thiserror::Error)]
pub enum CachingClientError {
    /// The server rejected the operation with the given code (e.g. **NOT_FOUND**).
    #[error("Cannot {operation} '{key}': {code} {message}")]
    Rejected {
        /// The attempted operation.
        operation: Operation,
        /// The affected key or list.
        key: String,
        /// The code reported by the server.
        code: String,
        /// The message reported by the server.
        message: String,
    },

    /// The server couldn't be reached or the connection failed.
    #[error("Cannot {operation} '{key}': {reason}")]
    Transport {
        /// The attempted operation.
        operation: Operation,
        /// The affected key or list.
        key: String,
        /// Describes the failure.
        reason: String,
    },

    /// Either the response or the data to send couldn't be processed.
    #[error("Cannot {operation} '{key}': Malformed data: {reason}")]
    Malformed {
        /// The attempted operation.
        operation: Operation,
        /// The affected key or list.
        key: String,
        /// Describes what is wrong with the data.
        reason: String,
    },
}

impl CachingClientError {
    fn from_redis(error: RedisError, operation: Operation, key: &str) -> Self {
        if error.kind() == ErrorKind::TypeError {
            return CachingClientError::Malformed {
                operation,
                key: key.to_owned(),
                reason: error.to_string(),
            };
        }

        match error.code() {
            Some(code) if !error.is_io_error() => CachingClientError::Rejected {
                operation,
                key: key.to_owned(),
                code: code.to_owned(),
                message: error.detail().unwrap_or_default().to_owned(),
            },
            _ => CachingClientError::Transport {
                operation,
                key: key.to_owned(),
                reason: error.to_string(),
            },
        }
    }

    fn malformed(operation: Operation, key: &str, reason: impl ToString) -> Self {
        CachingClientError::Malformed {
            operation,
            key: key.to_owned(),
            reason: reason.to_string(),
        }
    }

    /// Returns the code if the operation was rejected by the server.
    pub fn code(&self) -> Option<&str> {
        match self {
            CachingClientError::Rejected { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Determines if the operation failed as the entry already exists.
    pub fn is_conflict(&self) -> bool {
        self.code() == Some("CONFLICT")
    }

    /// Determines if the operation failed as the entry doesn't exist.
    pub fn is_not_found(&self) -> bool {
        self.code() == Some("NOT_FOUND")
    }
}

/// Represents the result of a client operation.
pub type ClientResult<T> = Result<T, CachingClientError>;

/// Describes an item which can be stored in a named list.
///
/// The id determines which item is replaced by an append and is used to evict the item.
pub trait ListEntry {
    /// Returns the id of this item within its list.
    fn entry_id(&self) -> &str;
}

/// Talks to a Ganymede server on behalf of a service.
#[derive(Clone)]
pub struct CachingClient {
    connection: MultiplexedConnection,
    service_id: String,
}

impl CachingClient {
    /// Connects to the server with the given URL and announces the given service id.
    pub async fn connect(url: &str, service_id: &str) -> ClientResult<Self> {
        let transport_error = |error: RedisError| CachingClientError::Transport {
            operation: Operation::ReadAll,
            key: service_id.to_owned(),
            reason: error.to_string(),
        };

        let client = redis::Client::open(url).map_err(transport_error)?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport_error)?;

        let client = CachingClient {
            connection,
            service_id: service_id.to_owned(),
        };
        client
            .query::<()>(
                redis::cmd("CLIENT").arg("SETNAME").arg(service_id),
                Operation::ReadAll,
                service_id,
            )
            .await?;

        log::debug!("Connected to {} as {}...", url, service_id);

        Ok(client)
    }

    /// Returns the service id this client acts for.
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    async fn query<T: FromRedisValue>(
        &self,
        cmd: &Cmd,
        operation: Operation,
        key: &str,
    ) -> ClientResult<T> {
        let mut connection = self.connection.clone();
        let result: Result<T, RedisError> = cmd.query_async(&mut connection).await;
        result.map_err(|error| CachingClientError::from_redis(error, operation, key))
    }

    fn to_key_value(
        &self,
        (key, value, created): (String, String, String),
        operation: Operation,
    ) -> ClientResult<KeyValue> {
        let created = DateTime::parse_from_rfc3339(&created)
            .map_err(|error| CachingClientError::malformed(operation, &key, error))?
            .with_timezone(&Utc);

        Ok(KeyValue {
            key,
            value,
            service_id: self.service_id.clone(),
            created,
        })
    }

    /// Creates a new entry and returns it.
    ///
    /// Fails with a **CONFLICT** if the key is already present.
    pub async fn create(&self, key: &str, value: &str) -> ClientResult<KeyValue> {
        let entry = self
            .query(
                redis::cmd("CACHE.CREATE").arg(key).arg(value),
                Operation::Create,
                key,
            )
            .await?;
        self.to_key_value(entry, Operation::Create)
    }

    /// Reads an entry or fails with **NOT_FOUND**.
    pub async fn read(&self, key: &str) -> ClientResult<KeyValue> {
        let entry = self
            .query(redis::cmd("CACHE.GET").arg(key), Operation::Read, key)
            .await?;
        self.to_key_value(entry, Operation::Read)
    }

    /// Replaces the value of an existing entry and returns the updated entry.
    ///
    /// Fails with **NOT_FOUND** if the key is absent. The creation timestamp is kept.
    pub async fn update(&self, key: &str, value: &str) -> ClientResult<KeyValue> {
        let entry = self
            .query(
                redis::cmd("CACHE.UPDATE").arg(key).arg(value),
                Operation::Update,
                key,
            )
            .await?;
        self.to_key_value(entry, Operation::Update)
    }

    /// Deletes an entry and returns its previous contents or fails with **NOT_FOUND**.
    pub async fn delete(&self, key: &str) -> ClientResult<KeyValue> {
        let entry = self
            .query(redis::cmd("CACHE.DELETE").arg(key), Operation::Delete, key)
            .await?;
        self.to_key_value(entry, Operation::Delete)
    }

    /// Reads all entries of the service.
    pub async fn read_all(&self) -> ClientResult<HashMap<String, KeyValue>> {
        let entries: Vec<(String, String, String)> = self
            .query(&redis::cmd("CACHE.ALL"), Operation::ReadAll, "")
            .await?;

        entries
            .into_iter()
            .map(|entry| {
                self.to_key_value(entry, Operation::ReadAll)
                    .map(|entry| (entry.key.clone(), entry))
            })
            .collect()
    }

    /// Adds the given item to the list or replaces the item with the same id.
    pub async fn append_to_list<E: ListEntry + Serialize>(
        &self,
        list: &str,
        entry: &E,
    ) -> ClientResult<()> {
        let data = serde_json::to_string(entry)
            .map_err(|error| CachingClientError::malformed(Operation::Append, list, error))?;

        self.query(
            redis::cmd("LIST.APPEND")
                .arg(list)
                .arg(entry.entry_id())
                .arg(data),
            Operation::Append,
            list,
        )
        .await
    }

    /// Removes the items with the given ids from the list. Unknown ids are ignored.
    pub async fn evict_from_list(&self, list: &str, ids: &[&str]) -> ClientResult<()> {
        if ids.is_empty() {
            return Ok(());
        }

        self.query(
            redis::cmd("LIST.EVICT").arg(list).arg(ids),
            Operation::Evict,
            list,
        )
        .await
    }

    /// Reads all items of the given list. An unknown list yields an empty map.
    pub async fn read_list(&self, list: &str) -> ClientResult<ListItems> {
        self.query(redis::cmd("LIST.GET").arg(list), Operation::ReadList, list)
            .await
    }

    /// Reads all lists of the service. If no lists exist, an empty map is returned.
    pub async fn read_all_lists(&self) -> ClientResult<HashMap<String, ListItems>> {
        let lists: Vec<(String, ListItems)> = self
            .query(&redis::cmd("LIST.ALL"), Operation::ReadAllLists, "")
            .await?;

        Ok(lists.into_iter().collect())
    }
}
