//! Provides the multi-tenant key-value storage of Ganymede.
//!
//! All data is partitioned by the id of the service (tenant) which owns it. For each service
//! two kinds of data are stored:
//! * scalar entries ([KeyValue](KeyValue)) which support atomic create, read, update and delete.
//! * named lists which map an entry id to an opaque payload. These are used to keep track of
//!   invalidated tokens or rules and only support append (last write wins) and evict.
//!
//! The actual persistence is provided by a [StorageEngine](StorageEngine). Two engines are
//! available and selected via **storage.mode**:
//! * **redis** stores everything in a Redis server (see [redis](redis)).
//! * **inmemory** keeps all data in the local process (see [memory](memory)).
//!
//! Once [install](install) has been called, the engine is available as [Storage](Storage) in the
//! platform and the **CACHE.*** and **LIST.*** commands are registered, which are used by the
//! [CachingClient](crate::client::CachingClient).
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Config;
use crate::platform::Platform;

pub mod backend;
pub mod commands;
mod entry;
pub mod memory;
pub mod policy;
pub mod redis;

pub use entry::KeyValue;

/// Enumerates the operations of a storage engine.
///
/// This is carried by each [StorageError](StorageError) so that errors can be traced back to what
/// was attempted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Creates a scalar entry.
    Create,
    /// Reads a scalar entry.
    Read,
    /// Updates a scalar entry.
    Update,
    /// Deletes a scalar entry.
    Delete,
    /// Reads all scalar entries of a service.
    ReadAll,
    /// Deletes all scalar entries of a service.
    DeleteAll,
    /// Adds or replaces an item of a named list.
    Append,
    /// Removes items from a named list.
    Evict,
    /// Reads a single named list.
    ReadList,
    /// Reads all named lists of a service.
    ReadAllLists,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Create => "create",
            Operation::Read => "read",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::ReadAll => "read all of",
            Operation::DeleteAll => "delete all of",
            Operation::Append => "append to",
            Operation::Evict => "evict from",
            Operation::ReadList => "read list",
            Operation::ReadAllLists => "read all lists of",
        };

        f.write_str(name)
    }
}

/// Enumerates the well defined failures of a storage engine.
///
/// Each error carries the service, the key (or list name) and the operation. For operations
/// which affect a whole service, the key is empty.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested entry doesn't exist.
    #[error("No entry '{key}' exists for service '{service_id}'")]
    NotFound {
        /// The owning service.
        service_id: String,
        /// The requested key.
        key: String,
        /// The attempted operation.
        operation: Operation,
    },

    /// An entry with the given key already exists.
    #[error("An entry '{key}' already exists for service '{service_id}'")]
    Conflict {
        /// The owning service.
        service_id: String,
        /// The conflicting key.
        key: String,
        /// The attempted operation.
        operation: Operation,
    },

    /// The engine is out of capacity and the policy rejected the write.
    #[error("Insufficient storage to {operation} '{key}' for service '{service_id}'")]
    InsufficientStorage {
        /// The owning service.
        service_id: String,
        /// The key to be written.
        key: String,
        /// The attempted operation.
        operation: Operation,
    },

    /// The backend failed temporarily. The operation wasn't retried but can be.
    #[error("Failed to {operation} '{key}' for service '{service_id}': {reason}")]
    Retryable {
        /// The owning service.
        service_id: String,
        /// The affected key.
        key: String,
        /// The attempted operation.
        operation: Operation,
        /// The failure reported by the backend.
        reason: String,
    },

    /// The stored entry cannot be decoded.
    #[error("The entry '{key}' of service '{service_id}' is malformed: {reason}")]
    MalformedEntry {
        /// The owning service.
        service_id: String,
        /// The affected key.
        key: String,
        /// The attempted operation.
        operation: Operation,
        /// Describes what is wrong with the entry.
        reason: String,
    },
}

impl StorageError {
    /// Returns the machine readable code which prefixes the error when sent to a client.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::storage::{Operation, StorageError};
    /// let error = StorageError::NotFound {
    ///     service_id: "gateway".to_owned(),
    ///     key: "token".to_owned(),
    ///     operation: Operation::Read,
    /// };
    /// assert_eq!(error.code(), "NOT_FOUND");
    /// assert_eq!(error.to_string(), "No entry 'token' exists for service 'gateway'");
    /// ```
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NotFound { .. } => "NOT_FOUND",
            StorageError::Conflict { .. } => "CONFLICT",
            StorageError::InsufficientStorage { .. } => "INSUFFICIENT_STORAGE",
            StorageError::Retryable { .. } => "RETRYABLE",
            StorageError::MalformedEntry { .. } => "MALFORMED_ENTRY",
        }
    }

    /// Returns the operation which failed.
    pub fn operation(&self) -> Operation {
        match self {
            StorageError::NotFound { operation, .. }
            | StorageError::Conflict { operation, .. }
            | StorageError::InsufficientStorage { operation, .. }
            | StorageError::Retryable { operation, .. }
            | StorageError::MalformedEntry { operation, .. } => *operation,
        }
    }

    pub(crate) fn not_found(service_id: &str, key: &str, operation: Operation) -> Self {
        StorageError::NotFound {
            service_id: service_id.to_owned(),
            key: key.to_owned(),
            operation,
        }
    }

    pub(crate) fn conflict(service_id: &str, key: &str, operation: Operation) -> Self {
        StorageError::Conflict {
            service_id: service_id.to_owned(),
            key: key.to_owned(),
            operation,
        }
    }

    pub(crate) fn malformed(
        service_id: &str,
        key: &str,
        operation: Operation,
        reason: impl Display,
    ) -> Self {
        StorageError::MalformedEntry {
            service_id: service_id.to_owned(),
            key: key.to_owned(),
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Represents the result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

/// Maps the entry ids of a named list to their payloads.
pub type ListItems = HashMap<String, String>;

/// Describes a backend which persists the entries and lists of all services.
///
/// All operations are atomic with regard to a single entry. Concurrent creates of the same key
/// are resolved by the engine so that exactly one of them succeeds. For updates and deletes, the
/// last completed write is visible to the next read.
#[async_trait]
pub trait StorageEngine: Send + Sync {
    /// Returns a short description used by diagnostic commands.
    fn describe(&self) -> String;

    /// Creates a new entry or fails with **Conflict** if the key is already present.
    async fn create(&self, service_id: &str, key: &str, value: &str) -> StorageResult<KeyValue>;

    /// Reads an entry or fails with **NotFound**.
    async fn read(&self, service_id: &str, key: &str) -> StorageResult<KeyValue>;

    /// Replaces the value of an existing entry and returns the updated entry.
    ///
    /// Fails with **NotFound** if the key is absent, as an update never creates an entry.
    async fn update(&self, service_id: &str, key: &str, value: &str) -> StorageResult<KeyValue>;

    /// Removes an entry and returns its previous contents or fails with **NotFound**.
    async fn delete(&self, service_id: &str, key: &str) -> StorageResult<KeyValue>;

    /// Reads all entries of a service.
    ///
    /// Malformed entries are skipped and logged. A service without entries yields an empty map.
    async fn read_for_service(&self, service_id: &str) -> StorageResult<HashMap<String, KeyValue>>;

    /// Removes all entries of a service.
    async fn delete_for_service(&self, service_id: &str) -> StorageResult<()>;

    /// Adds or replaces the item with the given id in the given list.
    async fn store_list_item(
        &self,
        service_id: &str,
        list: &str,
        id: &str,
        entry: &str,
    ) -> StorageResult<()>;

    /// Reads all items of the given list (which is empty if the list doesn't exist).
    async fn read_list(&self, service_id: &str, list: &str) -> StorageResult<ListItems>;

    /// Reads all lists of a service.
    async fn read_all_lists(&self, service_id: &str)
        -> StorageResult<HashMap<String, ListItems>>;

    /// Removes the given ids from the list. Unknown ids are ignored.
    async fn evict_list_items(
        &self,
        service_id: &str,
        list: &str,
        ids: &[String],
    ) -> StorageResult<()>;
}

/// Provides access to the configured storage engine.
///
/// This is registered in the platform by [install](install).
pub struct Storage {
    engine: Arc<dyn StorageEngine>,
    policy: &'static str,
}

impl Storage {
    /// Wraps the given engine.
    pub fn new(engine: Arc<dyn StorageEngine>, policy: &'static str) -> Self {
        Storage { engine, policy }
    }

    /// Returns the underlying engine.
    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    /// Returns the description of the underlying engine.
    pub fn describe(&self) -> String {
        self.engine.describe()
    }

    /// Returns the name of the active capacity policy.
    pub fn policy(&self) -> &'static str {
        self.policy
    }
}

/// Creates the configured storage engine and registers it along with its commands.
///
/// Fails if the config contains an unknown **storage.mode** or if the backend cannot be reached,
/// in which case the service shouldn't start at all.
pub async fn install(platform: Arc<Platform>) -> anyhow::Result<Arc<Storage>> {
    let config = platform
        .find::<Config>()
        .ok_or_else(|| anyhow::anyhow!("A config is required to set up the storage engine."))?
        .current();

    let policy = policy::from_name(&config.string_or("storage.policy", "reject"));
    let policy_name = policy.name();
    let mode = config.string_or("storage.mode", "inmemory");
    let engine: Arc<dyn StorageEngine> = match mode.as_str() {
        "redis" => Arc::new(
            redis::RedisStorage::connect(
                &config.string_or("storage.redis.url", "redis://127.0.0.1:6379"),
                config.duration_or(
                    "storage.redis.command_timeout",
                    backend::DEFAULT_COMMAND_TIMEOUT,
                ),
                policy,
            )
            .await?,
        ),
        "inmemory" => Arc::new(memory::InMemoryStorage::new(
            config
                .query("storage.inmemory.max_entries")
                .as_i64()
                .filter(|max_entries| *max_entries > 0)
                .map(|max_entries| max_entries as usize)
                .unwrap_or(memory::DEFAULT_MAX_ENTRIES),
            policy,
        )),
        _ => return Err(anyhow::anyhow!("Unknown storage mode: {}", mode)),
    };

    log::info!(
        "Using storage engine {} (policy: {}).",
        engine.describe(),
        policy_name
    );

    let storage = Arc::new(Storage::new(engine, policy_name));
    platform.register::<Storage>(storage.clone());
    commands::install(platform, storage.clone());

    Ok(storage)
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use crate::storage::Storage;

    #[test]
    fn the_configured_engine_is_installed() {
        crate::testing::test_async(async {
            let platform = Builder::new()
                .enable_config()
                .enable_commands()
                .build()
                .await
                .unwrap();
            platform
                .require::<Config>()
                .load_from_string(
                    "
storage:
    mode: inmemory
    policy: drop-everything
    inmemory:
        max_entries: 16
",
                    None,
                )
                .unwrap();

            let storage = crate::storage::install(platform.clone()).await.unwrap();
            assert_eq!(storage.describe(), "in-memory (16 entries max)");
            assert_eq!(storage.policy(), "reject");
            assert_eq!(platform.find::<Storage>().is_some(), true);
        });
    }

    #[test]
    fn unknown_modes_are_rejected() {
        crate::testing::test_async(async {
            let platform = Builder::new().enable_config().build().await.unwrap();
            platform
                .require::<Config>()
                .load_from_string("storage:\n    mode: vsam", None)
                .unwrap();

            assert_eq!(crate::storage::install(platform.clone()).await.is_err(), true);
            assert_eq!(platform.find::<Storage>().is_none(), true);
        });
    }
}
