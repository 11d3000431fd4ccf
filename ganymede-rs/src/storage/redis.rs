//! Provides a storage engine which persists all data in Redis.
//!
//! The data of a service is laid out as follows:
//! * all scalar entries are fields of the hash `kv:<service>`. Each value is the JSON form of the
//!   [KeyValue](crate::storage::KeyValue).
//! * the list `L` is stored as hash `list:<length of service>:<service>:<L>` which maps the entry
//!   ids to their payloads.
//! * the set `lists:<length of service>:<service>` contains the names of all lists of the service.
//!
//! Prefixing the service with its length keeps the keys unambiguous, even if a service id or a
//! list name contains a colon.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::fmt::format_duration;
use crate::storage::backend::{bounded, BackendError, HashCommands};
use crate::storage::policy::CapacityPolicy;
use crate::storage::{
    KeyValue, ListItems, Operation, StorageEngine, StorageError, StorageResult,
};

/// Determines how often an update is attempted if the entry keeps changing concurrently.
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Stores entries and lists in Redis.
pub struct RedisStorage {
    backend: Box<dyn HashCommands>,
    description: String,
    command_timeout: Duration,
    policy: Arc<dyn CapacityPolicy>,
}

impl RedisStorage {
    /// Connects to the Redis server with the given URL.
    ///
    /// Fails if the server cannot be reached, as we do not want to start without a working
    /// storage.
    pub async fn connect(
        url: &str,
        command_timeout: Duration,
        policy: Arc<dyn CapacityPolicy>,
    ) -> anyhow::Result<Self> {
        let client = ::redis::Client::open(url)
            .map_err(|error| anyhow::anyhow!("Invalid Redis URL {}: {}", url, error))?;
        let manager = tokio::time::timeout(command_timeout, client.get_connection_manager())
            .await
            .map_err(|_| anyhow::anyhow!("Cannot connect to Redis at {}: Timeout", url))?
            .map_err(|error| anyhow::anyhow!("Cannot connect to Redis at {}: {}", url, error))?;

        log::info!("Connected to Redis at {}...", url);

        Ok(RedisStorage::new(
            Box::new(manager),
            format!("redis ({})", url),
            command_timeout,
            policy,
        ))
    }

    /// Creates an engine which operates on the given backend.
    pub fn new(
        backend: Box<dyn HashCommands>,
        description: String,
        command_timeout: Duration,
        policy: Arc<dyn CapacityPolicy>,
    ) -> Self {
        RedisStorage {
            backend,
            description,
            command_timeout,
            policy,
        }
    }

    fn entries_key(service_id: &str) -> String {
        format!("kv:{}", service_id)
    }

    fn list_key(service_id: &str, list: &str) -> String {
        format!("list:{}:{}:{}", service_id.len(), service_id, list)
    }

    fn list_index_key(service_id: &str) -> String {
        format!("lists:{}:{}", service_id.len(), service_id)
    }

    fn fail(
        &self,
        error: BackendError,
        service_id: &str,
        key: &str,
        operation: Operation,
    ) -> StorageError {
        error.into_storage_error(self.policy.as_ref(), service_id, key, operation)
    }

    fn decode(
        service_id: &str,
        key: &str,
        data: &str,
        operation: Operation,
    ) -> StorageResult<KeyValue> {
        KeyValue::decode(service_id, key, data)
            .map_err(|error| StorageError::malformed(service_id, key, operation, error))
    }

    fn encode(entry: &KeyValue, operation: Operation) -> StorageResult<String> {
        entry
            .encode()
            .map_err(|error| StorageError::malformed(&entry.service_id, &entry.key, operation, error))
    }
}

#[async_trait]
impl StorageEngine for RedisStorage {
    fn describe(&self) -> String {
        format!(
            "{}, timeout: {}",
            self.description,
            format_duration(self.command_timeout)
        )
    }

    async fn create(&self, service_id: &str, key: &str, value: &str) -> StorageResult<KeyValue> {
        let entry = KeyValue::new(service_id, key, value);
        let data = RedisStorage::encode(&entry, Operation::Create)?;

        let created = bounded(
            self.command_timeout,
            self.backend
                .hset_nx(&RedisStorage::entries_key(service_id), key, &data),
        )
        .await
        .map_err(|error| self.fail(error, service_id, key, Operation::Create))?;

        if created {
            Ok(entry)
        } else {
            Err(StorageError::conflict(service_id, key, Operation::Create))
        }
    }

    async fn read(&self, service_id: &str, key: &str) -> StorageResult<KeyValue> {
        let data = bounded(
            self.command_timeout,
            self.backend.hget(&RedisStorage::entries_key(service_id), key),
        )
        .await
        .map_err(|error| self.fail(error, service_id, key, Operation::Read))?
        .ok_or_else(|| StorageError::not_found(service_id, key, Operation::Read))?;

        RedisStorage::decode(service_id, key, &data, Operation::Read)
    }

    async fn update(&self, service_id: &str, key: &str, value: &str) -> StorageResult<KeyValue> {
        let hash = RedisStorage::entries_key(service_id);

        // The creation timestamp of the present entry is carried over...
        let mut current = bounded(self.command_timeout, self.backend.hget(&hash, key))
            .await
            .map_err(|error| self.fail(error, service_id, key, Operation::Update))?;

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let data = match current {
                Some(data) => data,
                None => return Err(StorageError::not_found(service_id, key, Operation::Update)),
            };

            let entry = RedisStorage::decode(service_id, key, &data, Operation::Update)?
                .with_value(value);
            let new_data = RedisStorage::encode(&entry, Operation::Update)?;

            // ...and the write only happens if nobody touched the entry in between.
            let previous = bounded(
                self.command_timeout,
                self.backend.hset_if_unchanged(&hash, key, &data, &new_data),
            )
            .await
            .map_err(|error| self.fail(error, service_id, key, Operation::Update))?;

            if previous.as_deref() == Some(data.as_str()) {
                return Ok(entry);
            }

            current = previous;
        }

        Err(StorageError::Retryable {
            service_id: service_id.to_owned(),
            key: key.to_owned(),
            operation: Operation::Update,
            reason: format!(
                "The entry was modified concurrently {} times in a row",
                MAX_UPDATE_ATTEMPTS
            ),
        })
    }

    async fn delete(&self, service_id: &str, key: &str) -> StorageResult<KeyValue> {
        let data = bounded(
            self.command_timeout,
            self.backend
                .htake(&RedisStorage::entries_key(service_id), key),
        )
        .await
        .map_err(|error| self.fail(error, service_id, key, Operation::Delete))?
        .ok_or_else(|| StorageError::not_found(service_id, key, Operation::Delete))?;

        RedisStorage::decode(service_id, key, &data, Operation::Delete)
    }

    async fn read_for_service(&self, service_id: &str) -> StorageResult<HashMap<String, KeyValue>> {
        let entries = bounded(
            self.command_timeout,
            self.backend.hgetall(&RedisStorage::entries_key(service_id)),
        )
        .await
        .map_err(|error| self.fail(error, service_id, "", Operation::ReadAll))?;

        Ok(entries
            .into_iter()
            .filter_map(
                |(key, data)| match KeyValue::decode(service_id, &key, &data) {
                    Ok(entry) => Some((key, entry)),
                    Err(error) => {
                        log::warn!(
                            "Skipping the malformed entry '{}' of service '{}': {}",
                            key,
                            service_id,
                            error
                        );
                        None
                    }
                },
            )
            .collect())
    }

    async fn delete_for_service(&self, service_id: &str) -> StorageResult<()> {
        bounded(
            self.command_timeout,
            self.backend.del(&RedisStorage::entries_key(service_id)),
        )
        .await
        .map_err(|error| self.fail(error, service_id, "", Operation::DeleteAll))
    }

    async fn store_list_item(
        &self,
        service_id: &str,
        list: &str,
        id: &str,
        entry: &str,
    ) -> StorageResult<()> {
        // The list is indexed first so that no stored item is ever missing from the index. An
        // indexed but empty list is skipped by read_all_lists.
        bounded(
            self.command_timeout,
            self.backend
                .sadd(&RedisStorage::list_index_key(service_id), list),
        )
        .await
        .map_err(|error| self.fail(error, service_id, list, Operation::Append))?;

        bounded(
            self.command_timeout,
            self.backend
                .hset(&RedisStorage::list_key(service_id, list), id, entry),
        )
        .await
        .map_err(|error| self.fail(error, service_id, list, Operation::Append))
    }

    async fn read_list(&self, service_id: &str, list: &str) -> StorageResult<ListItems> {
        bounded(
            self.command_timeout,
            self.backend
                .hgetall(&RedisStorage::list_key(service_id, list)),
        )
        .await
        .map_err(|error| self.fail(error, service_id, list, Operation::ReadList))
    }

    async fn read_all_lists(
        &self,
        service_id: &str,
    ) -> StorageResult<HashMap<String, ListItems>> {
        let lists = bounded(
            self.command_timeout,
            self.backend
                .smembers(&RedisStorage::list_index_key(service_id)),
        )
        .await
        .map_err(|error| self.fail(error, service_id, "", Operation::ReadAllLists))?;

        let mut result = HashMap::new();
        for list in lists {
            let items = self.read_list(service_id, &list).await?;
            // Lists which have been evicted completely are gone in Redis...
            if !items.is_empty() {
                let _ = result.insert(list, items);
            }
        }

        Ok(result)
    }

    async fn evict_list_items(
        &self,
        service_id: &str,
        list: &str,
        ids: &[String],
    ) -> StorageResult<()> {
        bounded(
            self.command_timeout,
            self.backend
                .hdel(&RedisStorage::list_key(service_id, list), ids),
        )
        .await
        .map_err(|error| self.fail(error, service_id, list, Operation::Evict))
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::backend::HashCommands;
    use crate::storage::policy::Reject;
    use crate::storage::redis::RedisStorage;
    use crate::storage::{KeyValue, StorageEngine, StorageError};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use redis::{ErrorKind, RedisError, RedisResult};
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Emulates the few Redis commands we need in memory.
    #[derive(Default)]
    struct FakeRedis {
        hashes: Mutex<HashMap<String, HashMap<String, String>>>,
        sets: Mutex<HashMap<String, HashSet<String>>>,
        out_of_memory: AtomicBool,
        stalled: AtomicBool,
        index_unavailable: AtomicBool,
        // Replaces a field right before the next conditional update is applied.
        interference: Mutex<Option<(String, String, String)>>,
    }

    impl FakeRedis {
        async fn check(&self, write: bool) -> RedisResult<()> {
            if self.stalled.load(Ordering::Acquire) {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            if write && self.out_of_memory.load(Ordering::Acquire) {
                return Err(RedisError::from((
                    ErrorKind::ResponseError,
                    "OOM",
                    "command not allowed when used memory > 'maxmemory'.".to_owned(),
                )));
            }

            Ok(())
        }

        fn field(&self, hash: &str, field: &str) -> Option<String> {
            self.hashes
                .lock()
                .unwrap()
                .get(hash)
                .and_then(|fields| fields.get(field).cloned())
        }

        fn put(&self, hash: &str, field: &str, value: &str) {
            let _ = self
                .hashes
                .lock()
                .unwrap()
                .entry(hash.to_owned())
                .or_default()
                .insert(field.to_owned(), value.to_owned());
        }
    }

    #[async_trait]
    impl HashCommands for Arc<FakeRedis> {
        async fn hset_nx(&self, hash: &str, field: &str, value: &str) -> RedisResult<bool> {
            self.check(true).await?;
            if self.field(hash, field).is_some() {
                Ok(false)
            } else {
                self.put(hash, field, value);
                Ok(true)
            }
        }

        async fn hset(&self, hash: &str, field: &str, value: &str) -> RedisResult<()> {
            self.check(true).await?;
            self.put(hash, field, value);
            Ok(())
        }

        async fn hset_if_unchanged(
            &self,
            hash: &str,
            field: &str,
            expected: &str,
            value: &str,
        ) -> RedisResult<Option<String>> {
            self.check(true).await?;
            if let Some((hash, field, value)) = self.interference.lock().unwrap().take() {
                self.put(&hash, &field, &value);
            }

            let previous = self.field(hash, field);
            if previous.as_deref() == Some(expected) {
                self.put(hash, field, value);
            }
            Ok(previous)
        }

        async fn hget(&self, hash: &str, field: &str) -> RedisResult<Option<String>> {
            self.check(false).await?;
            Ok(self.field(hash, field))
        }

        async fn htake(&self, hash: &str, field: &str) -> RedisResult<Option<String>> {
            self.check(false).await?;
            Ok(self
                .hashes
                .lock()
                .unwrap()
                .get_mut(hash)
                .and_then(|fields| fields.remove(field)))
        }

        async fn hgetall(&self, hash: &str) -> RedisResult<HashMap<String, String>> {
            self.check(false).await?;
            Ok(self
                .hashes
                .lock()
                .unwrap()
                .get(hash)
                .cloned()
                .unwrap_or_default())
        }

        async fn hdel(&self, hash: &str, fields: &[String]) -> RedisResult<()> {
            self.check(false).await?;
            if let Some(values) = self.hashes.lock().unwrap().get_mut(hash) {
                for field in fields {
                    let _ = values.remove(field);
                }
            }
            Ok(())
        }

        async fn del(&self, key: &str) -> RedisResult<()> {
            self.check(false).await?;
            let _ = self.hashes.lock().unwrap().remove(key);
            Ok(())
        }

        async fn sadd(&self, set: &str, member: &str) -> RedisResult<()> {
            self.check(true).await?;
            if self.index_unavailable.load(Ordering::Acquire) {
                return Err(RedisError::from((
                    ErrorKind::IoError,
                    "Connection dropped",
                )));
            }
            let _ = self
                .sets
                .lock()
                .unwrap()
                .entry(set.to_owned())
                .or_default()
                .insert(member.to_owned());
            Ok(())
        }

        async fn smembers(&self, set: &str) -> RedisResult<Vec<String>> {
            self.check(false).await?;
            Ok(self
                .sets
                .lock()
                .unwrap()
                .get(set)
                .map(|members| members.iter().cloned().collect())
                .unwrap_or_default())
        }
    }

    fn storage() -> (Arc<FakeRedis>, RedisStorage) {
        let fake = Arc::new(FakeRedis::default());
        let storage = RedisStorage::new(
            Box::new(fake.clone()),
            "fake".to_owned(),
            Duration::from_millis(100),
            Arc::new(Reject),
        );

        (fake, storage)
    }

    #[test]
    fn entries_are_stored_per_service() {
        crate::testing::test_async(async {
            let (fake, storage) = storage();

            let created = storage.create("gateway", "token", "abc").await.unwrap();
            let read = storage.read("gateway", "token").await.unwrap();
            assert_eq!(read, created);
            assert_eq!(
                fake.field("kv:gateway", "token").unwrap(),
                created.encode().unwrap()
            );

            // The same key of another service is a different entry...
            assert_eq!(
                storage.read("discovery", "token").await.unwrap_err().code(),
                "NOT_FOUND"
            );

            // A second create is rejected and the first value survives...
            let error = storage.create("gateway", "token", "xyz").await.unwrap_err();
            assert_eq!(matches!(error, StorageError::Conflict { .. }), true);
            assert_eq!(storage.read("gateway", "token").await.unwrap().value, "abc");
        });
    }

    #[test]
    fn updates_and_deletes_require_an_entry() {
        crate::testing::test_async(async {
            let (_, storage) = storage();

            assert_eq!(
                storage.update("gateway", "token", "abc").await.unwrap_err().code(),
                "NOT_FOUND"
            );
            assert_eq!(
                storage.read("gateway", "token").await.unwrap_err().code(),
                "NOT_FOUND"
            );

            let created = storage.create("gateway", "token", "abc").await.unwrap();
            let updated = storage.update("gateway", "token", "xyz").await.unwrap();
            assert_eq!(updated.value, "xyz");
            assert_eq!(updated.created, created.created);

            let deleted = storage.delete("gateway", "token").await.unwrap();
            assert_eq!(deleted.value, "xyz");
            assert_eq!(
                storage.read("gateway", "token").await.unwrap_err().code(),
                "NOT_FOUND"
            );
            assert_eq!(
                storage.delete("gateway", "token").await.unwrap_err().code(),
                "NOT_FOUND"
            );
        });
    }

    #[test]
    fn updates_never_overwrite_a_recreated_entry() {
        crate::testing::test_async(async {
            let (fake, storage) = storage();
            let _ = storage.create("gateway", "token", "abc").await.unwrap();

            // The entry is deleted and re-created while the update is in flight...
            let mut recreated = KeyValue::new("gateway", "token", "fresh");
            recreated.created = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
            let _ = fake.interference.lock().unwrap().replace((
                "kv:gateway".to_owned(),
                "token".to_owned(),
                recreated.encode().unwrap(),
            ));

            let updated = storage.update("gateway", "token", "xyz").await.unwrap();
            assert_eq!(updated.value, "xyz");
            assert_eq!(updated.created, recreated.created);

            let stored = storage.read("gateway", "token").await.unwrap();
            assert_eq!(stored, updated);
        });
    }

    #[test]
    fn malformed_entries_are_reported_or_skipped() {
        crate::testing::test_async(async {
            let (fake, storage) = storage();

            let _ = storage.create("gateway", "good", "abc").await.unwrap();
            fake.put("kv:gateway", "bad", "{\"key\":");
            fake.put(
                "kv:gateway",
                "renamed",
                &KeyValue::new("gateway", "other", "x").encode().unwrap(),
            );

            assert_eq!(
                storage.read("gateway", "bad").await.unwrap_err().code(),
                "MALFORMED_ENTRY"
            );
            assert_eq!(
                storage.read("gateway", "renamed").await.unwrap_err().code(),
                "MALFORMED_ENTRY"
            );

            let entries = storage.read_for_service("gateway").await.unwrap();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries["good"].value, "abc");

            assert_eq!(storage.read_for_service("unknown").await.unwrap().len(), 0);
        });
    }

    #[test]
    fn backend_failures_are_classified() {
        crate::testing::test_async(async {
            let (fake, storage) = storage();
            let _ = storage.create("gateway", "token", "abc").await.unwrap();

            fake.out_of_memory.store(true, Ordering::Release);
            assert_eq!(
                storage.create("gateway", "other", "abc").await.unwrap_err().code(),
                "INSUFFICIENT_STORAGE"
            );
            assert_eq!(
                storage.update("gateway", "token", "xyz").await.unwrap_err().code(),
                "INSUFFICIENT_STORAGE"
            );
            // Reads still work if the backend is full...
            assert_eq!(storage.read("gateway", "token").await.unwrap().value, "abc");
            fake.out_of_memory.store(false, Ordering::Release);

            fake.stalled.store(true, Ordering::Release);
            assert_eq!(
                storage.read("gateway", "token").await.unwrap_err().code(),
                "RETRYABLE"
            );
        });
    }

    #[test]
    fn lists_are_kept_per_service() {
        crate::testing::test_async(async {
            let (fake, storage) = storage();

            storage
                .store_list_item("gateway", "tokens", "t1", "first")
                .await
                .unwrap();
            storage
                .store_list_item("gateway", "tokens", "t1", "second")
                .await
                .unwrap();
            storage
                .store_list_item("gateway", "rules", "r1", "rule")
                .await
                .unwrap();
            assert_eq!(
                fake.field("list:7:gateway:tokens", "t1").unwrap(),
                "second"
            );

            let tokens = storage.read_list("gateway", "tokens").await.unwrap();
            assert_eq!(tokens.len(), 1);
            assert_eq!(tokens["t1"], "second");

            storage
                .evict_list_items("gateway", "tokens", &["unknown".to_owned()])
                .await
                .unwrap();
            assert_eq!(storage.read_list("gateway", "tokens").await.unwrap().len(), 1);

            storage
                .evict_list_items("gateway", "tokens", &["t1".to_owned()])
                .await
                .unwrap();
            let lists = storage.read_all_lists("gateway").await.unwrap();
            assert_eq!(lists.len(), 1);
            assert_eq!(lists["rules"]["r1"], "rule");

            assert_eq!(storage.read_all_lists("discovery").await.unwrap().len(), 0);
        });
    }

    #[test]
    fn list_items_are_only_stored_once_indexed() {
        crate::testing::test_async(async {
            let (fake, storage) = storage();

            fake.index_unavailable.store(true, Ordering::Release);
            assert_eq!(
                storage
                    .store_list_item("gateway", "tokens", "t1", "first")
                    .await
                    .unwrap_err()
                    .code(),
                "RETRYABLE"
            );
            assert_eq!(fake.field("list:7:gateway:tokens", "t1"), None);

            fake.index_unavailable.store(false, Ordering::Release);
            storage
                .store_list_item("gateway", "tokens", "t1", "first")
                .await
                .unwrap();
            let lists = storage.read_all_lists("gateway").await.unwrap();
            assert_eq!(lists["tokens"]["t1"], "first");
        });
    }

    #[test]
    fn deleting_a_service_only_drops_its_entries() {
        crate::testing::test_async(async {
            let (_, storage) = storage();
            let _ = storage.create("gateway", "a", "1").await.unwrap();
            let _ = storage.create("discovery", "a", "1").await.unwrap();

            storage.delete_for_service("gateway").await.unwrap();
            storage.delete_for_service("gateway").await.unwrap();

            assert_eq!(storage.read_for_service("gateway").await.unwrap().len(), 0);
            assert_eq!(storage.read_for_service("discovery").await.unwrap().len(), 1);
        });
    }
}
