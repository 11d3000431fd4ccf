//! Provides a storage engine which keeps all data in the local process.
//!
//! This is used for single instance setups and tests. The number of stored items (scalar entries
//! plus list items over all services) is limited by **storage.inmemory.max_entries**. Once the
//! limit is reached, writes which would add an item are handed to the capacity policy. Replacing
//! an existing entry or list item is always permitted.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::storage::policy::CapacityPolicy;
use crate::storage::{
    KeyValue, ListItems, Operation, StorageEngine, StorageError, StorageResult,
};

/// Determines the maximal number of items if **storage.inmemory.max_entries** isn't set.
pub const DEFAULT_MAX_ENTRIES: usize = 100_000;

#[derive(Default)]
struct Partition {
    entries: HashMap<String, KeyValue>,
    lists: HashMap<String, ListItems>,
}

#[derive(Default)]
struct Contents {
    partitions: HashMap<String, Partition>,
    items: usize,
}

/// Keeps all entries and lists in memory.
pub struct InMemoryStorage {
    contents: Mutex<Contents>,
    max_entries: usize,
    policy: Arc<dyn CapacityPolicy>,
}

impl InMemoryStorage {
    /// Creates a new and empty storage which holds at most the given number of items.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::storage::memory::InMemoryStorage;
    /// # use ganymede::storage::policy::Reject;
    /// # use ganymede::storage::StorageEngine;
    /// # use std::sync::Arc;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let storage = InMemoryStorage::new(1, Arc::new(Reject));
    /// storage.create("gateway", "token", "abc").await.unwrap();
    ///
    /// let error = storage.create("gateway", "other", "abc").await.unwrap_err();
    /// assert_eq!(error.code(), "INSUFFICIENT_STORAGE");
    /// # }
    /// ```
    pub fn new(max_entries: usize, policy: Arc<dyn CapacityPolicy>) -> Self {
        InMemoryStorage {
            contents: Mutex::new(Contents::default()),
            max_entries,
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Contents> {
        match self.contents.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn ensure_capacity(
        &self,
        contents: &Contents,
        service_id: &str,
        key: &str,
        operation: Operation,
    ) -> StorageResult<()> {
        if contents.items >= self.max_entries {
            Err(self
                .policy
                .on_capacity_exhausted(service_id, key, operation))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StorageEngine for InMemoryStorage {
    fn describe(&self) -> String {
        format!("in-memory ({} entries max)", self.max_entries)
    }

    async fn create(&self, service_id: &str, key: &str, value: &str) -> StorageResult<KeyValue> {
        let mut contents = self.lock();
        if contents
            .partitions
            .get(service_id)
            .map(|partition| partition.entries.contains_key(key))
            .unwrap_or(false)
        {
            return Err(StorageError::conflict(service_id, key, Operation::Create));
        }
        self.ensure_capacity(&contents, service_id, key, Operation::Create)?;

        let entry = KeyValue::new(service_id, key, value);
        let _ = contents
            .partitions
            .entry(service_id.to_owned())
            .or_default()
            .entries
            .insert(key.to_owned(), entry.clone());
        contents.items += 1;

        Ok(entry)
    }

    async fn read(&self, service_id: &str, key: &str) -> StorageResult<KeyValue> {
        self.lock()
            .partitions
            .get(service_id)
            .and_then(|partition| partition.entries.get(key))
            .cloned()
            .ok_or_else(|| StorageError::not_found(service_id, key, Operation::Read))
    }

    async fn update(&self, service_id: &str, key: &str, value: &str) -> StorageResult<KeyValue> {
        let mut contents = self.lock();
        let current = contents
            .partitions
            .get_mut(service_id)
            .and_then(|partition| partition.entries.get_mut(key))
            .ok_or_else(|| StorageError::not_found(service_id, key, Operation::Update))?;

        *current = current.with_value(value);
        Ok(current.clone())
    }

    async fn delete(&self, service_id: &str, key: &str) -> StorageResult<KeyValue> {
        let mut contents = self.lock();
        let entry = contents
            .partitions
            .get_mut(service_id)
            .and_then(|partition| partition.entries.remove(key))
            .ok_or_else(|| StorageError::not_found(service_id, key, Operation::Delete))?;
        contents.items -= 1;

        Ok(entry)
    }

    async fn read_for_service(&self, service_id: &str) -> StorageResult<HashMap<String, KeyValue>> {
        Ok(self
            .lock()
            .partitions
            .get(service_id)
            .map(|partition| partition.entries.clone())
            .unwrap_or_default())
    }

    async fn delete_for_service(&self, service_id: &str) -> StorageResult<()> {
        let mut contents = self.lock();
        let removed = contents
            .partitions
            .get_mut(service_id)
            .map(|partition| std::mem::take(&mut partition.entries).len())
            .unwrap_or(0);
        contents.items -= removed;

        Ok(())
    }

    async fn store_list_item(
        &self,
        service_id: &str,
        list: &str,
        id: &str,
        entry: &str,
    ) -> StorageResult<()> {
        let mut contents = self.lock();
        let present = contents
            .partitions
            .get(service_id)
            .and_then(|partition| partition.lists.get(list))
            .map(|items| items.contains_key(id))
            .unwrap_or(false);
        if !present {
            self.ensure_capacity(&contents, service_id, list, Operation::Append)?;
            contents.items += 1;
        }

        let _ = contents
            .partitions
            .entry(service_id.to_owned())
            .or_default()
            .lists
            .entry(list.to_owned())
            .or_default()
            .insert(id.to_owned(), entry.to_owned());

        Ok(())
    }

    async fn read_list(&self, service_id: &str, list: &str) -> StorageResult<ListItems> {
        Ok(self
            .lock()
            .partitions
            .get(service_id)
            .and_then(|partition| partition.lists.get(list))
            .cloned()
            .unwrap_or_default())
    }

    async fn read_all_lists(
        &self,
        service_id: &str,
    ) -> StorageResult<HashMap<String, ListItems>> {
        Ok(self
            .lock()
            .partitions
            .get(service_id)
            .map(|partition| {
                partition
                    .lists
                    .iter()
                    .filter(|(_, items)| !items.is_empty())
                    .map(|(list, items)| (list.clone(), items.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn evict_list_items(
        &self,
        service_id: &str,
        list: &str,
        ids: &[String],
    ) -> StorageResult<()> {
        let mut contents = self.lock();
        let removed = match contents
            .partitions
            .get_mut(service_id)
            .and_then(|partition| partition.lists.get_mut(list))
        {
            Some(items) => ids
                .iter()
                .filter(|id| items.remove(id.as_str()).is_some())
                .count(),
            None => 0,
        };
        contents.items -= removed;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::memory::InMemoryStorage;
    use crate::storage::policy::Reject;
    use crate::storage::{StorageEngine, StorageError};
    use std::sync::Arc;

    #[test]
    fn crud_operations_behave_like_redis() {
        crate::testing::test_async(async {
            let storage = InMemoryStorage::new(100, Arc::new(Reject));

            let created = storage.create("gateway", "token", "abc").await.unwrap();
            assert_eq!(created.service_id, "gateway");
            assert_eq!(storage.read("gateway", "token").await.unwrap(), created);

            let error = storage.create("gateway", "token", "xyz").await.unwrap_err();
            assert_eq!(matches!(error, StorageError::Conflict { .. }), true);
            assert_eq!(storage.read("gateway", "token").await.unwrap().value, "abc");

            assert_eq!(
                storage.update("gateway", "missing", "x").await.unwrap_err().code(),
                "NOT_FOUND"
            );
            assert_eq!(
                storage.read("gateway", "missing").await.unwrap_err().code(),
                "NOT_FOUND"
            );

            let updated = storage.update("gateway", "token", "xyz").await.unwrap();
            assert_eq!(updated.created, created.created);

            let deleted = storage.delete("gateway", "token").await.unwrap();
            assert_eq!(deleted.value, "xyz");
            assert_eq!(
                storage.read("gateway", "token").await.unwrap_err().code(),
                "NOT_FOUND"
            );
        });
    }

    #[test]
    fn concurrent_creates_have_a_single_winner() {
        crate::testing::test_async(async {
            let storage = Arc::new(InMemoryStorage::new(100, Arc::new(Reject)));

            let mut tasks = Vec::new();
            for value in 0..10 {
                let storage = storage.clone();
                tasks.push(tokio::spawn(async move {
                    storage
                        .create("gateway", "token", &value.to_string())
                        .await
                        .is_ok()
                }));
            }

            let mut winners = 0;
            for task in tasks {
                if task.await.unwrap() {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
        });
    }

    #[test]
    fn capacity_is_enforced_for_new_items_only() {
        crate::testing::test_async(async {
            let storage = InMemoryStorage::new(2, Arc::new(Reject));

            let _ = storage.create("gateway", "a", "1").await.unwrap();
            storage
                .store_list_item("gateway", "tokens", "t1", "x")
                .await
                .unwrap();

            assert_eq!(
                storage.create("gateway", "b", "1").await.unwrap_err().code(),
                "INSUFFICIENT_STORAGE"
            );
            assert_eq!(
                storage
                    .store_list_item("gateway", "tokens", "t2", "x")
                    .await
                    .unwrap_err()
                    .code(),
                "INSUFFICIENT_STORAGE"
            );

            // Replacing is fine...
            let _ = storage.update("gateway", "a", "2").await.unwrap();
            storage
                .store_list_item("gateway", "tokens", "t1", "y")
                .await
                .unwrap();

            // ...and removing frees up space.
            storage
                .evict_list_items("gateway", "tokens", &["t1".to_owned()])
                .await
                .unwrap();
            let _ = storage.create("gateway", "b", "1").await.unwrap();

            storage.delete_for_service("gateway").await.unwrap();
            let _ = storage.create("gateway", "c", "1").await.unwrap();
        });
    }

    #[test]
    fn lists_support_append_and_evict() {
        crate::testing::test_async(async {
            let storage = InMemoryStorage::new(100, Arc::new(Reject));

            storage
                .store_list_item("gateway", "tokens", "t1", "first")
                .await
                .unwrap();
            storage
                .store_list_item("gateway", "tokens", "t1", "second")
                .await
                .unwrap();

            let tokens = storage.read_list("gateway", "tokens").await.unwrap();
            assert_eq!(tokens.len(), 1);
            assert_eq!(tokens["t1"], "second");

            storage
                .evict_list_items("gateway", "tokens", &["t9".to_owned()])
                .await
                .unwrap();
            assert_eq!(storage.read_all_lists("gateway").await.unwrap()["tokens"].len(), 1);

            assert_eq!(storage.read_list("gateway", "rules").await.unwrap().len(), 0);
            assert_eq!(storage.read_all_lists("discovery").await.unwrap().len(), 0);
        });
    }
}
