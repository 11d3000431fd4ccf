//! Remembers which instance of a service was chosen for a user.
//!
//! A gateway which balances the requests of a user across the instances of a service keeps
//! routing the user to the same instance once a decision was made. These decisions are kept in
//! an [AffinityCache](AffinityCache).
//!
//! Records are always kept in a local, sharded map so that the routing path never waits for a
//! global lock. Optionally, a [CachingClient](crate::client::CachingClient) can be attached, which
//! shares the decisions between several gateway instances. The remote side is an optimization:
//! if it fails, the failure is logged and the local map is used.
//!
//! Records are never swept. Readers which care about the age of a record use
//! [retrieve_unexpired](AffinityCache::retrieve_unexpired), which drops an outdated record and
//! looks it up once more. Once the topology changes, the [CacheEvictor](crate::eviction::CacheEvictor)
//! drops the local records of the affected services, as the cache is an
//! [EvictionSink](crate::eviction::EvictionSink). The point in time of each eviction is kept so
//! that remote records which were created before it are treated as absent as well.
//!
//! Users and services are compared case-insensitively.
//!
//! # Example
//!
//! ```
//! # use ganymede::affinity::{AffinityCache, AffinityRecord};
//! # #[tokio::main]
//! # async fn main() {
//! let cache = AffinityCache::new();
//! cache.store("alice", "discovery", AffinityRecord::new("discovery-1")).await;
//!
//! let record = cache.retrieve("alice", "discovery").await.unwrap();
//! assert_eq!(record.instance_id, "discovery-1");
//! assert_eq!(cache.retrieve("bob", "discovery").await.is_none(), true);
//! # }
//! ```
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::client::CachingClient;
use crate::eviction::EvictionSink;
use crate::retry::{retry_if_expired_async, Expirable};

/// Identifies the routing decision for a user and a service.
///
/// Being a struct, two pairs never collide, even if they contain the separator used for the
/// remote key. Both parts are stored in lower case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffinityKey {
    /// The user being routed.
    pub user: String,

    /// The service the user is routed to.
    pub service: String,
}

impl AffinityKey {
    /// Creates a key for the given user and service.
    pub fn new(user: &str, service: &str) -> Self {
        AffinityKey {
            user: user.to_lowercase(),
            service: service.to_lowercase(),
        }
    }

    /// Returns the key used when storing the record remotely.
    ///
    /// The user is prefixed with its length to keep the key unambiguous.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::affinity::AffinityKey;
    /// assert_eq!(AffinityKey::new("Alice", "svcA").remote_key(), "lb.5:alice:svca");
    /// assert_ne!(
    ///     AffinityKey::new("a:b", "c").remote_key(),
    ///     AffinityKey::new("a", "b:c").remote_key()
    /// );
    /// ```
    pub fn remote_key(&self) -> String {
        format!("lb.{}:{}:{}", self.user.len(), self.user, self.service)
    }
}

/// Represents a routing decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRecord {
    /// The id of the chosen instance.
    pub instance_id: String,

    /// The point in time when the decision was made.
    pub created_at: DateTime<Utc>,
}

impl AffinityRecord {
    /// Creates a record for a decision made just now.
    pub fn new(instance_id: impl Into<String>) -> Self {
        AffinityRecord {
            instance_id: instance_id.into(),
            created_at: Utc::now().trunc_subsecs(3),
        }
    }

    /// Determines if this record is older than the given age.
    pub fn is_older_than(&self, max_age: Duration) -> bool {
        (Utc::now() - self.created_at)
            .to_std()
            .map(|age| age > max_age)
            .unwrap_or(false)
    }
}

/// Wraps a record along with the age limit applied by the reader.
struct AgedRecord {
    record: AffinityRecord,
    max_age: Duration,
}

impl Expirable for AgedRecord {
    fn is_expired(&self) -> bool {
        self.record.is_older_than(self.max_age)
    }
}

/// Stores routing decisions per user and service.
#[derive(Default)]
pub struct AffinityCache {
    local: DashMap<AffinityKey, AffinityRecord>,
    remote: Option<CachingClient>,
    // Timestamps in microseconds, 0 means never evicted.
    full_eviction: AtomicI64,
    service_evictions: DashMap<String, i64>,
}

impl AffinityCache {
    /// Creates a cache which only keeps its records locally.
    pub fn new() -> Self {
        AffinityCache::default()
    }

    /// Creates a cache which shares its records via the given client.
    pub fn with_remote(client: CachingClient) -> Self {
        AffinityCache {
            remote: Some(client),
            ..AffinityCache::default()
        }
    }

    /// Stores the given record, replacing any previous decision for the user and service.
    pub async fn store(&self, user: &str, service: &str, record: AffinityRecord) {
        let key = AffinityKey::new(user, service);

        if let Some(remote) = &self.remote {
            store_remote(remote, &key, &record).await;
        }

        let _ = self.local.insert(key, record);
    }

    /// Returns the decision for the user and service (if any).
    ///
    /// If a remote is attached, its record takes precedence and the local map is only used if the
    /// remote fails.
    pub async fn retrieve(&self, user: &str, service: &str) -> Option<AffinityRecord> {
        let key = AffinityKey::new(user, service);

        if let Some(remote) = &self.remote {
            match read_remote(remote, &key).await {
                Ok(Some(record)) if self.is_evicted(&key, &record) => {
                    log::debug!(
                        "Ignoring the remote affinity of '{}' for '{}' as it predates an eviction.",
                        user,
                        service
                    );
                    let _ = self.local.remove(&key);
                    return None;
                }
                Ok(Some(record)) => {
                    let _ = self.local.insert(key, record.clone());
                    return Some(record);
                }
                Ok(None) => {
                    let _ = self.local.remove(&key);
                    return None;
                }
                Err(error) => log::warn!(
                    "Cannot read the affinity of '{}' for '{}' remotely, using the local record: {}",
                    user,
                    service,
                    error
                ),
            }
        }

        self.local.get(&key).map(|record| record.value().clone())
    }

    /// Removes the decision for the user and service.
    pub async fn delete(&self, user: &str, service: &str) {
        let key = AffinityKey::new(user, service);
        let _ = self.local.remove(&key);

        if let Some(remote) = &self.remote {
            if let Err(error) = remote.delete(&key.remote_key()).await {
                if !error.is_not_found() {
                    log::warn!(
                        "Cannot delete the affinity of '{}' for '{}' remotely: {}",
                        user,
                        service,
                        error
                    );
                }
            }
        }
    }

    /// Returns the decision for the user and service unless it is older than the given age.
    ///
    /// An outdated record is deleted and the lookup is repeated once, as another gateway might
    /// have stored a fresh decision in the meantime. Whatever the second lookup yields is returned.
    pub async fn retrieve_unexpired(
        &self,
        user: &str,
        service: &str,
        max_age: Duration,
    ) -> Option<AffinityRecord> {
        retry_if_expired_async(
            || async move {
                self.retrieve(user, service)
                    .await
                    .map(|record| AgedRecord { record, max_age })
            },
            |_| self.delete(user, service),
        )
        .await
        .map(|aged| aged.record)
    }

    /// Determines if the record was created before the last eviction of its service.
    fn is_evicted(&self, key: &AffinityKey, record: &AffinityRecord) -> bool {
        let created = record.created_at.timestamp_micros();

        let full_eviction = self.full_eviction.load(Ordering::Acquire);
        if full_eviction > 0 && created <= full_eviction {
            return true;
        }

        self.service_evictions
            .get(&key.service)
            .map(|evicted| created <= *evicted)
            .unwrap_or(false)
    }

    /// Returns the number of locally known decisions.
    pub fn len(&self) -> usize {
        self.local.len()
    }

    /// Determines if no decisions are known locally.
    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }
}

async fn store_remote(remote: &CachingClient, key: &AffinityKey, record: &AffinityRecord) {
    let data = match serde_json::to_string(record) {
        Ok(data) => data,
        Err(error) => {
            log::warn!("Cannot serialize the affinity record {:?}: {}", record, error);
            return;
        }
    };

    let remote_key = key.remote_key();
    let result = match remote.create(&remote_key, &data).await {
        Err(error) if error.is_conflict() => remote.update(&remote_key, &data).await,
        result => result,
    };

    if let Err(error) = result {
        log::warn!(
            "Cannot store the affinity of '{}' for '{}' remotely: {}",
            key.user,
            key.service,
            error
        );
    }
}

async fn read_remote(
    remote: &CachingClient,
    key: &AffinityKey,
) -> anyhow::Result<Option<AffinityRecord>> {
    match remote.read(&key.remote_key()).await {
        Ok(entry) => Ok(Some(serde_json::from_str(&entry.value)?)),
        Err(error) if error.is_not_found() => Ok(None),
        Err(error) => Err(error.into()),
    }
}

impl EvictionSink for AffinityCache {
    fn evict_service(&self, service_id: &str) {
        let service = service_id.to_lowercase();
        if self.remote.is_some() {
            let _ = self
                .service_evictions
                .insert(service.clone(), Utc::now().timestamp_micros());
        }

        self.local.retain(|key, _| key.service != service);
    }

    fn evict_all(&self) {
        if self.remote.is_some() {
            self.full_eviction
                .store(Utc::now().timestamp_micros(), Ordering::Release);
        }

        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use crate::affinity::{AffinityCache, AffinityRecord};
    use crate::client::CachingClient;
    use crate::eviction::{CacheEvictor, EvictionSink, TopologyEvent};
    use crate::testing::{test_async, TEST_SERVER_URL};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn records_are_kept_per_user_and_service() {
        test_async(async {
            let cache = AffinityCache::new();
            let record = AffinityRecord::new("svcA-1");

            cache.store("alice", "svcA", record.clone()).await;
            assert_eq!(cache.retrieve("alice", "svcA").await, Some(record.clone()));

            cache
                .store("alice", "svcB", AffinityRecord::new("svcB-1"))
                .await;
            assert_eq!(cache.retrieve("alice", "svcA").await, Some(record));

            cache.delete("alice", "svcA").await;
            assert_eq!(cache.retrieve("alice", "svcA").await, None);
            assert_eq!(
                cache.retrieve("alice", "svcB").await.unwrap().instance_id,
                "svcB-1"
            );
        });
    }

    #[test]
    fn separators_do_not_collide() {
        test_async(async {
            let cache = AffinityCache::new();
            cache.store("a:b", "c", AffinityRecord::new("first")).await;
            cache.store("a", "b:c", AffinityRecord::new("second")).await;

            assert_eq!(cache.len(), 2);
            assert_eq!(
                cache.retrieve("a:b", "c").await.unwrap().instance_id,
                "first"
            );
        });
    }

    #[test]
    fn outdated_records_are_dropped() {
        test_async(async {
            let cache = AffinityCache::new();
            let mut record = AffinityRecord::new("svcA-1");
            record.created_at = Utc::now() - chrono::Duration::minutes(10);
            cache.store("alice", "svcA", record.clone()).await;

            assert_eq!(
                cache
                    .retrieve_unexpired("alice", "svcA", Duration::from_secs(3600))
                    .await,
                Some(record)
            );
            assert_eq!(
                cache
                    .retrieve_unexpired("alice", "svcA", Duration::from_secs(60))
                    .await,
                None
            );
            assert_eq!(cache.is_empty(), true);
        });
    }

    #[test]
    fn users_and_services_ignore_case() {
        test_async(async {
            let cache = AffinityCache::new();
            cache.store("Alice", "SvcA", AffinityRecord::new("svcA-1")).await;

            assert_eq!(
                cache.retrieve("alice", "svca").await.unwrap().instance_id,
                "svcA-1"
            );

            cache.evict_service("SVCA");
            assert_eq!(cache.is_empty(), true);
        });
    }

    #[test]
    fn topology_changes_evict_local_records() {
        test_async(async {
            let cache = Arc::new(AffinityCache::new());
            cache.store("alice", "svcA", AffinityRecord::new("svcA-1")).await;
            cache.store("bob", "svcA", AffinityRecord::new("svcA-2")).await;
            cache.store("alice", "svcB", AffinityRecord::new("svcB-1")).await;

            let evictor = CacheEvictor::new(vec![cache.clone()]);
            evictor.handle(TopologyEvent::ServiceChanged("svcA".to_owned()));
            assert_eq!(cache.len(), 1);
            assert_eq!(cache.retrieve("alice", "svcB").await.is_some(), true);

            cache.evict_all();
            assert_eq!(cache.is_empty(), true);
        });
    }

    #[test]
    fn records_are_shared_via_the_remote() {
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let platform = crate::testing::start_test_server("").await;

            let first = AffinityCache::with_remote(
                CachingClient::connect(TEST_SERVER_URL, "gateway")
                    .await
                    .unwrap(),
            );
            let second = AffinityCache::with_remote(
                CachingClient::connect(TEST_SERVER_URL, "gateway")
                    .await
                    .unwrap(),
            );

            let record = AffinityRecord::new("svcA-1");
            first.store("alice", "svcA", record.clone()).await;
            assert_eq!(second.retrieve("alice", "svcA").await, Some(record));

            // Storing again replaces the remote record...
            let replacement = AffinityRecord::new("svcA-2");
            second.store("alice", "svcA", replacement.clone()).await;
            assert_eq!(first.retrieve("alice", "svcA").await, Some(replacement));

            // ...and deleting it is visible to all gateways.
            second.delete("alice", "svcA").await;
            assert_eq!(first.retrieve("alice", "svcA").await, None);

            // Evicting a service hides the remote records which were created before...
            first
                .store("alice", "svcA", AffinityRecord::new("svcA-3"))
                .await;
            first.store("bob", "svcB", AffinityRecord::new("svcB-1")).await;
            first.evict_service("svcA");
            assert_eq!(first.retrieve("alice", "svcA").await, None);
            assert_eq!(first.retrieve("bob", "svcB").await.is_some(), true);

            // ...but not the ones stored afterwards.
            tokio::time::sleep(Duration::from_millis(2)).await;
            let fresh = AffinityRecord::new("svcA-4");
            first.store("alice", "svcA", fresh.clone()).await;
            assert_eq!(first.retrieve("alice", "svcA").await, Some(fresh));

            first.evict_all();
            assert_eq!(first.retrieve("alice", "svcA").await, None);
            assert_eq!(first.retrieve("bob", "svcB").await, None);

            platform.terminate();
        });
    }
}
