//! Invalidates derived caches once the service topology changes.
//!
//! Components which cache data derived from the topology (e.g. which instance serves a user)
//! implement [EvictionSink](EvictionSink) and are handed to a [CacheEvictor](CacheEvictor) when
//! it is created. Changes are first collected into a batch, which is either a set of service ids
//! or "evict everything". A [flush](CacheEvictor::flush) then applies the batch to all sinks and
//! resets it.
//!
//! Topology changes are evicted twice: once when the change is announced (see
//! [announce_service_change](CacheEvictor::announce_service_change)) and once more when the
//! refreshed topology has actually been applied and the batch is flushed. An entry which was
//! re-populated from the stale topology in between is therefore dropped by the second eviction.
//!
//! # Example
//!
//! ```
//! # use ganymede::eviction::{CacheEvictor, EvictionSink};
//! # use std::sync::{Arc, Mutex};
//! #[derive(Default)]
//! struct Routes(Mutex<Vec<String>>);
//!
//! impl EvictionSink for Routes {
//!     fn evict_service(&self, service_id: &str) {
//!         self.0.lock().unwrap().retain(|route| route != service_id);
//!     }
//!
//!     fn evict_all(&self) {
//!         self.0.lock().unwrap().clear();
//!     }
//! }
//!
//! let routes = Arc::new(Routes::default());
//! routes.0.lock().unwrap().push("discovery".to_owned());
//!
//! let evictor = CacheEvictor::new(vec![routes.clone()]);
//! evictor.request_evict_service("discovery");
//! evictor.flush();
//!
//! assert_eq!(routes.0.lock().unwrap().is_empty(), true);
//! ```
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::platform::Platform;
use crate::spawn;

/// Describes a cache which holds data derived from the service topology.
pub trait EvictionSink: Send + Sync {
    /// Drops all data related to the given service.
    fn evict_service(&self, service_id: &str);

    /// Drops all data.
    fn evict_all(&self);
}

/// Enumerates the topology changes a [CacheEvictor](CacheEvictor) reacts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// The instances of the given service changed.
    ServiceChanged(String),

    /// The whole topology is being reloaded.
    FullReload,

    /// A refreshed topology has been applied.
    RefreshApplied,
}

/// Contains the pending evictions.
///
/// If **evict_all** is set, **service_ids** is always empty.
#[derive(Default, Debug)]
struct EvictionBatch {
    evict_all: bool,
    service_ids: Vec<String>,
}

/// Collects eviction requests and applies them to all sinks.
pub struct CacheEvictor {
    sinks: Vec<Arc<dyn EvictionSink>>,
    batch: Mutex<EvictionBatch>,
}

impl CacheEvictor {
    /// Creates an evictor for the given sinks.
    pub fn new(sinks: Vec<Arc<dyn EvictionSink>>) -> Self {
        CacheEvictor {
            sinks,
            batch: Mutex::new(EvictionBatch::default()),
        }
    }

    fn lock_batch(&self) -> MutexGuard<'_, EvictionBatch> {
        match self.batch.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Schedules the eviction of the given service.
    ///
    /// This is ignored if everything is going to be evicted anyway.
    pub fn request_evict_service(&self, service_id: &str) {
        let mut batch = self.lock_batch();
        if !batch.evict_all && !batch.service_ids.iter().any(|id| id == service_id) {
            batch.service_ids.push(service_id.to_owned());
        }
    }

    /// Schedules the eviction of all data.
    pub fn request_evict_all(&self) {
        let mut batch = self.lock_batch();
        batch.evict_all = true;
        batch.service_ids.clear();
    }

    /// Applies the pending evictions to all sinks and resets the batch.
    ///
    /// The sinks are invoked while the batch is locked so that concurrent requests are part of
    /// either this flush or the next one.
    pub fn flush(&self) {
        let mut batch = self.lock_batch();

        if batch.evict_all {
            log::debug!("Evicting all cached topology data...");
            for sink in &self.sinks {
                sink.evict_all();
            }
        } else if !batch.service_ids.is_empty() {
            log::debug!(
                "Evicting cached topology data of: {}",
                batch.service_ids.join(", ")
            );
            for service_id in &batch.service_ids {
                for sink in &self.sinks {
                    sink.evict_service(service_id);
                }
            }
        }

        *batch = EvictionBatch::default();
    }

    /// Evicts the given service in all sinks right away and keeps it pending for the next flush.
    ///
    /// This is the first phase of a topology change: the sinks drop their data as soon as the
    /// change is announced and once more when the refreshed topology has been applied.
    pub fn announce_service_change(&self, service_id: &str) {
        let mut batch = self.lock_batch();

        log::debug!("Topology change announced for: {}", service_id);
        for sink in &self.sinks {
            sink.evict_service(service_id);
        }

        if !batch.evict_all && !batch.service_ids.iter().any(|id| id == service_id) {
            batch.service_ids.push(service_id.to_owned());
        }
    }

    /// Evicts all data in all sinks right away and keeps a full eviction pending for the next
    /// flush.
    pub fn announce_full_reload(&self) {
        let mut batch = self.lock_batch();

        log::debug!("Full topology reload announced...");
        for sink in &self.sinks {
            sink.evict_all();
        }

        batch.evict_all = true;
        batch.service_ids.clear();
    }

    /// Processes a single topology event.
    pub fn handle(&self, event: TopologyEvent) {
        match event {
            TopologyEvent::ServiceChanged(service_id) => self.announce_service_change(&service_id),
            TopologyEvent::FullReload => self.announce_full_reload(),
            TopologyEvent::RefreshApplied => self.flush(),
        }
    }

    /// Processes the events received via the given channel in a separate task.
    ///
    /// The task stops once the platform is terminated or the channel is closed.
    pub fn listen(self: &Arc<Self>, platform: Arc<Platform>, mut events: mpsc::Receiver<TopologyEvent>) {
        let evictor = self.clone();
        spawn!(async move {
            while platform.is_running() {
                match tokio::time::timeout(Duration::from_millis(500), events.recv()).await {
                    Ok(Some(event)) => evictor.handle(event),
                    Ok(None) => return,
                    // Re-check if the platform is still running...
                    Err(_) => (),
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use crate::eviction::{CacheEvictor, EvictionSink, TopologyEvent};
    use crate::platform::Platform;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records all evictions.
    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl EvictionSink for RecordingSink {
        fn evict_service(&self, service_id: &str) {
            self.calls.lock().unwrap().push(service_id.to_owned());
        }

        fn evict_all(&self) {
            self.calls.lock().unwrap().push("*".to_owned());
        }
    }

    fn evictor() -> (Arc<RecordingSink>, Arc<RecordingSink>, Arc<CacheEvictor>) {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let evictor = Arc::new(CacheEvictor::new(vec![first.clone(), second.clone()]));

        (first, second, evictor)
    }

    #[test]
    fn services_are_evicted_in_all_sinks() {
        let (first, second, evictor) = evictor();

        evictor.request_evict_service("A");
        evictor.request_evict_service("B");
        evictor.request_evict_service("A");
        evictor.flush();

        assert_eq!(first.calls(), vec!["A", "B"]);
        assert_eq!(second.calls(), vec!["A", "B"]);

        // The batch has been reset...
        evictor.flush();
        assert_eq!(first.calls().len(), 2);
    }

    #[test]
    fn evict_all_supersedes_services() {
        let (first, second, evictor) = evictor();

        evictor.request_evict_service("A");
        evictor.request_evict_all();
        evictor.request_evict_service("B");
        evictor.flush();

        assert_eq!(first.calls(), vec!["*"]);
        assert_eq!(second.calls(), vec!["*"]);
    }

    #[test]
    fn announcements_are_evicted_twice() {
        let (first, second, evictor) = evictor();

        evictor.handle(TopologyEvent::ServiceChanged("A".to_owned()));
        assert_eq!(first.calls(), vec!["A"]);

        // A request which arrives while the refresh is running...
        evictor.request_evict_service("B");
        evictor.handle(TopologyEvent::RefreshApplied);
        assert_eq!(first.calls(), vec!["A", "A", "B"]);
        assert_eq!(second.calls(), vec!["A", "A", "B"]);

        // The batch has been reset by the refresh...
        evictor.handle(TopologyEvent::RefreshApplied);
        assert_eq!(first.calls().len(), 3);

        evictor.handle(TopologyEvent::FullReload);
        evictor.handle(TopologyEvent::RefreshApplied);
        assert_eq!(first.calls(), vec!["A", "A", "B", "*", "*"]);
    }

    #[test]
    fn events_are_received_via_a_channel() {
        crate::testing::test_async(async {
            let platform = Platform::new();
            let (first, _, evictor) = evictor();
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            evictor.listen(platform.clone(), rx);

            tx.send(TopologyEvent::ServiceChanged("A".to_owned()))
                .await
                .unwrap();
            tx.send(TopologyEvent::FullReload).await.unwrap();

            while first.calls().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert_eq!(first.calls(), vec!["A", "*"]);

            platform.terminate();
        });
    }
}
