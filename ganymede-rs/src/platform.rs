//! Provides a tiny registry which keeps all central components of a Ganymede node.
//!
//! The platform is more or less a map from type to **Arc<T>**. The [Builder](crate::builder::Builder)
//! registers the framework parts (config, commands, server) along with the selected storage
//! engine. Commands and background tasks then look up what they need.
//!
//! The platform also carries the central **is_running** flag. Once
//! [Platform::terminate](Platform::terminate) was called, all components are dropped and every loop
//! checking the flag winds down. Code which might run after shutdown was initiated should
//! therefore use [Platform::find](Platform::find) rather than [Platform::require](Platform::require).
//!
//! # Examples
//!
//! ```
//! # use std::sync::Arc;
//! # use ganymede::platform::Platform;
//! struct TenantDirectory {
//!     tenants: Vec<String>,
//! }
//!
//! struct UnknownService;
//!
//! let platform = Platform::new();
//! platform.register::<TenantDirectory>(Arc::new(TenantDirectory {
//!     tenants: vec!["gateway".to_owned()],
//! }));
//!
//! assert_eq!(platform.require::<TenantDirectory>().tenants.len(), 1);
//! assert_eq!(platform.find::<UnknownService>().is_none(), true);
//! assert_eq!(platform.is_running(), true);
//!
//! platform.terminate();
//! assert_eq!(platform.find::<TenantDirectory>().is_none(), true);
//! assert_eq!(platform.is_running(), false);
//! ```
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type Registry = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// Keeps all central components in a single place.
pub struct Platform {
    components: Mutex<Registry>,
    is_running: AtomicBool,
}

impl Platform {
    /// Creates a new and running platform.
    pub fn new() -> Arc<Self> {
        Arc::new(Platform {
            components: Mutex::new(HashMap::new()),
            is_running: AtomicBool::new(true),
        })
    }

    /// Registers a component, replacing any previously registered one of the same type.
    pub fn register<T>(&self, component: Arc<T>)
    where
        T: Any + Send + Sync,
    {
        let _ = self
            .lock_components()
            .insert(TypeId::of::<T>(), component);
    }

    /// Tries to resolve a previously registered component.
    ///
    /// # Examples
    /// ```
    /// # use ganymede::platform::Platform;
    /// # use std::sync::Arc;
    /// struct Limits {
    ///     max_entries: usize,
    /// }
    ///
    /// let platform = Platform::new();
    /// assert_eq!(platform.find::<Limits>().is_none(), true);
    ///
    /// platform.register(Arc::new(Limits { max_entries: 1024 }));
    /// assert_eq!(platform.find::<Limits>().unwrap().max_entries, 1024);
    /// ```
    pub fn find<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.lock_components()
            .get(&TypeId::of::<T>())
            .and_then(|entry| entry.clone().downcast::<T>().ok())
    }

    /// Resolves a component which is known to be present.
    ///
    /// # Panics
    /// Panics if the component isn't registered or if the platform is already shutting down.
    ///
    /// ```should_panic
    /// # use ganymede::platform::Platform;
    /// struct Missing;
    ///
    /// let platform = Platform::new();
    /// platform.require::<Missing>();
    /// ```
    pub fn require<T>(&self) -> Arc<T>
    where
        T: Any + Send + Sync,
    {
        if !self.is_running() {
            panic!(
                "The component {} was requested but the platform is already shutting down!",
                std::any::type_name::<T>()
            );
        }

        match self.find::<T>() {
            Some(component) => component,
            None => panic!(
                "The component {} is not registered in the platform!",
                std::any::type_name::<T>()
            ),
        }
    }

    /// Determines if [Platform::terminate](Platform::terminate) has not yet been called.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Drops all components and marks the platform as halted.
    pub fn terminate(&self) {
        self.lock_components().clear();
        self.is_running.store(false, Ordering::Release);
    }

    fn lock_components(&self) -> MutexGuard<'_, Registry> {
        // A poisoned lock only means that another thread panicked while inserting, the map
        // itself is still consistent...
        match self.components.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
