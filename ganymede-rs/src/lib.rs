//! Ganymede is a multi-tenant key-value caching service speaking the RESP protocol as defined by
//! Redis.
//!
//! # Introduction
//! **Ganymede** keeps small, opaque payloads on behalf of the services of a service mesh. Each
//! service (the **tenant**) announces itself via `CLIENT SETNAME` and from then on only sees its
//! own partition of entries. Next to plain scalar entries, a tenant can maintain **named lists**
//! (think of "all invalidated tokens" or "all invalidated rules") which are appended to and evicted
//! from by id.
//!
//! The actual data is kept by a [StorageEngine](storage::StorageEngine). Two engines are provided:
//! a **Redis** backed engine for production setups where several Ganymede nodes share their data
//! and an **in-memory** engine for single node or test setups. The engine is selected via the
//! config (**storage.mode**).
//!
//! To minimize the overhead of communication, we use the [RESP Protocol](https://redis.io/topics/protocol)
//! as defined by **Redis**. In contrast to HTTP this is way simpler to parse and handle while
//! also supporting zero-copy operations. Another benefit is, that for nearly every platform
//! there is already a Redis/RESP client available.
//!
//! # Consumer side
//! Next to the server, this crate also ships the building blocks used by the consumers of the
//! service:
//! * [CachingClient](client::CachingClient): a thin, stateless client for the commands above.
//! * [AffinityCache](affinity::AffinityCache): remembers which instance of a service was picked
//!   for a user so that subsequent requests are routed to the same instance.
//! * [retry_if_expired](retry::retry_if_expired): re-fetches a value exactly once if the first
//!   answer turned out to be stale.
//! * [CacheEvictor](eviction::CacheEvictor): batches and applies invalidations of derived caches
//!   once the topology of the service mesh changes.
//!
//! # Features
//! * **Ultra fast non allocating parser for RESP queries** (as sent by redis-cli and redis clients).
//!   The built-in server will use a single buffer per connection to read, parse and process queries.
//! * **100% Async/Await** - the whole server builds upon [tokio](https://tokio.rs/) and async/await
//!   primitives as provided by Rust. Also, all commands handlers are build as actors.
//! * **Reload-aware config facility** which permits to update the configuration during operation.
//!   Therefore, no restart is required when changing the IP binding or port.
//! * **Build in management commands**. The *core* module provides a set of management commands to
//!   monitor and inspect the state of the system.
//!
//! # Examples
//! A short example on how to initialize the library can be found here [Builder](builder::Builder).
//! The commands offered to tenants are listed in [storage::commands].
#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
#![warn(missing_docs)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod affinity;
pub mod builder;
pub mod client;
pub mod commands;
pub mod config;
pub mod core;
pub mod eviction;
pub mod fmt;
pub mod metrics;
pub mod platform;
pub mod request;
pub mod response;
pub mod retry;
pub mod server;
pub mod signals;
pub mod storage;

/// Contains the version of the Ganymede library.
pub const GANYMEDE_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Ganymede build being used.
pub const GANYMEDE_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// framework, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Integration tests build several platforms within one process...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned join handle.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate ganymede;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}

#[cfg(test)]
mod testing {
    use crate::builder::Builder;
    use crate::platform::Platform;
    use crate::server::Server;
    use redis::{Connection, RedisError};
    use std::sync::{Arc, Mutex};
    use tokio::time::Duration;

    /// The address of the server started by integration tests.
    pub const TEST_SERVER_URL: &str = "redis://127.0.0.1:1503";

    lazy_static::lazy_static! {
        /// Provides a global lock which has to be acquired if a test operates on shared
        /// resources. This is our test port (1503) on which we start our local server for
        /// integration tests. Using this lock, we can still execute all other tests in parallel
        /// and only block if required.
        pub static ref SHARED_TEST_RESOURCES: Mutex<()> = Mutex::new(());
    }

    /// Executes async code within a single threaded tokio runtime.
    pub fn test_async<F: std::future::Future>(future: F) {
        use tokio::runtime;

        let rt = runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let _ = rt.block_on(future);
    }

    /// Builds a platform serving on the test port (1503) backed by an in-memory storage engine.
    ///
    /// The given lines are placed below **storage** and therefore have to be indented by four
    /// spaces.
    pub async fn start_test_server(storage_config: &str) -> Arc<Platform> {
        let platform = Builder::new()
            .enable_all()
            .with_settings(format!(
                "
server:
    port: 1503
storage:
    mode: inmemory
{}
",
                storage_config
            ))
            .build()
            .await
            .unwrap();

        Server::fork_and_await(&platform.require::<Server>()).await;

        platform
    }

    /// Executes a blocking Redis query in an async fashion.
    ///
    /// This is required as we must not block tokio in any way.
    pub async fn query_redis_async<T, Q>(query: Q) -> Option<T>
    where
        Q: FnOnce(&mut Connection) -> Result<T, RedisError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(|| {
            let client = redis::Client::open(TEST_SERVER_URL).unwrap();
            let mut con = client
                .get_connection_with_timeout(Duration::from_secs(5))
                .unwrap();
            query(&mut con)
        })
        .await;

        match result {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }
}
