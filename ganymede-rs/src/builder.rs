//! Provides a builder which sets up a Ganymede instance.
//!
//! A Ganymede instance consists of a few [components](Component) which are registered in a
//! [Platform](crate::platform::Platform): the config, the command dictionary, the storage engine
//! and the server. Each of them can be selectively enabled or disabled, which is mostly useful in
//! tests.
//!
//! Installing the storage engine connects to the configured backend. As the service is useless
//! without it, [build](Builder::build) fails if this isn't possible.
//!
//! # Example
//! Setting up the service with all components enabled:
//! ```no_run
//! # use ganymede::builder::Builder;
//! # use ganymede::server::Server;
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Builder::new().enable_all().build().await?;
//!     platform.require::<Server>().event_loop().await;
//!
//!     Ok(())
//! }
//! ```
use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;

use crate::config::Config;
use crate::platform::Platform;
use crate::{init_logging, GANYMEDE_REVISION, GANYMEDE_VERSION};

/// Enumerates the components which can be installed by a [Builder](Builder).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    /// Initializes **simplelog** to log to stdout, which is all that is needed when running
    /// within a container.
    Logging,

    /// Terminates the platform once **CTRL-C** or **SIGHUP** is received. See
    /// [signals](crate::signals).
    Signals,

    /// Installs the [Config](crate::config::Config) and loads the **settings.yml**.
    Config,

    /// Installs the [CommandDictionary](crate::commands::CommandDictionary).
    Commands,

    /// Registers the **SYS.*** diagnostic and maintenance commands. See [core](crate::core).
    /// Requires [Commands](Component::Commands).
    CoreCommands,

    /// Connects to the configured storage engine and registers the **CACHE.*** and **LIST.***
    /// commands. See [storage](crate::storage). Requires [Config](Component::Config).
    Storage,

    /// Installs the [Server](crate::server::Server). Note that the event loop still has to be
    /// started via `platform.require::<Server>().event_loop().await`.
    Server,
}

impl Component {
    const ALL: [Component; 7] = [
        Component::Logging,
        Component::Signals,
        Component::Config,
        Component::Commands,
        Component::CoreCommands,
        Component::Storage,
        Component::Server,
    ];
}

/// Creates and initializes the components of a Ganymede instance.
///
/// # Example
/// Setting up a platform which serves the storage commands from memory, but has no server:
/// ```
/// # use ganymede::builder::{Builder, Component};
/// # use ganymede::commands::CommandDictionary;
/// # use ganymede::server::Server;
/// # use ganymede::storage::Storage;
/// # #[tokio::main]
/// # async fn main() {
/// let platform = Builder::new()
///     .enable_all()
///     .disable(Component::Server)
///     .disable(Component::Signals)
///     .with_settings("storage:\n    inmemory:\n        max_entries: 64")
///     .build()
///     .await
///     .unwrap();
///
/// assert_eq!(platform.require::<Storage>().describe(), "in-memory (64 entries max)");
/// assert_eq!(platform.find::<CommandDictionary>().is_some(), true);
/// assert_eq!(platform.find::<Server>().is_none(), true);
/// # }
/// ```
#[derive(Default)]
pub struct Builder {
    components: HashSet<Component>,
    settings: Option<String>,
}

impl Builder {
    /// Creates a new builder with no components enabled.
    pub fn new() -> Self {
        Builder::default()
    }

    /// Enables all components.
    ///
    /// Selected components can be turned off again using [disable](Builder::disable).
    pub fn enable_all(mut self) -> Self {
        self.components.extend(Component::ALL.iter().copied());
        self
    }

    /// Enables the given component.
    pub fn enable(mut self, component: Component) -> Self {
        let _ = self.components.insert(component);
        self
    }

    /// Disables the given component, e.g. after [enable_all](Builder::enable_all) has been used.
    pub fn disable(mut self, component: Component) -> Self {
        let _ = self.components.remove(&component);
        self
    }

    /// Enables the [Config](Component::Config).
    pub fn enable_config(self) -> Self {
        self.enable(Component::Config)
    }

    /// Enables the [CommandDictionary](Component::Commands).
    pub fn enable_commands(self) -> Self {
        self.enable(Component::Commands)
    }

    /// Enables the [storage engine](Component::Storage) along with the config it is read from
    /// and the commands it registers.
    pub fn enable_storage(self) -> Self {
        self.enable_config()
            .enable_commands()
            .enable(Component::Storage)
    }

    /// Loads the given YAML into the config instead of waiting for the **settings.yml**.
    ///
    /// The settings are applied before the storage engine is installed, therefore they can
    /// select the engine to use. Note that a later change of the **settings.yml** replaces them.
    pub fn with_settings(mut self, settings: impl Into<String>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    fn is_enabled(&self, component: Component) -> bool {
        self.components.contains(&component)
    }

    /// Builds the [Platform](crate::platform::Platform) registry with all the enabled components
    /// being registered.
    ///
    /// Fails if the settings are invalid or if the storage engine cannot be installed.
    pub async fn build(self) -> anyhow::Result<Arc<Platform>> {
        let platform = Platform::new();

        if self.is_enabled(Component::Logging) {
            init_logging();
        }

        log::info!(
            "GANYMEDE (v {} - rev {}) running on {} core(s) in {} CPU(s)",
            GANYMEDE_VERSION,
            GANYMEDE_REVISION,
            num_cpus::get(),
            num_cpus::get_physical()
        );

        if self.is_enabled(Component::Signals) {
            crate::signals::install(platform.clone());
        }

        if self.is_enabled(Component::Config) {
            crate::config::install(platform.clone()).await;

            if let Some(settings) = &self.settings {
                platform
                    .require::<Config>()
                    .load_from_string(settings, None)
                    .context("Invalid settings")?;
            }
        }

        if self.is_enabled(Component::Server) {
            let _ = crate::server::Server::install(&platform);
        }

        if self.is_enabled(Component::Commands) {
            let _ = crate::commands::CommandDictionary::install(&platform);

            if self.is_enabled(Component::CoreCommands) {
                crate::core::install(platform.clone());
            }
        }

        if self.is_enabled(Component::Storage) {
            let _ = crate::storage::install(platform.clone())
                .await
                .context("Cannot set up the storage engine")?;
        }

        Ok(platform)
    }
}
