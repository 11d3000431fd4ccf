//! Contains the system configuration.
//!
//! Provides access to the system configuration which is loaded from the **config/settings.yml**
//! file. We observe this file for changes and reload it once a change is detected. Components
//! which can adapt to a new config (e.g. the server which re-binds its socket) attach themselves
//! to the [Config::notifier](Config::notifier).
//!
//! The **Config** itself can be obtained from the **Platform** once and then kept around. A
//! [Handle](Handle) obtained via **Config::current()** however should not be stored, as it will
//! not be updated once a new config has been loaded.
//!
//! The following keys are used by Ganymede itself:
//!
//! ```yaml
//! server:
//!     host: 0.0.0.0
//!     port: 2410
//! storage:
//!     mode: redis          # or: inmemory
//!     policy: reject
//!     redis:
//!         url: redis://127.0.0.1:6379
//!         command_timeout: 5s
//!     inmemory:
//!         max_entries: 100000
//! ```
//!
//! # Examples
//!
//! ```
//! # use ganymede::builder::Builder;
//! # use ganymede::config::Config;
//! # #[tokio::main]
//! # async fn main() {
//! # let platform = Builder::new().enable_config().build().await.unwrap();
//! let config = platform.require::<Config>();
//! config.load_from_string("storage:\n    mode: inmemory", None).unwrap();
//!
//! let handle = config.current();
//! assert_eq!(handle.query("storage.mode").as_str(), Some("inmemory"));
//! assert_eq!(handle.query("server.port").as_i64().unwrap_or(2410), 2410);
//! # }
//! ```
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use arc_swap::ArcSwap;
use yaml_rust::{Yaml, YamlLoader};

use crate::platform::Platform;

/// Provides access to the system configuration.
///
/// Most probably a config instance is installed by the [Builder](crate::builder::Builder) and
/// can be obtained via `platform.require::<Config>()`.
pub struct Config {
    filename: String,
    tx: tokio::sync::broadcast::Sender<()>,
    config: ArcSwap<(Yaml, Option<SystemTime>)>,
}

/// Represents the change listener.
///
/// Internally this is simply the receiver of a broadcast. The message itself carries no data,
/// receiving it means that the config has to be re-processed.
pub type ChangeNotifier = tokio::sync::broadcast::Receiver<()>;

/// Represents a handle to the currently loaded configuration.
pub struct Handle {
    config: Arc<(Yaml, Option<SystemTime>)>,
}

impl Config {
    /// Creates a new config reading the given file.
    ///
    /// Note that this will not install a change listener. This is only done by the
    /// [install](install) function.
    pub fn new(file: &str) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(1);
        Config {
            filename: file.to_owned(),
            config: ArcSwap::new(Arc::new((Yaml::Hash(Default::default()), None))),
            tx,
        }
    }

    /// Obtains a change notifier which receives a message once the config changed.
    pub fn notifier(&self) -> ChangeNotifier {
        self.tx.subscribe()
    }

    /// Obtains a handle to the currently loaded configuration.
    pub fn current(&self) -> Handle {
        Handle {
            config: self.config.load_full(),
        }
    }

    /// Determines the last modified date of the config file on disk.
    ///
    /// Within docker, an unmounted volume shows up as directory, therefore we only accept files.
    #[cfg(not(test))]
    async fn last_modified(&self) -> Option<SystemTime> {
        tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .and_then(|meta| meta.modified().ok())
    }

    /// Reads the underlying file.
    ///
    /// This is normally invoked by the framework itself.
    pub async fn load(&self) -> anyhow::Result<()> {
        log::info!("Loading config file {}...", &self.filename);

        if let Ok(metadata) = tokio::fs::metadata(&self.filename).await {
            if !metadata.is_file() {
                log::info!("Config file doesn't exist or is an unmounted docker volume - skipping config load.");
                return Ok(());
            }
        }

        let config_data = tokio::fs::read_to_string(&self.filename)
            .await
            .with_context(|| format!("Cannot load config file {}", &self.filename))?;

        let last_modified = tokio::fs::metadata(&self.filename)
            .await
            .ok()
            .and_then(|metadata| metadata.modified().ok());

        self.load_from_string(config_data.as_str(), last_modified)
    }

    /// Validates and writes the given config into the underlying file.
    ///
    /// The running system picks the change up via the change monitor.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::config::Config;
    /// # #[tokio::main]
    /// # async fn main() {
    /// let config = Config::new("ganymede_test_config.yml");
    /// std::fs::remove_file("ganymede_test_config.yml");
    ///
    /// assert_eq!(config.store("server:\n    port: 12345").await.is_ok(), true);
    /// assert_eq!(config.load().await.is_ok(), true);
    /// assert_eq!(config.current().query("server.port").as_i64(), Some(12345));
    ///
    /// // Invalid YAML is rejected and the file is left untouched...
    /// assert_eq!(config.store("server: \"test").await.is_err(), true);
    /// assert_eq!(config.load().await.is_ok(), true);
    /// assert_eq!(config.current().query("server.port").as_i64(), Some(12345));
    /// # }
    /// ```
    pub async fn store(&self, config: &str) -> anyhow::Result<()> {
        log::info!(
            "Programmatically updating the config file {}...",
            &self.filename
        );

        if let Err(error) = YamlLoader::load_from_str(config) {
            return Err(anyhow::anyhow!("Cannot parse config data: {}", error));
        }

        tokio::fs::write(&self.filename, config)
            .await
            .context("Failed to write to config file!")?;
        log::info!("Config has been updated successfully!");

        Ok(())
    }

    /// Loads a configuration from the given string instead of a file.
    ///
    /// This is intended to be used in test environments where we cannot / do not want to load
    /// a config file from disk.
    ///
    /// # Example
    ///
    /// ```
    /// # use ganymede::config::Config;
    /// let config = Config::new("somefile.yml");
    /// config.load_from_string("
    /// storage:
    ///     inmemory:
    ///         max_entries: 512
    /// ", None).unwrap();
    ///
    /// assert_eq!(config.current().query("storage.inmemory.max_entries").as_i64(), Some(512));
    /// assert_eq!(config.current().query("storage.redis.url").is_badvalue(), true);
    /// ```
    pub fn load_from_string(
        &self,
        data: &str,
        last_modified: Option<SystemTime>,
    ) -> anyhow::Result<()> {
        let mut docs = YamlLoader::load_from_str(data).map_err(|error| {
            anyhow::anyhow!("Cannot parse config file {}: {}", &self.filename, error)
        })?;

        let root = match docs.drain(..).next() {
            Some(hash @ Yaml::Hash(_)) => hash,
            _ => Yaml::Hash(Default::default()),
        };

        self.config.store(Arc::new((root, last_modified)));

        // Notify all listeners - we ignore if there are none...
        let _ = self.tx.send(());

        Ok(())
    }
}

impl Handle {
    /// Provides access to the root of the currently loaded configuration.
    pub fn config(&self) -> &Yaml {
        &self.config.0
    }

    /// Resolves a dotted path like `storage.redis.url`.
    ///
    /// Returns **Yaml::BadValue** if any part of the path is missing.
    pub fn query(&self, path: impl AsRef<str>) -> &Yaml {
        path.as_ref()
            .split('.')
            .filter(|segment| !segment.is_empty())
            .fold(&self.config.0, |node, segment| &node[segment])
    }

    /// Reads the given path as string or returns the default if absent.
    pub fn string_or(&self, path: impl AsRef<str>, default: &str) -> String {
        self.query(path).as_str().unwrap_or(default).to_owned()
    }

    /// Reads a duration like "5s" from the given path.
    ///
    /// Plain integers are treated as milliseconds. If the value is absent or invalid, the default
    /// is used (and an invalid value is logged).
    pub fn duration_or(&self, path: impl AsRef<str>, default: Duration) -> Duration {
        match self.query(path.as_ref()) {
            Yaml::Integer(millis) if *millis >= 0 => Duration::from_millis(*millis as u64),
            Yaml::String(value) => crate::fmt::parse_duration(value).unwrap_or_else(|error| {
                log::error!("Invalid duration for {}: {}", path.as_ref(), error);
                default
            }),
            _ => default,
        }
    }
}

/// Creates and installs a **Config** for the given platform.
///
/// This will read its contents from **config/settings.yml** and also install a change monitor for
/// this file. The monitor only compares the "last modified" date of the file. Therefore it is the
/// duty of each config user to gracefully handle partial config changes.
///
/// Note that this method is also called by the [Builder](crate::builder::Builder) unless the
/// **Config** part is disabled.
pub async fn install(platform: Arc<Platform>) {
    let path = Path::new("config").to_path_buf();
    if let Err(error) = tokio::fs::create_dir_all(path.clone()).await {
        log::warn!(
            "Failed to create config base directory {}: {}",
            path.to_string_lossy(),
            error
        )
    }

    let config = Arc::new(Config::new("config/settings.yml"));
    platform.register::<Config>(config.clone());

    if let Err(error) = config.load().await {
        log::error!("{:#}", error);
    }

    run_config_change_monitor(platform, config);
}

#[cfg(test)]
fn run_config_change_monitor(_platform: Arc<Platform>, _config: Arc<Config>) {
    // No automatic updates during testing...
}

#[cfg(not(test))]
fn run_config_change_monitor(platform: Arc<Platform>, config: Arc<Config>) {
    crate::spawn!(async move {
        while platform.is_running() {
            tokio::time::sleep(Duration::from_secs(2)).await;

            let last_modified = config.last_modified().await;
            let last_loaded = config.config.load().1;

            // Reload if a file is present and newer than the one previously loaded (or if none
            // has been loaded so far)...
            if last_modified.is_some() && (last_loaded.is_none() || last_modified > last_loaded) {
                match config.load().await {
                    Ok(_) => log::info!("System configuration was re-loaded."),
                    Err(error) => log::error!("Failed to re-load system config: {:#}", error),
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use crate::builder::Builder;
    use crate::config::Config;
    use std::time::{Duration, SystemTime};

    #[test]
    fn ensure_config_update_works() {
        crate::testing::test_async(async {
            let platform = Builder::new().enable_config().build().await.unwrap();
            let config = platform.require::<Config>();

            config
                .load_from_string("storage:\n    mode: redis", Some(SystemTime::now()))
                .unwrap();

            let mut change_notifier = config.notifier();
            let (tx, rx) = tokio::sync::oneshot::channel();
            crate::spawn!(async move {
                if change_notifier.recv().await.is_ok() {
                    tx.send(()).unwrap();
                }
            });

            assert_eq!(config.current().query("storage.mode").as_str(), Some("redis"));

            // A malformed config is rejected and the previous one stays active...
            assert_eq!(
                config
                    .load_from_string("storage: 'invalid", Some(SystemTime::now()))
                    .is_err(),
                true
            );
            assert_eq!(config.current().query("storage.mode").as_str(), Some("redis"));

            config
                .load_from_string("storage:\n    mode: inmemory", Some(SystemTime::now()))
                .unwrap();

            rx.await.unwrap();
            assert_eq!(
                config.current().query("storage.mode").as_str(),
                Some("inmemory")
            );
        });
    }

    #[test]
    fn durations_are_parsed_with_fallbacks() {
        let config = Config::new("unused.yml");
        config
            .load_from_string(
                "
redis:
    command_timeout: 2s
    connect_timeout: 1500
    broken_timeout: soon
",
                None,
            )
            .unwrap();

        let handle = config.current();
        let default = Duration::from_secs(5);
        assert_eq!(
            handle.duration_or("redis.command_timeout", default),
            Duration::from_secs(2)
        );
        assert_eq!(
            handle.duration_or("redis.connect_timeout", default),
            Duration::from_millis(1500)
        );
        assert_eq!(handle.duration_or("redis.broken_timeout", default), default);
        assert_eq!(handle.duration_or("redis.missing", default), default);
        assert_eq!(handle.string_or("redis.url", "redis://localhost"), "redis://localhost");
    }
}
