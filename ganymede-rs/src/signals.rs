//! Terminates the platform once **CTRL+C** or **SIGHUP** is received.
//!
//! Stopping the platform makes the server close its socket and all connection loops as well as
//! the topology listeners wind down within their polling interval.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::platform::Platform;

/// Installs the signal listener for the given platform.
///
/// This is automatically called by the [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: Arc<Platform>) {
    crate::spawn!(async move {
        let mut sig_hup = match tokio::signal::unix::signal(SignalKind::hangup()) {
            Ok(signal) => signal,
            Err(error) => {
                log::error!("Cannot listen for SIGHUP: {}", error);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                log::info!("Received CTRL-C. Shutting down Ganymede...");
            },
            _ = sig_hup.recv() => {
                log::info!("Received SIGHUP. Shutting down Ganymede...");
            }
        }

        platform.terminate();
    });
}
