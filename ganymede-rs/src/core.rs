//! Provides a bunch of diagnostic and maintenance commands.
//!
//! Provides the following commands:
//! * **SYS.COMMANDS**: Lists all known commands, their number of calls and their average duration.
//! * **SYS.CONNECTIONS**: Lists all currently connected clients along with their service id.
//! * **SYS.KILL**: Terminates the connection to the given client (selected by its peer address).
//! * **SYS.SET_CONFIG**: Replaces the config file with the given YAML.
//! * **SYS.STORAGE**: Reports the active storage engine and capacity policy.
//!
//! [install](install) is invoked by the [Builder](crate::builder::Builder) unless disabled.
use std::sync::Arc;

use anyhow::Context;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::commands::{queue, Call, CommandDictionary, CommandError, CommandResult};
use crate::config::Config;
use crate::fmt::format_short_duration;
use crate::platform::Platform;
use crate::server::Server;
use crate::storage::Storage;

/// Enumerates the commands supported by this facility.
#[derive(FromPrimitive)]
enum Commands {
    Commands,
    Connections,
    Kill,
    SetConfig,
    Storage,
}

/// Installs the diagnostic commands into the given platform.
///
/// This is invoked by the [Builder](crate::builder::Builder) unless disabled.
pub fn install(platform: Arc<Platform>) {
    if let Some(commands) = platform.find::<CommandDictionary>() {
        let queue = actor(platform.clone());
        commands.register_command("SYS.COMMANDS", queue.clone(), Commands::Commands as usize);
        commands.register_command(
            "SYS.CONNECTIONS",
            queue.clone(),
            Commands::Connections as usize,
        );
        commands.register_command("SYS.KILL", queue.clone(), Commands::Kill as usize);
        commands.register_command(
            "SYS.SET_CONFIG",
            queue.clone(),
            Commands::SetConfig as usize,
        );
        commands.register_command("SYS.STORAGE", queue, Commands::Storage as usize);
    }
}

/// Receives incoming calls for the commands defined above.
///
/// The server, config and storage are optional so that the commands can also be used in
/// partially set up platforms.
fn actor(platform: Arc<Platform>) -> crate::commands::Queue {
    use crate::commands::ResultExt;

    let (queue, mut endpoint) = queue();

    crate::spawn!(async move {
        let commands = platform.require::<CommandDictionary>();

        while let Some(mut call) = endpoint.recv().await {
            match Commands::from_usize(call.token) {
                Some(Commands::Commands) => commands_command(&mut call, &commands).complete(call),
                Some(Commands::Connections) => {
                    connections_command(&mut call, platform.find::<Server>()).complete(call)
                }
                Some(Commands::Kill) => {
                    kill_command(&mut call, platform.find::<Server>()).complete(call)
                }
                Some(Commands::SetConfig) => {
                    set_config_command(&mut call, platform.find::<Config>())
                        .await
                        .complete(call)
                }
                Some(Commands::Storage) => {
                    storage_command(&mut call, platform.find::<Storage>()).complete(call)
                }
                None => call.handle_unknown_token(),
            }
        }
    });

    queue
}

fn connections_command(call: &mut Call, server: Option<Arc<Server>>) -> CommandResult {
    let connections = server.map(|server| server.connections()).unwrap_or_default();
    let mut result = String::new();

    result += format!("Open connections: {}\n\n", connections.len()).as_str();
    result += format!(
        "{:<25} {:<30} {:>10} {:>15}\n",
        "Remote Address", "Service", "Calls", "Avg. Duration"
    )
    .as_str();
    result += crate::response::SEPARATOR;

    for connection in connections {
        result += format!(
            "{:<25} {:<30} {:>10} {:>15}\n",
            &connection.peer_address,
            &connection.tenant,
            connection.commands.count(),
            format_short_duration(connection.commands.avg_micros())
        )
        .as_str();
    }
    result += crate::response::SEPARATOR;

    call.response.bulk(result)?;

    Ok(())
}

fn kill_command(call: &mut Call, server: Option<Arc<Server>>) -> CommandResult {
    call.request.expect_parameters(1)?;
    let peer_address = call.request.str_parameter(0)?;

    if server
        .map(|server| server.kill(peer_address))
        .unwrap_or(false)
    {
        call.response.ok()?;
        Ok(())
    } else {
        Err(CommandError::ServerError(anyhow::anyhow!(
            "Unknown peer: {}",
            peer_address
        )))
    }
}

async fn set_config_command(call: &mut Call, config: Option<Arc<Config>>) -> CommandResult {
    let new_config = call
        .request
        .str_parameter(0)
        .context("Expected a valid YAML config as parameter.")?;
    let config = config.ok_or_else(|| crate::server_error!("No config is present."))?;
    config.store(new_config).await?;

    call.response.ok()?;
    Ok(())
}

fn commands_command(call: &mut Call, commands: &Arc<CommandDictionary>) -> CommandResult {
    let command_list = commands.commands();
    let mut result = String::new();

    result += format!("{:<30} {:>10} {:>20}\n", "Name", "Calls", "Duration").as_str();
    result += crate::response::SEPARATOR;

    for cmd in command_list {
        result += format!(
            "{:<30} {:>10} {:>20}\n",
            &cmd.name,
            cmd.call_count(),
            format_short_duration(cmd.avg_duration())
        )
        .as_str();
    }
    result += crate::response::SEPARATOR;

    call.response.bulk(result)?;

    Ok(())
}

fn storage_command(call: &mut Call, storage: Option<Arc<Storage>>) -> CommandResult {
    let storage = storage.ok_or_else(|| crate::server_error!("No storage engine is installed."))?;

    let mut result = String::new();
    result += format!("{:<20} {}\n", "Engine:", storage.describe()).as_str();
    result += format!("{:<20} {}\n", "Capacity Policy:", storage.policy()).as_str();

    call.response.bulk(result)?;

    Ok(())
}
