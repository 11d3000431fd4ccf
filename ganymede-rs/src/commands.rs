//! Provides the dispatcher which delegates an incoming request to the matching implementation.
//!
//! At its core, a [CommandDictionary](CommandDictionary) is simply a hash map. For each known
//! command it points to a [Queue](Queue) and keeps a numeric token along. Once a command is
//! received, the request, a pre-initialized response, the token and the tenant of the connection
//! are wrapped in a [Call](Call) which is sent to the actor owning the queue. The actor completes
//! the call (most probably with the help of [ResultExt](ResultExt)) which sends the response back
//! through a oneshot channel.
//!
//! Each connection obtains its own [Dispatcher](Dispatcher) which is a readonly copy of the
//! dictionary. Once the server is set up, the dictionary never changes, therefore no locking is
//! required while dispatching.
//!
//! # Tenants
//!
//! A client announces the service it acts for via `CLIENT SETNAME <service-id>`. This name is
//! handed to every call as [Call::tenant](Call::tenant) so that the storage commands can scope all
//! data to the calling service.
//!
//! # Errors
//!
//! Handlers return a [CommandResult](CommandResult). The macros [server_error](server_error) and
//! [client_error](client_error) create the two generic error kinds, which are reported as
//! "-SERVER: ..." and "-CLIENT: ...". Any **anyhow::Error** is treated as client error. A
//! [StorageError](crate::storage::StorageError) is reported with its machine readable code, e.g.
//! "-NOT_FOUND ..." or "-CONFLICT ...".
//!
//! # Examples
//!
//! ```
//! # use num_derive::FromPrimitive;
//! # use num_traits::FromPrimitive;
//! # use ganymede::commands::{queue, Call, CommandDictionary, CommandResult, ResultExt};
//! # use ganymede::request::Request;
//! fn ping(call: &mut Call) -> CommandResult {
//!     call.response.simple("PONG")?;
//!     Ok(())
//! }
//!
//! fn whoami(call: &mut Call) -> CommandResult {
//!     let tenant = call.tenant()?.to_owned();
//!     call.response.bulk(tenant)?;
//!     Ok(())
//! }
//!
//! #[derive(FromPrimitive)]
//! enum TestCommands {
//!     Ping,
//!     WhoAmI,
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let (queue, mut endpoint) = queue();
//!     tokio::spawn(async move {
//!         while let Some(mut call) = endpoint.recv().await {
//!             match TestCommands::from_usize(call.token) {
//!                 Some(TestCommands::Ping) => ping(&mut call).complete(call),
//!                 Some(TestCommands::WhoAmI) => whoami(&mut call).complete(call),
//!                 _ => call.handle_unknown_token(),
//!             }
//!         }
//!     });
//!
//!     let commands = CommandDictionary::new();
//!     commands.register_command("TEST.PING", queue.clone(), TestCommands::Ping as usize);
//!     commands.register_command("TEST.WHOAMI", queue, TestCommands::WhoAmI as usize);
//!     let mut dispatcher = commands.dispatcher();
//!
//!     let result = dispatcher.invoke(Request::example(vec!["TEST.PING"]), None).await.unwrap();
//!     assert_eq!(std::str::from_utf8(&result[..]).unwrap(), "+PONG\r\n");
//!
//!     // Without a connection, there is no tenant...
//!     let result = dispatcher.invoke(Request::example(vec!["TEST.WHOAMI"]), None).await.unwrap();
//!     assert_eq!(std::str::from_utf8(&result[..]).unwrap().starts_with("-UNAUTHORIZED"), true);
//! }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::anyhow;
use bytes::BytesMut;

use crate::metrics::CallMetrics;
use crate::platform::Platform;
use crate::request::Request;
use crate::response::{OutputError, OutputResult, Response};
use crate::server::Connection;
use crate::storage::StorageError;

/// Represents an error when executing a command.
///
/// An **OutputError** signals that the response couldn't be written and the connection is
/// probably inconsistent. A **ServerError** signals an unexpected server-side problem. A
/// **ClientError** signals that the client sent invalid data. **Unauthorized** is used if a
/// tenant scoped command is invoked before the client announced its service id. A **Storage**
/// error is a well defined outcome of a storage operation which is reported with its error code.
#[derive(Debug)]
pub enum CommandError {
    /// The response couldn't be generated.
    OutputError(OutputError),
    /// The client sent invalid or inconsistent data.
    ClientError(anyhow::Error),
    /// An unexpected server-side problem occurred.
    ServerError(anyhow::Error),
    /// The connection didn't announce its tenant.
    Unauthorized(String),
    /// The storage engine rejected the operation.
    Storage(StorageError),
}

/// Creates a **CommandError** which represents a **ServerError**.
///
/// # Example
///
/// ```
/// use ganymede::commands::{Call, CommandResult};
/// fn my_command(call: &mut Call) -> CommandResult {
///     Err(ganymede::server_error!("We forgot to implement this command."))
/// }
/// ```
#[macro_export]
macro_rules! server_error {
    ($err:expr $(,)?) => ({
        $crate::commands::CommandError::ServerError(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::commands::CommandError::ServerError(anyhow::anyhow!($fmt, $($arg)*))
    };
}

/// Creates a **CommandError** which represents a **ClientError**.
///
/// # Example
///
/// ```
/// use ganymede::commands::{Call, CommandResult};
/// fn my_command(call: &mut Call) -> CommandResult {
///     if call.request.parameter_count() > 2 {
///         Err(ganymede::client_error!(
///             "This command only accepts 2 parameters but {} were provided",
///             call.request.parameter_count()
///         ))
///     } else {
///         call.response.ok()?;
///         Ok(())
///     }
/// }
/// ```
#[macro_export]
macro_rules! client_error {
    ($err:expr $(,)?) => ({
        $crate::commands::CommandError::ClientError(anyhow::anyhow!($err))
    });
    ($fmt:expr, $($arg:tt)*) => {
        $crate::commands::CommandError::ClientError(anyhow::anyhow!($fmt, $($arg)*))
    };
}

impl From<OutputError> for CommandError {
    fn from(output_error: OutputError) -> Self {
        CommandError::OutputError(output_error)
    }
}

impl From<anyhow::Error> for CommandError {
    fn from(error: anyhow::Error) -> Self {
        CommandError::ClientError(error)
    }
}

impl From<StorageError> for CommandError {
    fn from(error: StorageError) -> Self {
        CommandError::Storage(error)
    }
}

/// Represents the return type of command invocations.
///
/// The actual result is written into the response of the call, therefore only errors are
/// reported here.
pub type CommandResult = Result<(), CommandError>;

/// Permits to write `my_command(&mut call).complete(call)` instead of
/// `let result = my_command(&mut call); call.complete(result)`.
pub trait ResultExt {
    /// Completes the given call with the wrapped result.
    fn complete(self, call: Call);
}

impl ResultExt for CommandResult {
    fn complete(self, call: Call) {
        call.complete(self);
    }
}

/// Represents the invocation of a command.
pub struct Call {
    /// Contains the request as sent by the client.
    pub request: Request,

    /// Contains the response to be filled with the response data.
    pub response: Response,

    /// Contains the token of the command being called.
    ///
    /// Commonly a bunch of commands share a single queue, the token tells them apart.
    pub token: usize,

    tenant: Option<String>,
    callback: tokio::sync::oneshot::Sender<Result<BytesMut, OutputError>>,
}

impl Call {
    /// Returns the service id announced by the client via `CLIENT SETNAME`.
    pub fn tenant(&self) -> Result<&str, CommandError> {
        self.tenant.as_deref().ok_or_else(|| {
            CommandError::Unauthorized(format!(
                "{} requires the client to announce its service id via CLIENT SETNAME",
                self.request.command()
            ))
        })
    }

    /// Marks the command represented by this call as handled.
    ///
    /// On success, the response is sent back to the caller. Errors are rendered as RESP errors,
    /// except for an **OutputError** which is passed on so that the connection is closed.
    pub fn complete(self, result: CommandResult) {
        let result = match result {
            Ok(_) => self.response.complete(),
            Err(CommandError::OutputError(error)) => Err(error),
            Err(CommandError::ClientError(error)) => {
                error_response(|r| r.error(format!("CLIENT: {:#}", error)))
            }
            Err(CommandError::ServerError(error)) => {
                error_response(|r| r.error(format!("SERVER: {:#}", error)))
            }
            Err(CommandError::Unauthorized(message)) => {
                error_response(|r| r.coded_error("UNAUTHORIZED", &message))
            }
            Err(CommandError::Storage(error)) => {
                error_response(|r| r.coded_error(error.code(), error.to_string()))
            }
        };

        if self.callback.send(result).is_err() {
            log::error!("Failed to submit a result to a oneshot callback channel!");
        }
    }

    /// Completes the call with an error for a token the actor doesn't know.
    pub fn handle_unknown_token(self) {
        let token = self.token;
        self.complete(Err(CommandError::ServerError(anyhow::anyhow!(
            "Unknown token received: {}!",
            token
        ))));
    }
}

/// Renders an error into a fresh response, discarding anything a failed handler wrote so far.
fn error_response(
    writer: impl FnOnce(&mut Response) -> OutputResult,
) -> Result<BytesMut, OutputError> {
    let mut response = Response::new();
    writer(&mut response)?;
    response.complete()
}

/// Represents a queue which can be stored in a [CommandDictionary](CommandDictionary) in order
/// to receive [Calls](Call) to be handled.
pub type Queue = tokio::sync::mpsc::Sender<Call>;

/// Represents the receiving end of a [Queue](Queue) which is moved into an actor.
pub type Endpoint = tokio::sync::mpsc::Receiver<Call>;

/// Creates a new queue which connects an actor to the [CommandDictionary](CommandDictionary).
///
/// The queue is bounded (1024) as we'd rather reject commands than run out of memory in an
/// overload condition.
pub fn queue() -> (Queue, Endpoint) {
    tokio::sync::mpsc::channel(1024)
}

/// Wraps a command which as previously been registered.
pub struct Command {
    /// Contains the name of the command.
    pub name: &'static str,
    queue: Queue,
    token: usize,
    call_metrics: CallMetrics,
}

impl Command {
    /// Returns the number of invocations of this command.
    pub fn call_count(&self) -> u64 {
        self.call_metrics.count()
    }

    /// Returns the average call duration in microseconds.
    pub fn avg_duration(&self) -> u64 {
        self.call_metrics.avg_micros()
    }
}

/// Represents an internally mutable dictionary which maps commands to queues.
///
/// The dictionary isn't used to dispatch commands itself, this is the job of the
/// [Dispatcher](Dispatcher).
#[derive(Default)]
pub struct CommandDictionary {
    commands: Mutex<HashMap<&'static str, Arc<Command>>>,
}

/// Provides a readonly view of a [CommandDictionary](CommandDictionary) used to dispatch calls
/// into the appropriate queue.
pub struct Dispatcher {
    commands: HashMap<&'static str, (Arc<Command>, Queue)>,
}

impl CommandDictionary {
    /// Creates a new and empty dictionary.
    pub fn new() -> Self {
        CommandDictionary::default()
    }

    /// Creates and installs the default dictionary into the given **Platform**.
    ///
    /// This is automatically performed by the [Builder](crate::builder::Builder) unless disabled.
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let commands = Arc::new(CommandDictionary::new());
        platform.register::<CommandDictionary>(commands.clone());

        commands
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, Arc<Command>>> {
        match self.commands.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a command for the given name to be dispatched into the given queue.
    ///
    /// A name can only be registered once. Later registrations are ignored and logged.
    pub fn register_command(&self, name: &'static str, queue: Queue, token: usize) {
        let mut commands = self.lock();
        if commands.contains_key(name) {
            log::error!(
                "Not going to register command {} as there is already a command present for this name",
                name
            );
        } else {
            log::debug!("Registering command {}...", name);
            let _ = commands.insert(
                name,
                Arc::new(Command {
                    name,
                    queue,
                    token,
                    call_metrics: CallMetrics::new(),
                }),
            );
        }
    }

    /// Reports the usage metrics (and names) of all known commands, sorted by name.
    pub fn commands(&self) -> Vec<Arc<Command>> {
        let mut result: Vec<Arc<Command>> = self.lock().values().cloned().collect();
        result.sort_by_key(|command| command.name);

        result
    }

    /// Creates a readonly copy of the known commands and returns them as dispatcher.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            commands: self
                .lock()
                .values()
                .map(|command| (command.name, (command.clone(), command.queue.clone())))
                .collect(),
        }
    }
}

impl Dispatcher {
    /// Dispatches the given request to the appropriate queue and returns the result.
    ///
    /// Application level errors are already marshalled into RESP errors. An **Err** returned
    /// here signals that the protocol or IO channel might be inconsistent and that the connection
    /// should be closed.
    ///
    /// The connection (if any) provides the tenant of the call and is used by the built-in
    /// commands **QUIT** and **CLIENT**.
    pub async fn invoke(
        &mut self,
        request: Request,
        connection: Option<&Arc<Connection>>,
    ) -> Result<BytesMut, OutputError> {
        let response = Response::new();
        match self.commands.get_mut(request.command()) {
            Some((command, queue)) => {
                let tenant = connection.and_then(|connection| connection.tenant());
                Dispatcher::invoke_command(command, queue, request, response, tenant).await
            }
            // Built-ins are rare, therefore they are checked last...
            _ => self.handle_built_in(request, response, connection).await,
        }
    }

    /// Emulates the commonly used Redis commands **QUIT**, **CLIENT** and **PING**.
    ///
    /// `CLIENT SETNAME` stores the tenant of the connection. Other **CLIENT** sub commands (as
    /// sent by some client libraries during the handshake) are acknowledged and ignored.
    async fn handle_built_in(
        &mut self,
        request: Request,
        mut response: Response,
        connection: Option<&Arc<Connection>>,
    ) -> Result<BytesMut, OutputError> {
        match request.command().to_uppercase().as_str() {
            "QUIT" => {
                if let Some(connection) = connection {
                    connection.quit();
                }
                response.ok()?;
            }
            "CLIENT" => {
                let sub_command = request.str_parameter(0).unwrap_or_default().to_uppercase();
                match (sub_command.as_str(), request.str_parameter(1)) {
                    ("SETNAME", Ok(name)) if !name.trim().is_empty() => {
                        if let Some(connection) = connection {
                            connection.set_name(name);
                        }
                        response.ok()?;
                    }
                    ("SETNAME", _) => {
                        response.error("CLIENT: CLIENT SETNAME requires a non-empty service id")?
                    }
                    ("GETNAME", _) => match connection.and_then(|c| c.tenant()) {
                        Some(name) => response.bulk(name)?,
                        None => response.null()?,
                    },
                    _ => response.ok()?,
                }
            }
            "PING" => {
                if request.parameter_count() > 0 {
                    response.bulk(request.str_parameter(0)?)?;
                } else {
                    response.simple("PONG")?;
                }
            }
            _ => response.error(format!("CLIENT: Unknown command: {}", request.command()))?,
        }

        response.complete()
    }

    async fn invoke_command(
        command: &Arc<Command>,
        queue: &mut Queue,
        request: Request,
        response: Response,
        tenant: Option<String>,
    ) -> Result<BytesMut, OutputError> {
        let (callback, promise) = tokio::sync::oneshot::channel();
        let call = Call {
            request,
            response,
            token: command.token,
            tenant,
            callback,
        };

        let watch = Instant::now();
        if queue.send(call).await.is_err() {
            return Err(OutputError::ProtocolError(anyhow!(
                "Failed to submit command into queue!"
            )));
        }

        match promise.await {
            Ok(result) => {
                command
                    .call_metrics
                    .record(watch.elapsed().as_micros() as u64);
                result
            }
            _ => Err(OutputError::ProtocolError(anyhow!(
                "Command {} did not yield any result!",
                command.name
            ))),
        }
    }
}
