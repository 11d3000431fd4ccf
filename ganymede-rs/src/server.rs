//! Contains the RESP server of Ganymede.
//!
//! Opens a server socket on the configured port (**server.port** or 2410 as fallback) and binds
//! it to the configured IP (**server.host** or 0.0.0.0 as fallback). Each connected client sends
//! RESP requests and receives the appropriate responses.
//!
//! If the socket cannot be bound (e.g. as an old instance is still shutting down), the server
//! keeps retrying every 500ms. Also, the server listens for config changes and relocates to
//! another address if necessary.
//!
//! Each connection is expected to announce the service it acts for via `CLIENT SETNAME`. This
//! name is the tenant of all storage commands issued via this connection.
//!
//! # Example
//!
//! ```no_run
//! use ganymede::builder::Builder;
//! use ganymede::config::Config;
//! use ganymede::server::Server;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let platform = Builder::new().enable_all().build().await?;
//!
//!     platform.require::<Config>().load_from_string("
//!         server:
//!             port: 1503
//!     ", None)?;
//!
//!     platform.require::<Server>().event_loop().await;
//!
//!     Ok(())
//! }
//! ```
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::WriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::commands::{CommandDictionary, Dispatcher};
use crate::config::Config;
use crate::metrics::CallMetrics;
use crate::platform::Platform;
use crate::request::Request;
use crate::response::OutputError;
use crate::spawn;

/// Specifies how long we wait for incoming data before re-checking if the connection is still
/// supposed to run.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Determines the pre-allocated receive buffer size for incoming requests.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Specifies how long we wait for a new connection before re-checking if the platform is still
/// running.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Represents a client connection.
pub struct Connection {
    peer_address: String,
    active: AtomicBool,
    commands: CallMetrics,
    name: ArcSwap<Option<String>>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.peer_address == other.peer_address
    }
}

impl Connection {
    /// Creates a new and active connection for the given peer.
    pub fn new(peer_address: impl Into<String>) -> Self {
        Connection {
            peer_address: peer_address.into(),
            active: AtomicBool::new(true),
            commands: CallMetrics::new(),
            name: ArcSwap::new(Arc::new(None)),
        }
    }

    /// Returns the remote address of this connection.
    pub fn peer_address(&self) -> &str {
        &self.peer_address
    }

    /// Determines if the connection is active or if a termination has been requested.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Terminates the connection.
    pub fn quit(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Stores the name of the connected client, which is the service id it acts for.
    pub fn set_name(&self, name: &str) {
        self.name.store(Arc::new(Some(name.to_owned())));
    }

    /// Returns the service id announced via `CLIENT SETNAME` (if any).
    pub fn tenant(&self) -> Option<String> {
        self.name.load().as_ref().clone()
    }

    /// Provides the metrics of the commands executed via this connection.
    pub fn commands(&self) -> &CallMetrics {
        &self.commands
    }
}

/// Provides some metadata for a client connection.
pub struct ConnectionInfo {
    /// Contains the peer address of the client being connected.
    pub peer_address: String,

    /// Contains the tenant (service id) of the connection or an empty string if none was
    /// announced yet.
    pub tenant: String,

    /// Contains the number of commands which have been received along with their average
    /// runtime.
    pub commands: CallMetrics,
}

/// Represents a server which manages all TCP connections.
pub struct Server {
    running: AtomicBool,
    current_address: Mutex<Option<String>>,
    platform: Arc<Platform>,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl Server {
    /// Creates and installs a **Server** into the given **Platform**.
    ///
    /// Note that this is called by the [Builder](crate::builder::Builder) unless disabled. The
    /// server itself is started via [event_loop](Server::event_loop).
    pub fn install(platform: &Arc<Platform>) -> Arc<Self> {
        let server = Arc::new(Server {
            running: AtomicBool::new(false),
            current_address: Mutex::new(None),
            platform: platform.clone(),
            connections: Mutex::new(Vec::new()),
        });

        platform.register::<Server>(server.clone());

        server
    }

    fn lock_connections(&self) -> MutexGuard<'_, Vec<Arc<Connection>>> {
        match self.connections.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Lists all currently active connections.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.lock_connections()
            .iter()
            .map(|connection| ConnectionInfo {
                peer_address: connection.peer_address.clone(),
                tenant: connection.tenant().unwrap_or_default(),
                commands: connection.commands.clone(),
            })
            .collect()
    }

    /// Kills the connection of the given peer address.
    pub fn kill(&self, peer_address: &str) -> bool {
        self.lock_connections()
            .iter()
            .find(|connection| connection.peer_address == peer_address)
            .map(|connection| connection.quit())
            .is_some()
    }

    fn add_connection(&self, connection: Arc<Connection>) {
        self.lock_connections().push(connection);
    }

    fn remove_connection(&self, connection: Arc<Connection>) {
        let mut connections = self.lock_connections();
        if let Some(index) = connections.iter().position(|other| *other == connection) {
            let _ = connections.remove(index);
        }
    }

    /// Determines if the server socket should keep listening.
    ///
    /// This is toggled to false if the configured address changed so that the **event_loop**
    /// binds a new socket.
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Determines the server address based on the current configuration.
    fn address(&self) -> String {
        self.platform
            .find::<Config>()
            .map(|config| {
                let handle = config.current();
                format!(
                    "{}:{}",
                    handle.query("server.host").as_str().unwrap_or("0.0.0.0"),
                    handle
                        .query("server.port")
                        .as_i64()
                        .filter(|port| *port > 0 && *port <= u16::MAX as i64)
                        .unwrap_or(2410)
                )
            })
            .unwrap_or_else(|| "0.0.0.0:2410".to_owned())
    }

    /// Starts the event loop in a separate task.
    pub fn fork(server: &Arc<Server>) {
        let cloned_server = server.clone();
        spawn!(async move {
            cloned_server.event_loop().await;
        });
    }

    /// Starts the event loop in a separate task and waits until the socket is bound.
    ///
    /// This is intended to be used in test environments.
    pub async fn fork_and_await(server: &Arc<Server>) {
        Server::fork(server);

        while server.current_address().is_none() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Returns the address the server socket is currently bound to.
    pub fn current_address(&self) -> Option<String> {
        match self.current_address.lock() {
            Ok(address) => address.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_current_address(&self, address: Option<String>) {
        match self.current_address.lock() {
            Ok(mut current) => *current = address,
            Err(poisoned) => *poisoned.into_inner() = address,
        }
    }

    /// Binds the server socket to the configured address and serves incoming connections.
    ///
    /// Returns once the platform is terminated.
    pub async fn event_loop(&self) {
        let mut address = String::new();
        let mut last_bind_error_reported: Option<Instant> = None;

        while self.platform.is_running() {
            // Started for the first time or restarted due to a config change...
            if !self.is_running() {
                address = self.address();
                self.running.store(true, Ordering::Release);
            }

            match TcpListener::bind(&address).await {
                Ok(mut listener) => {
                    log::info!("Opened server socket on {}...", &address);
                    self.set_current_address(Some(address.clone()));
                    self.server_loop(&mut listener).await;
                    self.set_current_address(None);
                    log::info!("Closing server socket on {}.", &address);
                }
                Err(error) => {
                    // Only log every 5s, as we retry every 500ms...
                    if last_bind_error_reported
                        .map(|reported| reported.elapsed().as_secs() > 5)
                        .unwrap_or(true)
                    {
                        log::error!(
                            "Cannot open server address {}: {}. Retrying every 500ms...",
                            &address,
                            error
                        );
                        last_bind_error_reported = Some(Instant::now());
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }

    /// Accepts incoming connections until the platform stops or the configured address changes.
    async fn server_loop(&self, listener: &mut TcpListener) {
        let mut config_changed_flag = match self.platform.find::<Config>() {
            Some(config) => Some(config.notifier()),
            None => None,
        };

        while self.platform.is_running() && self.is_running() {
            let config_changed = async {
                match config_changed_flag.as_mut() {
                    Some(flag) => flag.recv().await.is_ok(),
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                accepted = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    match accepted {
                        Ok(Ok((stream, _))) => self.handle_new_connection(stream),
                        Ok(Err(error)) => {
                            log::error!("Failed to accept a connection: {}", error);
                            return;
                        }
                        // The timeout elapsed, so that the loop condition is re-evaluated...
                        Err(_) => (),
                    }
                }
                changed = config_changed => {
                    if !changed {
                        config_changed_flag = None;
                        continue;
                    }
                    let new_address = self.address();
                    if self.current_address().as_deref() != Some(new_address.as_str()) {
                        log::info!("Server address has changed. Restarting server socket...");
                        self.running.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }

    /// Registers the new connection and runs the protocol loop for it in a separate task.
    fn handle_new_connection(&self, stream: TcpStream) {
        let platform = self.platform.clone();
        spawn!(async move {
            // All writes are already buffered as a whole response...
            let _ = stream.set_nodelay(true);

            let server = match platform.find::<Server>() {
                Some(server) => server,
                None => return,
            };
            let connection = Arc::new(Connection::new(
                stream
                    .peer_addr()
                    .map(|addr| addr.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_owned()),
            ));
            log::debug!("Opened connection from {}...", connection.peer_address);
            server.add_connection(connection.clone());

            if let Err(error) = resp_protocol_loop(platform, connection.clone(), stream).await {
                log::debug!(
                    "An IO error occurred in connection {}: {}",
                    connection.peer_address,
                    error
                );
            }

            log::debug!("Closing connection to {}...", connection.peer_address);
            server.remove_connection(connection);
        });
    }
}

/// Executed per client to process incoming RESP commands.
async fn resp_protocol_loop(
    platform: Arc<Platform>,
    connection: Arc<Connection>,
    mut stream: TcpStream,
) -> anyhow::Result<()> {
    let mut dispatcher = match platform.find::<CommandDictionary>() {
        Some(commands) => commands.dispatcher(),
        None => return Ok(()),
    };
    let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
    let (mut reader, mut writer) = stream.split();

    while platform.is_running() && connection.is_active() {
        match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await {
            Ok(Ok(bytes_read)) if bytes_read > 0 => {
                // A single read might contain several pipelined requests...
                loop {
                    match Request::parse(&input_buffer) {
                        Ok(Some(request)) => {
                            let request_len = request.len();
                            if !handle_request(
                                request,
                                &mut dispatcher,
                                &connection,
                                &mut writer,
                            )
                            .await?
                            {
                                return Ok(());
                            }
                            input_buffer = clear_input_buffer(input_buffer, request_len);
                        }
                        Ok(None) => break,
                        Err(error) => {
                            handle_protocol_error(error, &mut writer).await?;
                            return Ok(());
                        }
                    }
                }
            }

            // The client closed the connection...
            Ok(Ok(_)) => return Ok(()),

            Ok(Err(error)) => {
                return Err(anyhow::anyhow!(
                    "An error occurred while reading from the client: {}",
                    error
                ));
            }

            // The timeout elapsed, the loop condition will be re-evaluated...
            Err(_) => (),
        }
    }

    Ok(())
}

/// Dispatches a single request and writes its response.
///
/// Returns **false** if the connection has to be closed.
async fn handle_request(
    request: Request,
    dispatcher: &mut Dispatcher,
    connection: &Arc<Connection>,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<bool> {
    log::debug!("Received {}", request.command());

    let watch = Instant::now();
    match dispatcher.invoke(request, Some(connection)).await {
        Ok(response_data) => {
            connection
                .commands
                .record(watch.elapsed().as_micros() as u64);
            writer.write_all(response_data.as_ref()).await?;
            writer.flush().await?;
            Ok(true)
        }
        Err(error) => {
            handle_error(error, writer).await?;
            Ok(false)
        }
    }
}

async fn handle_error(error: OutputError, writer: &mut WriteHalf<'_>) -> anyhow::Result<()> {
    // Only protocol errors are reported back. After an IO error, writing another message
    // would most probably fail anyway...
    if let OutputError::ProtocolError(error) = error {
        let error_message = error.to_string().replace(['\r', '\n'], " ");
        writer
            .write_all(format!("-SERVER: {}\r\n", error_message).as_bytes())
            .await?;
        writer.flush().await?;
    }

    Ok(())
}

async fn handle_protocol_error(
    error: anyhow::Error,
    writer: &mut WriteHalf<'_>,
) -> anyhow::Result<()> {
    writer
        .write_all(
            format!(
                "-CLIENT: A malformed RESP request was received: {}\r\n",
                error
            )
            .as_bytes(),
        )
        .await?;
    writer.flush().await?;
    Ok(())
}

fn clear_input_buffer(mut input_buffer: BytesMut, request_len: usize) -> BytesMut {
    // Shrink a buffer which has grown for a large request and carry over any trailing data
    // (the start of the next request)...
    if input_buffer.capacity() > DEFAULT_BUFFER_SIZE || input_buffer.len() > request_len {
        let previous_buffer = input_buffer;
        input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);

        if previous_buffer.len() > request_len {
            input_buffer.put_slice(&previous_buffer[request_len..]);
        }
    } else {
        input_buffer.truncate(0);
    }

    input_buffer
}

#[cfg(test)]
mod tests {
    use crate::server::{clear_input_buffer, Server};
    use crate::testing::{query_redis_async, test_async};
    use bytes::BytesMut;

    #[test]
    fn trailing_requests_are_carried_over() {
        let buffer = BytesMut::from("*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nQU");
        let buffer = clear_input_buffer(buffer, 14);
        assert_eq!(&buffer[..], b"*1\r\n$4\r\nQU");

        let buffer = clear_input_buffer(BytesMut::from("*1\r\n$4\r\nPING\r\n"), 14);
        assert_eq!(buffer.is_empty(), true);
    }

    #[test]
    fn integration_test() {
        log::info!("Acquiring shared resources...");
        let _guard = crate::testing::SHARED_TEST_RESOURCES.lock().unwrap();
        log::info!("Successfully acquired shared resources.");

        test_async(async {
            let platform = crate::testing::start_test_server("").await;

            let result = query_redis_async(|con| redis::cmd("PING").query::<String>(con))
                .await
                .unwrap();
            assert_eq!(result, "PONG");

            // Pipelined requests are all answered...
            let result = query_redis_async(|con| {
                redis::pipe()
                    .cmd("PING")
                    .arg("one")
                    .cmd("PING")
                    .arg("two")
                    .query::<(String, String)>(con)
            })
            .await
            .unwrap();
            assert_eq!(result, ("one".to_owned(), "two".to_owned()));

            // The announced service id is reported as tenant of the connection...
            let server = platform.require::<Server>();
            let tenants = query_redis_async(|con| {
                redis::cmd("CLIENT")
                    .arg("SETNAME")
                    .arg("gateway")
                    .query::<()>(con)?;
                redis::cmd("CLIENT").arg("GETNAME").query::<String>(con)
            })
            .await
            .unwrap();
            assert_eq!(tenants, "gateway");
            assert_eq!(server.current_address().is_some(), true);

            platform.terminate();
        });
    }
}
