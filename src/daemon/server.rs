//! Daemon server for the configuration databases
//!
//! The daemon listens on a Unix socket and forwards each request to the core
//! thread, which owns every database. Answers come back over a one-shot
//! channel and are written to the requesting connection.

use crate::config::{DaemonSettings, APP_NAME};
use crate::daemon::event_loop::{Event, EventLoop, ExitReason};
use crate::daemon::protocol::{DaemonRequest, DaemonResponse};
use crate::daemon::registry::DaemonRegistry;
use crate::daemon::socket_peer::SocketConnector;
use crate::error::{ConfError, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

/// Errors that can occur in the daemon server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Conf(#[from] ConfError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Another daemon is already listening on {0}")]
    SocketExists(PathBuf),

    #[error("Server shutdown")]
    Shutdown,
}

impl ServerError {
    /// Whether startup failed because another instance holds the socket.
    pub fn is_lock_failure(&self) -> bool {
        matches!(self, ServerError::SocketExists(_))
            || matches!(self, ServerError::Conf(e) if e.kind() == ErrorKind::LockFailed)
    }
}

/// Daemon server state
pub struct DaemonServer {
    /// Path to Unix socket
    socket_path: PathBuf,
    /// Path to PID file
    pid_path: PathBuf,
    settings: DaemonSettings,
    /// Shutdown signal sender
    shutdown_tx: broadcast::Sender<()>,
}

/// Handle to control a running daemon server
pub struct DaemonHandle {
    shutdown_tx: broadcast::Sender<()>,
    exited: oneshot::Receiver<ExitReason>,
}

impl DaemonHandle {
    /// Signal the daemon to shut down gracefully
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait until the daemon has stopped and its socket and PID file are gone
    pub async fn wait(self) -> ExitReason {
        self.exited.await.unwrap_or(ExitReason::Requested)
    }
}

impl DaemonServer {
    /// Create a new daemon server with default paths
    pub fn new(settings: DaemonSettings) -> Result<Self, ServerError> {
        let base_path = default_daemon_dir();
        Self::with_paths(
            base_path.join("daemon.sock"),
            base_path.join("daemon.pid"),
            settings,
        )
    }

    /// Create a daemon server with custom paths
    pub fn with_paths(
        socket_path: PathBuf,
        pid_path: PathBuf,
        settings: DaemonSettings,
    ) -> Result<Self, ServerError> {
        // Ensure parent directory exists
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            socket_path,
            pid_path,
            settings,
            shutdown_tx,
        })
    }

    /// Get the socket path
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Get the PID file path
    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    /// Run the daemon server
    ///
    /// Loads the default database and restores saved subscriptions before
    /// binding, so no request is served against a half-recovered registry.
    /// The server runs until a shutdown signal (SIGTERM/SIGINT or a
    /// `Shutdown` request) or until the core loop finds nothing in use.
    /// SIGHUP reloads the databases.
    pub async fn run(&self) -> Result<DaemonHandle, ServerError> {
        // Check if socket already exists
        if self.socket_path.exists() {
            // Try to connect to see if daemon is already running
            if UnixStream::connect(&self.socket_path).await.is_ok() {
                return Err(ServerError::SocketExists(self.socket_path.clone()));
            }
            // Stale socket, remove it
            std::fs::remove_file(&self.socket_path)?;
        }

        // Recovery calls out to peers with blocking sockets.
        let settings = self.settings.clone();
        let registry = tokio::task::spawn_blocking(move || {
            let connector = SocketConnector::new(settings.notify_timeout);
            let mut registry = DaemonRegistry::new(settings, Box::new(connector))?;
            registry.recover();
            Ok::<_, ConfError>(registry)
        })
        .await
        .map_err(|e| ConfError::Failed(format!("recovery task failed: {}", e)))??;

        // Write PID file
        self.write_pid_file()?;

        // Bind to Unix socket
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("Daemon listening on {:?}", self.socket_path);

        let mut hangup = signal::unix::signal(signal::unix::SignalKind::hangup())?;

        let (events_tx, events_rx) = mpsc::channel::<Event>();
        let (core_tx, core_rx) = oneshot::channel::<ExitReason>();
        let core_shutdown_tx = self.shutdown_tx.clone();
        std::thread::Builder::new()
            .name(format!("{}-core", APP_NAME))
            .spawn(move || {
                let reason = EventLoop::new(registry, Instant::now()).run(events_rx);
                let _ = core_tx.send(reason);
                // Stop accepting once the core is gone.
                let _ = core_shutdown_tx.send(());
            })?;

        let (exited_tx, exited_rx) = oneshot::channel();
        let handle = DaemonHandle {
            shutdown_tx: self.shutdown_tx.clone(),
            exited: exited_rx,
        };

        // Clone for the accept loop
        let socket_path = self.socket_path.clone();
        let pid_path = self.pid_path.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        // Spawn the accept loop
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    // Accept new connections
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _addr)) => {
                                debug!("Accepted new connection");
                                let events = events_tx.clone();
                                let mut conn_shutdown_rx = shutdown_rx.resubscribe();

                                tokio::spawn(async move {
                                    if let Err(e) = handle_connection(stream, events, &mut conn_shutdown_rx).await {
                                        match e {
                                            ServerError::Shutdown => {
                                                debug!("Connection closed due to shutdown");
                                            }
                                            _ => {
                                                error!("Connection error: {}", e);
                                            }
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Failed to accept connection: {}", e);
                            }
                        }
                    }

                    // Handle shutdown signal
                    _ = shutdown_rx.recv() => {
                        info!("Received shutdown signal, stopping daemon");
                        break;
                    }

                    // Handle OS signals
                    _ = shutdown_signal() => {
                        info!("Received OS signal, stopping daemon");
                        break;
                    }

                    _ = hangup_signal(&mut hangup) => {
                        info!("Received SIGHUP, reloading");
                        let _ = events_tx.send(Event::Reload);
                    }
                }
            }

            // The core may already be gone; then this send is a no-op.
            let _ = events_tx.send(Event::Shutdown);
            let reason = core_rx.await.unwrap_or(ExitReason::Requested);

            // Cleanup
            cleanup_daemon(&socket_path, &pid_path);
            info!(?reason, "Daemon stopped");
            let _ = exited_tx.send(reason);
        });

        Ok(handle)
    }

    /// Write the PID file
    fn write_pid_file(&self) -> Result<(), ServerError> {
        let pid = std::process::id();
        if let Some(parent) = self.pid_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.pid_path, pid.to_string())?;
        debug!("Wrote PID file: {:?} (pid={})", self.pid_path, pid);
        Ok(())
    }
}

/// Handle a single client connection
async fn handle_connection(
    stream: UnixStream,
    events: mpsc::Sender<Event>,
    shutdown_rx: &mut broadcast::Receiver<()>,
) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    loop {
        line.clear();

        tokio::select! {
            // Read a line from the client
            read_result = reader.read_line(&mut line) => {
                match read_result {
                    Ok(0) => {
                        // EOF, client disconnected
                        debug!("Client disconnected");
                        return Ok(());
                    }
                    Ok(_) => {
                        // Parse and forward the request
                        let response = match serde_json::from_str::<DaemonRequest>(&line) {
                            Ok(request) => {
                                debug!("Received request: {:?}", request);
                                forward_request(request, &events).await
                            }
                            Err(e) => {
                                warn!("Failed to parse request: {}", e);
                                DaemonResponse::Error {
                                    kind: ErrorKind::ParseError,
                                    message: format!("Invalid request: {}", e),
                                }
                            }
                        };

                        // Check if we should shutdown
                        let should_shutdown = matches!(response, DaemonResponse::ShuttingDown);

                        // Send response
                        let response_json = serde_json::to_string(&response)?;
                        writer.write_all(response_json.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await?;

                        if should_shutdown {
                            return Err(ServerError::Shutdown);
                        }
                    }
                    Err(e) => {
                        error!("Read error: {}", e);
                        return Err(e.into());
                    }
                }
            }

            // Handle shutdown signal
            _ = shutdown_rx.recv() => {
                return Err(ServerError::Shutdown);
            }
        }
    }
}

/// Hand a request to the core thread and wait for its answer
async fn forward_request(request: DaemonRequest, events: &mpsc::Sender<Event>) -> DaemonResponse {
    let (reply, answer) = oneshot::channel();
    if events.send(Event::Request { request, reply }).is_err() {
        return ConfError::InShutdown.into();
    }
    answer
        .await
        .unwrap_or_else(|_| ConfError::InShutdown.into())
}

/// Clean up daemon files on shutdown
fn cleanup_daemon(socket_path: &Path, pid_path: &Path) {
    if let Err(e) = std::fs::remove_file(socket_path) {
        warn!("Failed to remove socket file: {}", e);
    }
    if let Err(e) = std::fs::remove_file(pid_path) {
        warn!("Failed to remove PID file: {}", e);
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn hangup_signal(hangup: &mut signal::unix::Signal) {
    if hangup.recv().await.is_none() {
        std::future::pending::<()>().await;
    }
}

/// Get the default daemon directory
pub fn default_daemon_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Get the default socket path
pub fn default_socket_path() -> PathBuf {
    default_daemon_dir().join("daemon.sock")
}

/// Get the default PID file path
pub fn default_pid_path() -> PathBuf {
    default_daemon_dir().join("daemon.pid")
}

/// Read the daemon PID from the PID file
pub fn read_daemon_pid(pid_path: &Path) -> Option<u32> {
    std::fs::read_to_string(pid_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_server(temp_dir: &TempDir) -> DaemonServer {
        let socket_path = temp_dir.path().join("test.sock");
        let pid_path = temp_dir.path().join("test.pid");
        let mut settings = DaemonSettings::with_state_dir(temp_dir.path().join("state"));
        settings.default_sources = vec![format!(
            "json:readwrite:{}",
            temp_dir.path().join("user.json").display()
        )];

        DaemonServer::with_paths(socket_path, pid_path, settings)
            .expect("Failed to create test server")
    }

    async fn round_trip(socket_path: &Path, request: &DaemonRequest) -> DaemonResponse {
        let mut stream = UnixStream::connect(socket_path).await.unwrap();
        let request_json = serde_json::to_string(request).unwrap();
        stream.write_all(request_json.as_bytes()).await.unwrap();
        stream.write_all(b"\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await.unwrap();
        serde_json::from_str(&response_line).unwrap()
    }

    #[tokio::test]
    async fn test_server_creation() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        assert!(server.socket_path().ends_with("test.sock"));
        assert!(server.pid_path().ends_with("test.pid"));
    }

    #[tokio::test]
    async fn test_server_run_and_shutdown() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        let socket_path = server.socket_path().to_path_buf();
        let pid_path = server.pid_path().to_path_buf();

        let handle = server.run().await.expect("Failed to start server");

        assert!(socket_path.exists());
        assert_eq!(read_daemon_pid(&pid_path), Some(std::process::id()));

        handle.shutdown();
        let reason = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("daemon did not stop");
        assert_eq!(reason, ExitReason::Requested);

        assert!(!socket_path.exists());
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn test_server_ping_pong() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        let socket_path = server.socket_path().to_path_buf();

        let handle = server.run().await.expect("Failed to start server");

        let response = round_trip(&socket_path, &DaemonRequest::Ping).await;
        assert!(matches!(response, DaemonResponse::Pong));

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_set_and_lookup() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        let socket_path = server.socket_path().to_path_buf();

        let handle = server.run().await.expect("Failed to start server");

        let set = DaemonRequest::Set {
            database: None,
            key: "/apps/editor/font_size".to_string(),
            value: Value::Int(12),
        };
        assert!(matches!(
            round_trip(&socket_path, &set).await,
            DaemonResponse::Done
        ));

        let lookup = DaemonRequest::Lookup {
            database: None,
            key: "/apps/editor/font_size".to_string(),
            locale: None,
            use_schema_default: true,
        };
        match round_trip(&socket_path, &lookup).await {
            DaemonResponse::Value(found) => {
                assert_eq!(found.value, Some(Value::Int(12)));
                assert!(found.is_writable);
            }
            other => panic!("Expected Value response, got {:?}", other),
        }

        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("daemon did not stop");
        // Shutdown flushed the value to disk.
        assert!(temp_dir.path().join("user.json").exists());
    }

    #[tokio::test]
    async fn test_server_shutdown_request() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        let socket_path = server.socket_path().to_path_buf();

        let handle = server.run().await.expect("Failed to start server");

        let response = round_trip(&socket_path, &DaemonRequest::Shutdown).await;
        assert!(matches!(response, DaemonResponse::ShuttingDown));

        let reason = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("daemon did not stop");
        assert_eq!(reason, ExitReason::Requested);
        assert!(!socket_path.exists());
    }

    #[tokio::test]
    async fn test_second_instance_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        let handle = server.run().await.expect("Failed to start server");

        let second = create_test_server(&temp_dir);
        let err = second.run().await.err().expect("second daemon started");
        assert!(err.is_lock_failure());

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_server_invalid_request() {
        let temp_dir = TempDir::new().unwrap();
        let server = create_test_server(&temp_dir);
        let socket_path = server.socket_path().to_path_buf();

        let handle = server.run().await.expect("Failed to start server");

        let mut stream = UnixStream::connect(&socket_path).await.unwrap();

        // Send invalid JSON
        stream.write_all(b"not valid json\n").await.unwrap();

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await.unwrap();

        let response: DaemonResponse = serde_json::from_str(&response_line).unwrap();
        match response {
            DaemonResponse::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::ParseError);
                assert!(message.contains("Invalid request"));
            }
            _ => panic!("Expected Error response"),
        }

        handle.shutdown();
    }

    #[test]
    fn test_default_paths() {
        let socket_path = default_socket_path();
        let pid_path = default_pid_path();
        let daemon_dir = default_daemon_dir();

        assert!(socket_path.ends_with("daemon.sock"));
        assert!(pid_path.ends_with("daemon.pid"));
        assert!(daemon_dir.ends_with("settingsd"));
    }
}
