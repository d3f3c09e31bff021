//! Daemon client for the settingsd command line
//!
//! The DaemonClient provides a high-level interface to the background daemon
//! over its Unix socket. [`ListenerEndpoint`] is the other direction: a small
//! socket the daemon calls back into with change notifications.

use crate::daemon::database::DatabaseSignature;
use crate::daemon::listeners::ConnectionId;
use crate::daemon::peer::PeerToken;
use crate::daemon::protocol::{
    DaemonRequest, DaemonResponse, DaemonStatus, ListenerUpdate, Notification, PeerReply,
    PeerRequest,
};
use crate::daemon::server::default_socket_path;
use crate::daemon::socket_peer::unix_token;
use crate::error::ConfError;
use crate::sources::UnsetFlags;
use crate::value::{Entry, Lookup, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default timeout for daemon operations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for daemon startup check
const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between startup checks
const STARTUP_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur when communicating with the daemon
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    ConnectionFailed(std::io::Error),

    #[error("Daemon is not running")]
    DaemonNotRunning,

    #[error("Failed to start daemon: {0}")]
    DaemonStartFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Request timed out")]
    Timeout,

    #[error("Daemon returned error: {0}")]
    Daemon(ConfError),

    #[error("Unexpected response from daemon")]
    UnexpectedResponse,

    #[error("Connection closed by daemon")]
    ConnectionClosed,
}

/// Map a response that did not match the expected variant.
fn unexpected(response: DaemonResponse) -> ClientError {
    match response {
        DaemonResponse::Error { kind, message } => {
            ClientError::Daemon(ConfError::from_wire(kind, message))
        }
        other => {
            debug!("Unexpected response: {:?}", other);
            ClientError::UnexpectedResponse
        }
    }
}

/// Client for communicating with the settingsd daemon
pub struct DaemonClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: BufWriter<tokio::net::unix::OwnedWriteHalf>,
    socket_path: PathBuf,
    /// Database requests go to; `None` is the default database
    database: Option<String>,
}

impl DaemonClient {
    /// Connect to an existing daemon at the default socket path
    ///
    /// Returns an error if the daemon is not running.
    pub async fn connect() -> Result<Self, ClientError> {
        Self::connect_to(default_socket_path()).await
    }

    /// Connect to an existing daemon at the specified socket path
    ///
    /// Returns an error if the daemon is not running.
    pub async fn connect_to(socket_path: PathBuf) -> Result<Self, ClientError> {
        debug!("Connecting to daemon at {:?}", socket_path);

        if !socket_path.exists() {
            return Err(ClientError::DaemonNotRunning);
        }

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                    ClientError::DaemonNotRunning
                }
                _ => ClientError::ConnectionFailed(e),
            })?;

        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);
        let writer = BufWriter::new(write_half);

        debug!("Connected to daemon at {:?}", socket_path);

        Ok(Self {
            reader,
            writer,
            socket_path,
            database: None,
        })
    }

    /// Connect to the daemon, starting it if not running
    ///
    /// This will:
    /// 1. Try to connect to an existing daemon
    /// 2. If that fails, spawn `settingsd serve --foreground` as a detached process
    /// 3. Wait up to 5 seconds for the socket to appear
    /// 4. Connect to the newly started daemon
    pub async fn connect_or_start() -> Result<Self, ClientError> {
        Self::connect_or_start_with_path(default_socket_path()).await
    }

    /// Connect to the daemon at the specified path, starting it if not running
    pub async fn connect_or_start_with_path(socket_path: PathBuf) -> Result<Self, ClientError> {
        match Self::connect_to(socket_path.clone()).await {
            Ok(client) => {
                debug!("Connected to existing daemon");
                return Ok(client);
            }
            Err(ClientError::DaemonNotRunning) => {
                debug!("Daemon not running, starting it");
            }
            Err(e) => return Err(e),
        }

        Self::start_daemon().await?;

        let start_time = std::time::Instant::now();
        while start_time.elapsed() < STARTUP_TIMEOUT {
            if socket_path.exists() {
                match Self::connect_to(socket_path.clone()).await {
                    Ok(client) => {
                        info!("Connected to newly started daemon");
                        return Ok(client);
                    }
                    Err(ClientError::DaemonNotRunning) => {
                        // Socket exists but can't connect yet, keep waiting
                    }
                    Err(e) => return Err(e),
                }
            }
            tokio::time::sleep(STARTUP_CHECK_INTERVAL).await;
        }

        Err(ClientError::DaemonStartFailed(
            "Daemon started but socket did not become available within timeout".to_string(),
        ))
    }

    /// Start the daemon process
    async fn start_daemon() -> Result<(), ClientError> {
        use std::process::{Command, Stdio};

        info!("Starting daemon process");

        let exe = std::env::current_exe().map_err(|e| {
            ClientError::DaemonStartFailed(format!("Failed to get current executable: {}", e))
        })?;

        Command::new(&exe)
            .args(["serve", "--foreground"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ClientError::DaemonStartFailed(format!("Failed to spawn daemon process: {}", e))
            })?;

        debug!("Daemon process spawned");
        Ok(())
    }

    /// Get the socket path this client is connected to
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The database requests currently go to
    pub fn database(&self) -> DatabaseSignature {
        self.database
            .as_deref()
            .map(DatabaseSignature::new)
            .unwrap_or_else(DatabaseSignature::default_database)
    }

    /// Direct further requests at the database built from `addresses`.
    pub async fn use_database(&mut self, addresses: Vec<String>) -> Result<(), ClientError> {
        match self
            .send_request(DaemonRequest::GetDatabase { addresses })
            .await?
        {
            DaemonResponse::Database { signature } => {
                self.database = (!DatabaseSignature::new(signature.as_str()).is_default())
                    .then_some(signature);
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    async fn send_request(
        &mut self,
        request: DaemonRequest,
    ) -> Result<DaemonResponse, ClientError> {
        self.send_request_with_timeout(request, DEFAULT_TIMEOUT)
            .await
    }

    /// Send a request with a custom timeout
    async fn send_request_with_timeout(
        &mut self,
        request: DaemonRequest,
        timeout: Duration,
    ) -> Result<DaemonResponse, ClientError> {
        match tokio::time::timeout(timeout, self.send_request_inner(request)).await {
            Ok(inner_result) => inner_result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn send_request_inner(
        &mut self,
        request: DaemonRequest,
    ) -> Result<DaemonResponse, ClientError> {
        let request_json = serde_json::to_string(&request)?;
        debug!("Sending request: {}", request_json);

        self.writer.write_all(request_json.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;

        let mut response_line = String::new();
        let bytes_read = self.reader.read_line(&mut response_line).await?;

        if bytes_read == 0 {
            return Err(ClientError::ConnectionClosed);
        }

        debug!("Received response: {}", response_line.trim());

        let response: DaemonResponse = serde_json::from_str(&response_line)?;
        Ok(response)
    }

    /// Send a request whose only success answer is `Done`.
    async fn expect_done(&mut self, request: DaemonRequest) -> Result<(), ClientError> {
        match self.send_request(request).await? {
            DaemonResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Check if the daemon is alive by sending a ping
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        match self.send_request(DaemonRequest::Ping).await? {
            DaemonResponse::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&mut self) -> Result<DaemonStatus, ClientError> {
        match self.send_request(DaemonRequest::Status).await? {
            DaemonResponse::Status(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    /// Look up a key, falling back to its schema default
    pub async fn get(&mut self, key: &str, locale: Option<&str>) -> Result<Lookup, ClientError> {
        let request = DaemonRequest::Lookup {
            database: self.database.clone(),
            key: key.to_string(),
            locale: locale.map(str::to_string),
            use_schema_default: true,
        };
        match self.send_request(request).await? {
            DaemonResponse::Value(lookup) => Ok(lookup),
            other => Err(unexpected(other)),
        }
    }

    /// The schema default of a key, ignoring any user value
    pub async fn get_default(
        &mut self,
        key: &str,
        locale: Option<&str>,
    ) -> Result<Option<Value>, ClientError> {
        let request = DaemonRequest::LookupDefault {
            database: self.database.clone(),
            key: key.to_string(),
            locale: locale.map(str::to_string),
        };
        match self.send_request(request).await? {
            DaemonResponse::DefaultValue { value, .. } => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    pub async fn set(&mut self, key: &str, value: Value) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::Set {
            database: self.database.clone(),
            key: key.to_string(),
            value,
        })
        .await
    }

    pub async fn unset(&mut self, key: &str, locale: Option<&str>) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::Unset {
            database: self.database.clone(),
            key: key.to_string(),
            locale: locale.map(str::to_string),
        })
        .await
    }

    pub async fn recursive_unset(
        &mut self,
        key: &str,
        flags: UnsetFlags,
    ) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::RecursiveUnset {
            database: self.database.clone(),
            key: key.to_string(),
            locale: None,
            flags,
        })
        .await
    }

    pub async fn dir_exists(&mut self, dir: &str) -> Result<bool, ClientError> {
        let request = DaemonRequest::DirExists {
            database: self.database.clone(),
            dir: dir.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::Exists(exists) => Ok(exists),
            other => Err(unexpected(other)),
        }
    }

    pub async fn remove_dir(&mut self, dir: &str) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::RemoveDir {
            database: self.database.clone(),
            dir: dir.to_string(),
        })
        .await
    }

    pub async fn all_entries(
        &mut self,
        dir: &str,
        locale: Option<&str>,
    ) -> Result<Vec<Entry>, ClientError> {
        let request = DaemonRequest::AllEntries {
            database: self.database.clone(),
            dir: dir.to_string(),
            locale: locale.map(str::to_string),
        };
        match self.send_request(request).await? {
            DaemonResponse::Entries(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub async fn all_dirs(&mut self, dir: &str) -> Result<Vec<String>, ClientError> {
        let request = DaemonRequest::AllDirs {
            database: self.database.clone(),
            dir: dir.to_string(),
        };
        match self.send_request(request).await? {
            DaemonResponse::Dirs(dirs) => Ok(dirs),
            other => Err(unexpected(other)),
        }
    }

    /// Associate `key` with the schema stored at `schema_key`, or clear the
    /// association with `None`.
    pub async fn set_schema(
        &mut self,
        key: &str,
        schema_key: Option<&str>,
    ) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::SetSchema {
            database: self.database.clone(),
            key: key.to_string(),
            schema_key: schema_key.map(str::to_string),
        })
        .await
    }

    /// Subscribe `peer` to changes at or below `location`
    pub async fn add_listener(
        &mut self,
        location: &str,
        peer: PeerToken,
        name: Option<String>,
    ) -> Result<ConnectionId, ClientError> {
        let request = DaemonRequest::AddListener {
            database: self.database.clone(),
            location: location.to_string(),
            peer,
            name,
        };
        match self.send_request(request).await? {
            DaemonResponse::ListenerAdded { connection_id } => Ok(connection_id),
            other => Err(unexpected(other)),
        }
    }

    /// Returns whether the daemon knew the id
    pub async fn remove_listener(&mut self, connection_id: ConnectionId) -> Result<bool, ClientError> {
        let request = DaemonRequest::RemoveListener {
            database: self.database.clone(),
            connection_id,
        };
        match self.send_request(request).await? {
            DaemonResponse::ListenerRemoved { removed } => Ok(removed),
            other => Err(unexpected(other)),
        }
    }

    /// Ask for a write-back soon
    pub async fn sync(&mut self) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::Sync {
            database: self.database.clone(),
        })
        .await
    }

    /// Write back now and wait for it
    pub async fn synchronous_sync(&mut self) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::SynchronousSync {
            database: self.database.clone(),
        })
        .await
    }

    pub async fn clear_cache(&mut self) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::ClearCache {
            database: self.database.clone(),
        })
        .await
    }

    pub async fn add_client(&mut self, peer: PeerToken) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::AddClient { peer }).await
    }

    pub async fn remove_client(&mut self, peer: PeerToken) -> Result<(), ClientError> {
        self.expect_done(DaemonRequest::RemoveClient { peer }).await
    }

    /// Flush and reload every database
    pub async fn reload(&mut self) -> Result<(), ClientError> {
        match self.send_request(DaemonRequest::Reload).await? {
            DaemonResponse::Reloaded => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Request the daemon to shut down
    pub async fn shutdown(&mut self) -> Result<(), ClientError> {
        match self.send_request(DaemonRequest::Shutdown).await? {
            DaemonResponse::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Something the daemon told a [`ListenerEndpoint`]
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Notified(Notification),
    /// A subscription was re-armed after a daemon restart
    Remapped(ListenerUpdate),
    CachesDropped,
}

/// Restart remaps seen by an endpoint, per database.
type RemapTable = HashMap<(DatabaseSignature, ConnectionId), ConnectionId>;

/// Receiving side of daemon call-outs.
///
/// Binds `listener-<uuid>.sock` in a directory and answers each
/// [`PeerRequest`] the daemon sends. Dropping the endpoint removes the
/// socket, which the daemon then treats as an unreachable peer.
pub struct ListenerEndpoint {
    socket_path: PathBuf,
    token: PeerToken,
    remaps: Arc<Mutex<RemapTable>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ListenerEndpoint {
    /// Bind a new endpoint in `dir` and start answering call-outs
    pub fn bind(dir: &Path) -> Result<(Self, mpsc::UnboundedReceiver<ListenerEvent>), ClientError> {
        std::fs::create_dir_all(dir)?;
        let socket_path = dir.join(format!("listener-{}.sock", Uuid::new_v4()));
        let listener = UnixListener::bind(&socket_path)?;
        let token = unix_token(&socket_path);
        debug!("Listener endpoint bound at {:?}", socket_path);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let remaps = Arc::new(Mutex::new(HashMap::new()));

        let task_remaps = Arc::clone(&remaps);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _addr)) => {
                                let events = events_tx.clone();
                                let remaps = Arc::clone(&task_remaps);
                                tokio::spawn(async move {
                                    if let Err(e) = answer_call_out(stream, events, remaps).await {
                                        debug!("Call-out connection error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("Failed to accept call-out: {}", e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Ok((
            Self {
                socket_path,
                token,
                remaps,
                shutdown_tx,
            },
            events_rx,
        ))
    }

    /// The token to register with `add_listener` or `add_client`
    pub fn token(&self) -> &PeerToken {
        &self.token
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// The id a subscription in `database` currently has, following
    /// restart remaps
    pub fn current_id(&self, database: &DatabaseSignature, id: ConnectionId) -> ConnectionId {
        let Ok(remaps) = self.remaps.lock() else {
            return id;
        };
        let mut current = id;
        while let Some(next) = remaps.get(&(database.clone(), current)) {
            if *next == current {
                break;
            }
            current = *next;
        }
        current
    }
}

impl Drop for ListenerEndpoint {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            debug!("Failed to remove listener socket: {}", e);
        }
    }
}

/// Answer one call-out: read a request line, reply with one line.
async fn answer_call_out(
    stream: UnixStream,
    events: mpsc::UnboundedSender<ListenerEvent>,
    remaps: Arc<Mutex<RemapTable>>,
) -> Result<(), ClientError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }

    let reply = match serde_json::from_str::<PeerRequest>(&line) {
        Ok(PeerRequest::Ping) => PeerReply::Ok,
        Ok(PeerRequest::Notify(notification)) => {
            deliver(&events, ListenerEvent::Notified(notification))
        }
        Ok(PeerRequest::UpdateListener(update)) => {
            if let Ok(mut remaps) = remaps.lock() {
                remaps.insert(
                    (DatabaseSignature::new(update.database.as_str()), update.old_id),
                    update.new_id,
                );
            }
            deliver(&events, ListenerEvent::Remapped(update))
        }
        Ok(PeerRequest::DropAllCaches) => deliver(&events, ListenerEvent::CachesDropped),
        Err(e) => PeerReply::Error {
            message: format!("Invalid call-out: {}", e),
        },
    };

    let reply_json = serde_json::to_string(&reply)?;
    writer.write_all(reply_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Forward an event; a closed receiver means nobody is listening any more.
fn deliver(events: &mpsc::UnboundedSender<ListenerEvent>, event: ListenerEvent) -> PeerReply {
    match events.send(event) {
        Ok(()) => PeerReply::Ok,
        Err(_) => PeerReply::Error {
            message: "listener closed".to_string(),
        },
    }
}
