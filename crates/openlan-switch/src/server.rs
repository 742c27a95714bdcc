//! Tunnel listener and per-connection sessions.
//!
//! Every accepted socket becomes a [`Session`]. A session answers the
//! point's login, hands out its lease and, once authenticated, joins the
//! bridge as a port. Data frames of unauthenticated sessions are dropped.

use crate::error::Result;
use crate::lease::Lease;
use crate::network::NetworkRegistry;
use crate::users::Authenticator;
use async_trait::async_trait;
use bytes::Bytes;
use openlan_network::wire::{self, Instruction, InstructionKind, Login};
use openlan_network::{Bridge, Frame, NetworkError, Port};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerOptions {
    /// Address to listen on.
    pub listen: String,
    /// Largest payload accepted from or sent to a point.
    pub max_frame_size: usize,
    /// Network joined by points that do not name one.
    pub default_network: String,
    /// Outbound queue depth of each session.
    pub queue_depth: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:10002".to_string(),
            max_frame_size: wire::DEFAULT_MAX_FRAME_SIZE,
            default_network: "default".to_string(),
            queue_depth: 1024,
        }
    }
}

/// Reporting view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub user: Option<String>,
    pub authenticated: bool,
    pub lease: Option<Lease>,
    pub dropped: u64,
}

/// The switch end of one tunnel.
pub struct Session {
    name: String,
    outbound: mpsc::Sender<Bytes>,
    authenticated: AtomicBool,
    user: RwLock<Option<String>>,
    lease: RwLock<Option<Arc<Lease>>>,
    dropped: AtomicU64,
}

impl Session {
    fn new(name: String, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            name,
            outbound,
            authenticated: AtomicBool::new(false),
            user: RwLock::new(None),
            lease: RwLock::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns true once the login was accepted.
    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Lease handed to this session.
    pub fn lease(&self) -> Option<Arc<Lease>> {
        self.lease.read().clone()
    }

    /// Snapshot for reporting.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            user: self.user.read().clone(),
            authenticated: self.is_authenticated(),
            lease: self.lease().map(|lease| Lease::clone(&lease)),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    async fn enqueue(&self, payload: Bytes) -> openlan_network::Result<()> {
        self.outbound
            .send(payload)
            .await
            .map_err(|_| NetworkError::delivery(&self.name, "session closed"))
    }
}

#[async_trait]
impl Port for Session {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, frame: &[u8]) -> openlan_network::Result<()> {
        self.enqueue(Bytes::copy_from_slice(frame)).await
    }
}

/// Accepts tunnels from points.
pub struct TunnelServer {
    options: ServerOptions,
    bridge: Arc<Bridge>,
    networks: Arc<NetworkRegistry>,
    auth: Arc<dyn Authenticator>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl TunnelServer {
    /// Creates a server feeding `bridge`.
    pub fn new(
        options: ServerOptions,
        bridge: Arc<Bridge>,
        networks: Arc<NetworkRegistry>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            options,
            bridge,
            networks,
            auth,
            sessions: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Binds the configured listen address.
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(&self.options.listen).await?)
    }

    /// Accepts connections until [`TunnelServer::shutdown`].
    #[instrument(skip_all)]
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!(%addr, "tunnel listener ready"),
            Err(e) => warn!(error = %e, "tunnel listener has no local address"),
        }

        loop {
            let accepted = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    self.tracker.spawn(async move { server.handle(stream, peer).await });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
        debug!("tunnel listener stopped");
    }

    /// Stops accepting, closes every session and waits for them.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        info!("tunnel server stopped");
    }

    /// Open sessions sorted by name.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.sessions.read().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.name.cmp(&b.name));
        sessions
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }
        let (mut reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(self.options.queue_depth.max(1));
        let session = Arc::new(Session::new(peer.to_string(), tx));
        let port: Arc<dyn Port> = session.clone();
        let closing = self.cancel.child_token();

        info!(session = %session.name, "session opened");
        self.sessions
            .write()
            .insert(session.name.clone(), Arc::clone(&session));
        let writer = tokio::spawn(run_writer(
            session.name.clone(),
            writer,
            rx,
            self.options.max_frame_size,
            closing.clone(),
        ));

        loop {
            let read = tokio::select! {
                _ = closing.cancelled() => break,
                read = wire::read_frame(&mut reader, self.options.max_frame_size) => read,
            };
            let payload = match read {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(session = %session.name, error = %e, "read ended");
                    break;
                }
            };

            if wire::is_instruction(&payload) {
                self.on_instruction(&session, &port, &payload).await;
                continue;
            }
            if !session.is_authenticated() {
                session.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(session = %session.name, "dropping frame from unauthenticated session");
                continue;
            }
            if let Err(e) = self.bridge.input(Frame::new(payload, Some(port.clone()))).await {
                warn!(session = %session.name, error = %e, "bridge rejected frame");
                if !e.is_retryable() {
                    break;
                }
            }
        }

        closing.cancel();
        self.bridge.detach(&session.name);
        self.sessions.write().remove(&session.name);
        if let Err(e) = writer.await {
            warn!(session = %session.name, error = %e, "session writer ended abnormally");
        }
        info!(session = %session.name, "session closed");
    }

    async fn on_instruction(&self, session: &Arc<Session>, port: &Arc<dyn Port>, payload: &[u8]) {
        let instruction = match Instruction::parse(payload) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(session = %session.name, error = %e, "ignoring malformed instruction");
                return;
            }
        };

        match (instruction.action.as_str(), instruction.kind) {
            (wire::ACTION_LOGIN, InstructionKind::Request) => {
                self.on_login(session, port, &instruction).await;
            }
            (action, kind) => {
                debug!(session = %session.name, action, ?kind, "ignoring instruction");
            }
        }
    }

    async fn on_login(&self, session: &Arc<Session>, port: &Arc<dyn Port>, instruction: &Instruction) {
        let login: Login = match serde_json::from_slice(&instruction.body) {
            Ok(login) => login,
            Err(e) => {
                warn!(session = %session.name, error = %e, "malformed login");
                self.reject(session).await;
                return;
            }
        };

        let Some(user) = self.auth.check(&login.name, &login.password).await else {
            warn!(session = %session.name, name = %login.name, "login rejected");
            self.reject(session).await;
            return;
        };

        info!(session = %session.name, user = %user, "login accepted");
        *session.user.write() = Some(user);
        session.authenticated.store(true, Ordering::Release);
        self.reply(session, wire::ACTION_LOGIN, wire::LOGIN_OKAY.as_bytes())
            .await;

        let identity = login.uuid.unwrap_or_default();
        let alias = login.alias.unwrap_or_else(|| login.name.clone());
        let network = login
            .network
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.options.default_network.clone());
        match self.networks.new_lease_for(&identity, &alias, &network) {
            Some(lease) => {
                match serde_json::to_vec(lease.as_ref()) {
                    Ok(body) => self.reply(session, wire::ACTION_LEASE, &body).await,
                    Err(e) => warn!(error = %e, "lease encoding failed"),
                }
                *session.lease.write() = Some(lease);
            }
            None => {
                info!(session = %session.name, identity = %identity, network = %network, "no lease available");
            }
        }

        self.bridge.attach(port.clone());
    }

    /// Answers `failed`; a session that was logged in loses its port.
    async fn reject(&self, session: &Session) {
        if session.authenticated.swap(false, Ordering::AcqRel) {
            session.user.write().take();
            self.bridge.detach(&session.name);
            info!(session = %session.name, "session logged out");
        }
        self.reply(session, wire::ACTION_LOGIN, wire::LOGIN_FAILED.as_bytes())
            .await;
    }

    async fn reply(&self, session: &Session, action: &str, body: &[u8]) {
        if let Err(e) = session.enqueue(wire::encode_response(action, body)).await {
            debug!(session = %session.name, error = %e, "reply not sent");
        }
    }
}

async fn run_writer(
    name: String,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    max_frame_size: usize,
    closing: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = closing.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        if let Err(e) = wire::write_frame(&mut writer, &payload, max_frame_size).await {
            warn!(session = %name, error = %e, "write failed");
            if matches!(e, NetworkError::Oversized { .. }) {
                continue;
            }
            closing.cancel();
            break;
        }
    }
    debug!(session = %name, "session writer stopped");
}
