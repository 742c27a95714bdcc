//! Tunnel worker: one TCP connection from a point to its switch.
//!
//! The worker logs in right after every connect. A receive loop reads
//! messages, applies instructions and hands data frames to the local
//! ingress; it also owns reconnecting after a fixed backoff. A send loop
//! drains the outbound queue, writing only while authenticated.

use crate::config::PointConfig;
use crate::error::{Result, TunnelError};
use async_trait::async_trait;
use bytes::Bytes;
use openlan_network::wire::{self, Instruction, InstructionKind};
use openlan_network::{Frame, Ingress, NetworkError, Port};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Connection state of a tunnel worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// No socket.
    Init,
    /// Socket being established.
    Connecting,
    /// Connected, login not (yet) accepted.
    Unauthenticated,
    /// Login accepted.
    Authenticated,
    /// Stopped for good.
    Terminal,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Init => "init",
            Status::Connecting => "connecting",
            Status::Unauthenticated => "unauthenticated",
            Status::Authenticated => "authenticated",
            Status::Terminal => "terminal",
        };
        f.write_str(s)
    }
}

/// Counters and state for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub status: Status,
    pub sent: u64,
    pub received: u64,
    pub dropped: u64,
    pub address: Option<Ipv4Addr>,
}

#[derive(Deserialize)]
struct LeaseNotice {
    address: Ipv4Addr,
}

/// Per-switch transport state machine.
pub struct TunnelWorker {
    config: PointConfig,
    name: String,
    status: RwLock<Status>,
    login_pending: AtomicBool,
    changed: Notify,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    outbound: mpsc::Sender<Bytes>,
    pending: Mutex<Option<mpsc::Receiver<Bytes>>>,
    address: RwLock<Option<Ipv4Addr>>,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelWorker {
    /// Creates an idle worker. The configuration is corrected and validated.
    pub fn new(mut config: PointConfig) -> Result<Self> {
        config.correct();
        config.validate()?;

        let (outbound, pending) = mpsc::channel(config.outbound_depth);
        let name = format!("{}@{}", config.name, config.server);
        Ok(Self {
            config,
            name,
            status: RwLock::new(Status::Init),
            login_pending: AtomicBool::new(false),
            changed: Notify::new(),
            writer: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
            outbound,
            pending: Mutex::new(Some(pending)),
            address: RwLock::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &PointConfig {
        &self.config
    }

    /// Current status.
    pub fn status(&self) -> Status {
        *self.status.read()
    }

    /// Returns true once the switch accepted the login.
    pub fn is_authenticated(&self) -> bool {
        self.status() == Status::Authenticated
    }

    /// Items discarded because the session was not authenticated.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Items written to the socket.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Data frames handed to the ingress.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Address leased by the switch, once announced.
    pub fn assigned_address(&self) -> Option<Ipv4Addr> {
        *self.address.read()
    }

    /// Snapshot for reporting.
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            status: self.status(),
            sent: self.sent(),
            received: self.received(),
            dropped: self.dropped(),
            address: self.assigned_address(),
        }
    }

    fn set_status(&self, next: Status) {
        {
            let mut status = self.status.write();
            if *status == next || *status == Status::Terminal {
                return;
            }
            info!(worker = %self.name, from = %*status, to = %next, "status changed");
            *status = next;
        }
        self.changed.notify_waiters();
    }

    fn finish_login(&self, next: Status) {
        self.set_status(next);
        self.login_pending.store(false, Ordering::Release);
        self.changed.notify_waiters();
    }

    /// True from sending a login until its answer arrives or the socket closes.
    fn login_in_flight(&self) -> bool {
        self.login_pending.load(Ordering::Acquire)
    }

    /// Opens the socket and sends the login request.
    ///
    /// Expected to run from `Init`; any other state is forced back first.
    /// On failure the worker is left in `Init`, ready for the next attempt.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn connect(&self) -> Result<()> {
        let current = self.status();
        if current == Status::Terminal {
            return Err(TunnelError::Stopped(self.name.clone()));
        }
        if current != Status::Init {
            warn!(status = %current, "connect from non-init state, resetting");
            self.close_socket().await;
        }

        self.set_status(Status::Connecting);
        let server = self.config.server.clone();
        let stream = match tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(&server),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                self.set_status(Status::Init);
                return Err(TunnelError::Connect { server, source });
            }
            Err(_) => {
                self.set_status(Status::Init);
                return Err(TunnelError::ConnectTimeout { server });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "set_nodelay failed");
        }

        let (reader, writer) = stream.into_split();
        *self.reader.lock() = Some(reader);
        *self.writer.lock().await = Some(writer);

        self.login_pending.store(true, Ordering::Release);
        self.set_status(Status::Unauthenticated);

        let body = serde_json::to_vec(&self.config.login())?;
        info!(name = %self.config.name, network = %self.config.network, "sending login");
        if let Err(e) = self.write(&wire::encode_request(wire::ACTION_LOGIN, &body)).await {
            self.close_socket().await;
            return Err(e);
        }
        Ok(())
    }

    async fn write(&self, payload: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        let Some(stream) = writer.as_mut() else {
            return Err(TunnelError::NotConnected);
        };
        wire::write_frame(stream, payload, self.config.max_frame_size).await?;
        Ok(())
    }

    async fn close_socket(&self) {
        self.reader.lock().take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            use tokio::io::AsyncWriteExt;
            let _ = writer.shutdown().await;
        }
        self.login_pending.store(false, Ordering::Release);
        self.set_status(Status::Init);
        self.changed.notify_waiters();
    }

    /// Queues one item for the send loop, waiting while the queue is full.
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Stopped(self.name.clone()));
        }
        self.outbound
            .send(data.into())
            .await
            .map_err(|_| TunnelError::Stopped(self.name.clone()))
    }

    /// Connects once and spawns the receive and send loops. Data frames read
    /// from the switch are passed to `ingress`.
    #[instrument(skip(self, ingress), fields(worker = %self.name))]
    pub async fn start(self: &Arc<Self>, ingress: Arc<dyn Ingress>) {
        let Some(rx) = self.pending.lock().take() else {
            debug!("worker already started");
            return;
        };

        if let Err(e) = self.connect().await {
            warn!(error = %e, "initial connect failed, retrying in the background");
        }

        let receiver = tokio::spawn(Arc::clone(self).run_receiver(ingress));
        let sender = tokio::spawn(Arc::clone(self).run_sender(rx));
        self.tasks.lock().extend([receiver, sender]);
    }

    /// Marks the worker terminal, stops both loops and closes the socket.
    /// Queued items are discarded.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub async fn stop(&self) {
        self.set_status(Status::Terminal);
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "worker task ended abnormally");
            }
        }
        self.close_socket().await;
        self.pending.lock().take();
        info!(dropped = self.dropped(), sent = self.sent(), "worker stopped");
    }

    fn on_instruction(&self, payload: &[u8]) {
        let instruction = match Instruction::parse(payload) {
            Ok(instruction) => instruction,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "ignoring malformed instruction");
                return;
            }
        };

        match (instruction.action.as_str(), instruction.kind) {
            (wire::ACTION_LOGIN, InstructionKind::Response) => {
                let answer = instruction.text();
                if answer.starts_with(wire::LOGIN_OKAY) {
                    info!(worker = %self.name, "login accepted");
                    self.finish_login(Status::Authenticated);
                } else {
                    warn!(worker = %self.name, answer, "login rejected");
                    self.finish_login(Status::Unauthenticated);
                }
            }
            (wire::ACTION_LEASE, InstructionKind::Response) => {
                match serde_json::from_slice::<LeaseNotice>(&instruction.body) {
                    Ok(notice) => {
                        info!(worker = %self.name, address = %notice.address, "address assigned");
                        *self.address.write() = Some(notice.address);
                    }
                    Err(e) => {
                        warn!(worker = %self.name, error = %e, "ignoring malformed lease notice")
                    }
                }
            }
            (action, kind) => {
                debug!(worker = %self.name, action, ?kind, "ignoring instruction");
            }
        }
    }

    async fn run_receiver(self: Arc<Self>, ingress: Arc<dyn Ingress>) {
        let me: Arc<dyn Port> = self.clone();
        let mut reader: Option<OwnedReadHalf> = None;

        loop {
            if self.cancel.is_cancelled() || self.status() == Status::Terminal {
                break;
            }
            if reader.is_none() {
                reader = self.reader.lock().take();
            }

            let Some(stream) = reader.as_mut() else {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.reconnect_interval()) => {}
                }
                if let Err(e) = self.connect().await {
                    error!(worker = %self.name, error = %e, "reconnect failed");
                }
                continue;
            };

            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = wire::read_frame(stream, self.config.max_frame_size) => result,
            };

            let payload = match result {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(worker = %self.name, error = %e, "read failed, closing connection");
                    reader = None;
                    self.close_socket().await;
                    continue;
                }
            };

            if payload.is_empty() {
                continue;
            }
            if wire::is_instruction(&payload) {
                self.on_instruction(&payload);
                continue;
            }

            self.received.fetch_add(1, Ordering::Relaxed);
            debug!(worker = %self.name, len = payload.len(), "frame from switch");
            if let Err(e) = ingress.input(Frame::new(payload, Some(me.clone()))).await {
                warn!(worker = %self.name, error = %e, "ingress rejected frame");
                if !e.is_retryable() {
                    break;
                }
            }
        }

        debug!(worker = %self.name, "receive loop exited");
    }

    async fn run_sender(self: Arc<Self>, mut rx: mpsc::Receiver<Bytes>) {
        let mut held: Option<Bytes> = None;

        loop {
            // park only while a login answer is outstanding
            loop {
                let changed = self.changed.notified();
                if !self.login_in_flight() {
                    break;
                }
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = changed => {}
                }
            }

            let item = match held.take() {
                Some(item) => item,
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    item = rx.recv() => match item {
                        Some(item) => item,
                        None => break,
                    },
                },
            };

            // a new login may have started while waiting for the item
            if self.login_in_flight() {
                held = Some(item);
                continue;
            }

            let status = self.status();
            if status != Status::Authenticated {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(worker = %self.name, %status, len = item.len(), "dropping outbound frame");
                continue;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.write(&item) => result,
            };
            match result {
                Ok(()) => {
                    self.sent.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) if e.is_retryable() => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %self.name, error = %e, "write failed, waiting for reconnect");
                }
                Err(e) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    error!(worker = %self.name, error = %e, "frame not writable");
                }
            }
        }

        debug!(worker = %self.name, "send loop exited");
    }
}

#[async_trait]
impl Port for TunnelWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, frame: &[u8]) -> openlan_network::Result<()> {
        self.send(Bytes::copy_from_slice(frame))
            .await
            .map_err(|e| NetworkError::delivery(&self.name, e.to_string()))
    }
}
