//! One open TCP connection speaking the framed protocol.
//!
//! A session owns two tasks on the I/O runtime: a writer that drains the
//! outbound queues one write at a time, and (after `listen`) a reader that
//! loops header → payload → dispatch. Application threads only touch the
//! queues and flags, never the socket.

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::error::{FabricError, FabricResult};
use crate::mailbox::Mailbox;
use crate::protocol::{tag, timeouts, HEADER_WIDTH};
use crate::protocol_core::{self, Tag};
use crate::room::BroadcastRoom;
use crate::runtime::{io_handle, io_runtime};

pub type SessionId = u64;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No socket yet
    Fresh,
    /// Outbound connect in progress
    Connecting,
    /// Server side, socket accepted but not yet reading
    Accepted,
    Open,
    Quitting,
    /// Terminal; sessions are never reused
    Closed,
}

/// Per-direction deadlines. `idle` bounds the wait for the first byte of
/// the next message; `read` bounds the rest of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Deadlines {
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub idle: Option<Duration>,
}

impl Deadlines {
    pub fn disabled() -> Self {
        Deadlines {
            read: None,
            write: None,
            idle: None,
        }
    }
}

impl Default for Deadlines {
    fn default() -> Self {
        Deadlines {
            read: Some(Duration::from_millis(timeouts::READ_MS)),
            write: Some(Duration::from_millis(timeouts::WRITE_MS)),
            idle: None,
        }
    }
}

/// A payload taken off the wire, tagged with the session it came from
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inbound {
    pub origin: SessionId,
    pub payload: String,
}

enum Outbound {
    Framed(String),
    /// No length header; only for foreign, non-fabric endpoints
    Raw(String),
    Quit,
    Close,
}

struct SessionFlags {
    exit: AtomicBool,
    /// Shared with the enclosing broadcast room on the server side
    shutdown: Arc<AtomicBool>,
    triggered: AtomicBool,
    confirmed: AtomicBool,
}

pub struct Session {
    id: SessionId,
    role: Role,
    peer: String,
    flags: SessionFlags,
    inbox: Arc<Mailbox<Inbound>>,
    outbox: mpsc::UnboundedSender<Outbound>,
    control: mpsc::UnboundedSender<Outbound>,
    state: Mutex<SessionState>,
    state_changed: Condvar,
    current_op: Mutex<&'static str>,
    deadlines: Deadlines,
    room: Option<Weak<BroadcastRoom>>,
    reader: Mutex<Option<OwnedReadHalf>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Open a client session to `host:port`. Blocks the calling thread (which
    /// must not be an I/O runtime thread) for at most the connect timeout.
    pub fn connect(
        host: &str,
        port: u16,
        deadlines: Deadlines,
        inbox: Arc<Mailbox<Inbound>>,
    ) -> FabricResult<Arc<Session>> {
        let addr = format!("{}:{}", host, port);
        let ms = timeouts::CONNECT_MS;
        let stream = io_runtime().block_on(async {
            match timeout(Duration::from_millis(ms), TcpStream::connect(&addr)).await {
                Ok(Ok(s)) => Ok(s),
                Ok(Err(e)) => Err(FabricError::io("connect", e)),
                Err(_) => Err(FabricError::Timeout { op: "connect", ms }),
            }
        })?;
        let _ = stream.set_nodelay(true);
        let shutdown = Arc::new(AtomicBool::new(false));
        Ok(Self::from_stream(
            stream,
            Role::Client,
            shutdown,
            inbox,
            deadlines,
            None,
        ))
    }

    /// Wrap a socket accepted by a server; the session shares the room's
    /// shutdown flag and inbox.
    pub fn accepted(
        stream: TcpStream,
        room: &Arc<BroadcastRoom>,
        deadlines: Deadlines,
    ) -> Arc<Session> {
        let _ = stream.set_nodelay(true);
        Self::from_stream(
            stream,
            Role::Server,
            room.shutdown_flag(),
            room.inbox(),
            deadlines,
            Some(Arc::downgrade(room)),
        )
    }

    fn from_stream(
        stream: TcpStream,
        role: Role,
        shutdown: Arc<AtomicBool>,
        inbox: Arc<Mailbox<Inbound>>,
        deadlines: Deadlines,
        room: Option<Weak<BroadcastRoom>>,
    ) -> Arc<Session> {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let state = match role {
            Role::Client => SessionState::Open,
            Role::Server => SessionState::Accepted,
        };
        let session = Arc::new(Session {
            id: NEXT_SESSION.fetch_add(1, Ordering::Relaxed),
            role,
            peer,
            flags: SessionFlags {
                exit: AtomicBool::new(false),
                shutdown,
                triggered: AtomicBool::new(false),
                confirmed: AtomicBool::new(false),
            },
            inbox,
            outbox: outbox_tx,
            control: control_tx,
            state: Mutex::new(state),
            state_changed: Condvar::new(),
            current_op: Mutex::new("idle"),
            deadlines,
            room,
            reader: Mutex::new(Some(read_half)),
            read_task: Mutex::new(None),
        });
        io_handle().spawn(session.clone().write_loop(write_half, control_rx, outbox_rx));
        debug!(
            "session {} ({:?}) opened with {}",
            session.id, session.role, session.peer
        );
        session
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// True while the socket is connected
    pub fn is_open(&self) -> bool {
        matches!(
            self.state(),
            SessionState::Accepted | SessionState::Open | SessionState::Quitting
        )
    }

    pub fn last_operation(&self) -> &'static str {
        *self.current_op.lock()
    }

    pub fn is_exit(&self) -> bool {
        self.flags.exit.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.flags.shutdown.load(Ordering::SeqCst)
    }

    pub fn set_shutdown(&self, on: bool) {
        self.flags.shutdown.store(on, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flags.triggered.load(Ordering::SeqCst)
    }

    /// The peer asked us to go; `quit` will answer with CONFIRM.
    pub fn mark_triggered(&self) {
        self.flags.exit.store(true, Ordering::SeqCst);
        self.flags.triggered.store(true, Ordering::SeqCst);
    }

    pub fn is_confirmed(&self) -> bool {
        self.flags.confirmed.load(Ordering::SeqCst)
    }

    fn set_op(&self, op: &'static str) {
        *self.current_op.lock() = op;
    }

    fn set_state(&self, s: SessionState) {
        let mut st = self.state.lock();
        if *st != SessionState::Closed {
            *st = s;
        }
        self.state_changed.notify_all();
    }

    fn accepting_traffic(&self) -> FabricResult<()> {
        match self.state() {
            SessionState::Accepted | SessionState::Open => Ok(()),
            _ => Err(FabricError::Closed),
        }
    }

    /// Queue a payload behind any pending traffic
    pub fn send(&self, payload: impl Into<String>) -> FabricResult<()> {
        let payload = payload.into();
        protocol_core::validate_payload_size(payload.len())?;
        self.accepting_traffic()?;
        self.outbox
            .send(Outbound::Framed(payload))
            .map_err(|_| FabricError::Closed)
    }

    /// Send one framed control message ahead of the FIFO
    pub fn single_send(&self, payload: impl Into<String>) -> FabricResult<()> {
        let payload = payload.into();
        protocol_core::validate_payload_size(payload.len())?;
        self.accepting_traffic()?;
        self.control
            .send(Outbound::Framed(payload))
            .map_err(|_| FabricError::Closed)
    }

    /// Send bytes with no length header. Only for talking to foreign
    /// endpoints (serial/terminal servers and similar) that do not speak the
    /// framed protocol.
    pub fn simple_send(&self, payload: impl Into<String>) -> FabricResult<()> {
        self.accepting_traffic()?;
        self.control
            .send(Outbound::Raw(payload.into()))
            .map_err(|_| FabricError::Closed)
    }

    /// Start the read loop. Calling it twice is harmless.
    pub fn listen(self: &Arc<Self>) {
        let reader = match self.reader.lock().take() {
            Some(r) => r,
            None => {
                debug!("session {} already listening", self.id);
                return;
            }
        };
        if self.state() == SessionState::Accepted {
            self.set_state(SessionState::Open);
        }
        let task = io_handle().spawn(self.clone().read_loop(reader));
        *self.read_task.lock() = Some(task);
    }

    /// Graceful close, after any traffic already queued
    pub fn quit(&self) {
        {
            let mut st = self.state.lock();
            match *st {
                SessionState::Quitting | SessionState::Closed => return,
                _ => *st = SessionState::Quitting,
            }
        }
        self.flags.exit.store(true, Ordering::SeqCst);
        if self.outbox.send(Outbound::Quit).is_err() {
            self.finish();
        }
    }

    /// Block until the session reaches Closed or `wait` elapses
    pub fn wait_closed(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        let mut st = self.state.lock();
        while *st != SessionState::Closed {
            if self.state_changed.wait_until(&mut st, deadline).timed_out() {
                return *st == SessionState::Closed;
            }
        }
        true
    }

    /// Inbound dispatch. Flags are only ever flipped here from peer traffic.
    fn read(&self, payload: String) {
        let tokens = protocol_core::tokenize(&payload);
        match tokens.first().and_then(|t| Tag::parse(t)) {
            Some(Tag::ImGone) => {
                debug!("session {}: peer is leaving", self.id);
                self.mark_triggered();
            }
            Some(Tag::GoHome) => {
                debug!("session {}: peer sent everyone home", self.id);
                self.flags.shutdown.store(true, Ordering::SeqCst);
                self.mark_triggered();
            }
            Some(Tag::Confirm) => {
                self.flags.confirmed.store(true, Ordering::SeqCst);
            }
            _ => self.inbox.push(Inbound {
                origin: self.id,
                payload,
            }),
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: OwnedReadHalf) {
        loop {
            self.set_op("read header");
            match read_frame(&mut reader, &self.deadlines).await {
                Ok(payload) => self.read(payload),
                Err(e) => {
                    if self.is_exit() || self.is_shutdown() {
                        debug!("session {} closed by peer: {}", self.id, e);
                        let _ = self.control.send(Outbound::Close);
                    } else {
                        self.do_die(&e);
                    }
                    break;
                }
            }
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: OwnedWriteHalf,
        mut control_rx: mpsc::UnboundedReceiver<Outbound>,
        mut outbox_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        loop {
            let msg = tokio::select! {
                biased;
                Some(m) = control_rx.recv() => m,
                Some(m) = outbox_rx.recv() => m,
                else => break,
            };
            let result = match msg {
                Outbound::Framed(payload) => {
                    self.set_op("write");
                    write_frame(&mut writer, payload.as_bytes(), self.deadlines.write).await
                }
                Outbound::Raw(payload) => {
                    self.set_op("raw write");
                    write_all_timed(&mut writer, payload.as_bytes(), self.deadlines.write, "raw write")
                        .await
                }
                Outbound::Quit => {
                    self.quit_protocol(&mut writer).await;
                    break;
                }
                Outbound::Close => break,
            };
            if let Err(e) = result {
                self.do_die(&e);
                break;
            }
        }
        let _ = writer.shutdown().await;
        self.finish();
    }

    async fn quit_protocol(&self, writer: &mut OwnedWriteHalf) {
        self.set_op("quit");
        let farewell = if self.is_triggered() {
            tag::CONFIRM
        } else if self.is_shutdown() {
            if let Some(room) = self.room.as_ref().and_then(Weak::upgrade) {
                room.send_except(self.id, tag::GOHOME);
            }
            tag::GOHOME
        } else {
            tag::EXIT
        };
        if let Err(e) = write_frame(writer, farewell.as_bytes(), self.deadlines.write).await {
            debug!("session {}: farewell not delivered: {}", self.id, e);
        }
        self.do_exit();
    }

    /// Component hook run on close: server sessions leave their room
    fn do_exit(&self) {
        if let Some(room) = self.room.as_ref().and_then(Weak::upgrade) {
            room.leave(self.id);
        }
    }

    fn do_die(&self, err: &FabricError) {
        warn!(
            "session {} to {} died during {}: {}",
            self.id,
            self.peer,
            self.last_operation(),
            err
        );
        self.flags.exit.store(true, Ordering::SeqCst);
        let _ = self.control.send(Outbound::Close);
        self.do_exit();
    }

    fn finish(&self) {
        self.flags.exit.store(true, Ordering::SeqCst);
        if let Some(task) = self.read_task.lock().take() {
            task.abort();
        }
        self.do_exit();
        {
            let mut st = self.state.lock();
            *st = SessionState::Closed;
        }
        self.state_changed.notify_all();
        info!("session {} to {} closed", self.id, self.peer);
    }
}

async fn read_exact_timed<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
    limit: Option<Duration>,
    op: &'static str,
) -> FabricResult<()> {
    let res = match limit {
        Some(d) => match timeout(d, stream.read_exact(buf)).await {
            Ok(r) => r,
            Err(_) => {
                return Err(FabricError::Timeout {
                    op,
                    ms: d.as_millis() as u64,
                })
            }
        },
        None => stream.read_exact(buf).await,
    };
    match res {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(FabricError::Closed),
        Err(e) => Err(FabricError::io(op, e)),
    }
}

async fn write_all_timed<W: AsyncWrite + Unpin>(
    stream: &mut W,
    buf: &[u8],
    limit: Option<Duration>,
    op: &'static str,
) -> FabricResult<()> {
    let res = match limit {
        Some(d) => match timeout(d, stream.write_all(buf)).await {
            Ok(r) => r,
            Err(_) => {
                return Err(FabricError::Timeout {
                    op,
                    ms: d.as_millis() as u64,
                })
            }
        },
        None => stream.write_all(buf).await,
    };
    res.map_err(|e| FabricError::io(op, e))
}

/// Read one framed message: header, then exactly the announced payload
pub async fn read_frame<R: AsyncRead + Unpin>(
    stream: &mut R,
    deadlines: &Deadlines,
) -> FabricResult<String> {
    let mut hdr = [0u8; HEADER_WIDTH];
    read_exact_timed(stream, &mut hdr[..1], deadlines.idle, "read header").await?;
    read_exact_timed(stream, &mut hdr[1..], deadlines.read, "read header").await?;
    let len = protocol_core::decode_header(&hdr)?;
    let mut payload = vec![0u8; len];
    if len > 0 {
        read_exact_timed(stream, &mut payload, deadlines.read, "read payload").await?;
    }
    Ok(protocol_core::decode_payload(&payload))
}

/// Frame and write one payload as a single write
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    payload: &[u8],
    limit: Option<Duration>,
) -> FabricResult<()> {
    let frame = protocol_core::encode(payload)?;
    write_all_timed(stream, &frame, limit, "write").await?;
    stream.flush().await.map_err(|e| FabricError::io("flush", e))
}
