//! Server skeleton: accept loop, control thread, status thread and a
//! self-watchdog, wrapped around a daemon-specific [`CommandHandler`].
//!
//! Commands are admitted one at a time. While a command is processing any
//! other request is answered with `BUSY <n>` and dropped.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;

use crate::codes;
use crate::error::{FabricError, FabricResult};
use crate::logger::EMERGENCY;
use crate::protocol::{tag, timeouts, COMMAND_NUMBER_MODULUS, MAX_PAYLOAD};
use crate::protocol_core::{classify, tokenize, Lead, Tag};
use crate::room::BroadcastRoom;
use crate::runtime::io_runtime;
use crate::session::{Deadlines, Inbound, Session, SessionId};
use crate::status::{status_payload, StatusFiles};

/// Origin used for requests injected by the daemon itself (signals)
pub const INTERNAL_ORIGIN: SessionId = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// Completes with `COMPLETE <n> <err> [params]`
    Domain,
    /// Completes with `PROCESS <n> <err> <exe> <pid>`
    ProcessInfo,
    /// Completes with `SHUTDOWN <n> <err>`, then the server stops
    Shutdown { emergency: bool },
}

#[derive(Clone, Debug)]
pub struct Command {
    pub code: i32,
    pub number: u32,
    pub tokens: Vec<String>,
    pub origin: SessionId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    pub error: i32,
    pub params: Vec<String>,
}

impl Completion {
    pub fn ok() -> Self {
        Completion::default()
    }

    pub fn error(code: i32) -> Self {
        Completion {
            error: code,
            params: Vec::new(),
        }
    }

    pub fn with_params(mut self, params: Vec<String>) -> Self {
        self.params = params;
        self
    }
}

/// What a daemon plugs into the skeleton.
pub trait CommandHandler: Send + Sync + 'static {
    /// `None` marks a code this daemon does not know; it is still admitted
    /// and completes with `ERROR_UNKNOWN_COMMAND`.
    fn classify(&self, code: i32) -> Option<CommandKind>;

    /// Advertised in `RECEIVED`.
    fn timeout(&self, _code: i32) -> Duration {
        Duration::from_secs(timeouts::COMMAND_S)
    }

    /// Runs on a command thread; may block up to the advertised timeout.
    fn execute(&self, command: &Command) -> Completion;

    /// Code that a bare `SHUTDOWN` request maps to
    fn shutdown_code(&self) -> Option<i32> {
        None
    }

    fn initialized(&self) -> bool {
        true
    }

    fn error_code(&self) -> i32 {
        codes::error::NO_ERROR
    }

    /// Daemon-specific fields appended to every STATUS payload
    fn status_fields(&self) -> String {
        String::new()
    }

    /// Called once per control-thread loop
    fn on_tick(&self) {}
}

#[derive(Clone, Debug)]
pub struct StallReport {
    pub thread: &'static str,
    pub silent: Duration,
}

#[derive(Clone)]
pub enum StallAction {
    /// Remove the lock file and exit the process with status -1
    Exit,
    Notify(Arc<dyn Fn(&StallReport) + Send + Sync>),
}

#[derive(Clone)]
pub struct ServerOptions {
    pub executable: String,
    /// 0 picks an ephemeral port
    pub port: u16,
    pub deadlines: Deadlines,
    pub status_files: Option<StatusFiles>,
    pub lock_file: Option<PathBuf>,
    pub control_stall: Duration,
    pub status_tolerance: Duration,
    pub stall_action: StallAction,
}

impl ServerOptions {
    pub fn new(executable: &str, port: u16) -> Self {
        ServerOptions {
            executable: executable.to_string(),
            port,
            deadlines: Deadlines::default(),
            status_files: None,
            lock_file: None,
            control_stall: Duration::from_secs(timeouts::CONTROL_STALL_S),
            status_tolerance: Duration::from_secs(timeouts::STATUS_TOLERANCE_S),
            stall_action: StallAction::Exit,
        }
    }
}

/// The single command record; only the control thread mutates it.
#[derive(Clone, Debug, Default)]
pub struct CommandSlot {
    pub code: i32,
    pub number: u32,
    pub tokens: Vec<String>,
    pub origin: SessionId,
    pub processing: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Lagging { thread: &'static str, silent: Duration },
    Stalled { thread: &'static str, silent: Duration },
}

/// Judge the control and status heartbeats.
///
/// Control is stalled once silent for `control_limit`; status is stalled
/// once silent for more than one second plus `status_tolerance`.
pub fn assess(
    control_silent: Duration,
    status_silent: Duration,
    control_limit: Duration,
    status_tolerance: Duration,
) -> Health {
    let status_limit = Duration::from_secs(1) + status_tolerance;
    if control_silent >= control_limit {
        return Health::Stalled {
            thread: "control",
            silent: control_silent,
        };
    }
    if status_silent > status_limit {
        return Health::Stalled {
            thread: "status",
            silent: status_silent,
        };
    }
    if control_silent >= Duration::from_secs(1) {
        return Health::Lagging {
            thread: "control",
            silent: control_silent,
        };
    }
    if status_silent > Duration::from_secs(1) {
        return Health::Lagging {
            thread: "status",
            silent: status_silent,
        };
    }
    Health::Healthy
}

/// 1..=15000, wrapping
pub fn next_command_number(current: u32) -> u32 {
    current % COMMAND_NUMBER_MODULUS + 1
}

/// `RECEIVED <n> <timeout_s> <request>`, with the echoed request cut short
/// when the whole reply would not fit in one frame
pub fn received_reply(number: u32, timeout_s: u64, request: &str) -> String {
    let mut reply = format!("{} {} {} ", tag::RECEIVED, number, timeout_s);
    let room = MAX_PAYLOAD.saturating_sub(reply.len());
    let mut end = request.len().min(room);
    while !request.is_char_boundary(end) {
        end -= 1;
    }
    reply.push_str(&request[..end]);
    reply
}

pub fn completion_reply(
    kind: Option<CommandKind>,
    number: u32,
    completion: &Completion,
    executable: &str,
    pid: u32,
) -> String {
    match kind {
        Some(CommandKind::ProcessInfo) => format!(
            "{} {} {} {} {}",
            tag::PROCESS,
            number,
            completion.error,
            executable,
            pid
        ),
        Some(CommandKind::Shutdown { .. }) => {
            format!("{} {} {}", tag::SHUTDOWN, number, completion.error)
        }
        Some(CommandKind::Domain) | None => {
            let mut reply = format!("{} {} {}", tag::COMPLETE, number, completion.error);
            for p in &completion.params {
                reply.push(' ');
                reply.push_str(p);
            }
            reply
        }
    }
}

struct Done {
    number: u32,
    kind: Option<CommandKind>,
    completion: Completion,
}

struct Shared {
    executable: String,
    deadlines: Deadlines,
    room: Arc<BroadcastRoom>,
    operating: AtomicBool,
    control_beat: Mutex<Instant>,
    status_beat: Mutex<Instant>,
    published: Mutex<Option<String>>,
    slot: Mutex<CommandSlot>,
    shutdown_code: Option<i32>,
    accept_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Shared {
    fn operating(&self) -> bool {
        self.operating.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        if !self.operating.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        self.room.set_shutdown(true);
        if self.room.connection_count() > 0 {
            self.room.quit();
        }
        info!("{} server stopping", self.executable);
    }
}

/// Cloneable handle for signal handlers and other threads
#[derive(Clone)]
pub struct ServerHandle {
    shared: Arc<Shared>,
}

impl ServerHandle {
    /// Take the same path as a SHUTDOWN request when the daemon has one
    pub fn request_shutdown(&self) {
        match self.shared.shutdown_code {
            Some(_) => self.shared.room.inbox().push(Inbound {
                origin: INTERNAL_ORIGIN,
                payload: tag::SHUTDOWN.to_string(),
            }),
            None => self.shared.stop(),
        }
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn is_operating(&self) -> bool {
        self.shared.operating()
    }
}

pub struct Server {
    shared: Arc<Shared>,
    local_port: u16,
    threads: Vec<JoinHandle<()>>,
}

impl Server {
    pub fn start<H: CommandHandler>(options: ServerOptions, handler: Arc<H>) -> FabricResult<Server> {
        let handler: Arc<dyn CommandHandler> = handler;
        let port = options.port;
        let listener = io_runtime()
            .block_on(TcpListener::bind(("0.0.0.0", port)))
            .map_err(|e| FabricError::io("bind", e))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| FabricError::io("bind", e))?
            .port();

        let now = Instant::now();
        let shared = Arc::new(Shared {
            executable: options.executable.clone(),
            deadlines: options.deadlines,
            room: BroadcastRoom::new(),
            operating: AtomicBool::new(true),
            control_beat: Mutex::new(now),
            status_beat: Mutex::new(now),
            published: Mutex::new(None),
            slot: Mutex::new(CommandSlot::default()),
            shutdown_code: handler.shutdown_code(),
            accept_task: Mutex::new(None),
        });

        let task = io_runtime().spawn(accept_loop(listener, shared.clone()));
        *shared.accept_task.lock() = Some(task);

        let mut threads = Vec::new();
        {
            let shared = shared.clone();
            let handler = handler.clone();
            threads.push(spawn_named("robo-control", move || {
                control_loop(shared, handler)
            })?);
        }
        {
            let shared = shared.clone();
            let handler = handler.clone();
            let files = options.status_files.clone();
            threads.push(spawn_named("robo-status", move || {
                status_loop(shared, handler, files)
            })?);
        }
        {
            let shared = shared.clone();
            let opts = options.clone();
            threads.push(spawn_named("robo-watchdog", move || {
                watchdog_loop(shared, opts)
            })?);
        }

        info!(
            "{} server listening on port {}",
            options.executable, local_port
        );
        Ok(Server {
            shared,
            local_port,
            threads,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn room(&self) -> Arc<BroadcastRoom> {
        self.shared.room.clone()
    }

    pub fn is_operating(&self) -> bool {
        self.shared.operating()
    }

    pub fn slot(&self) -> CommandSlot {
        self.shared.slot.lock().clone()
    }

    pub fn stop(&self) {
        self.shared.stop();
    }

    /// Block until the server stops and all of its threads have joined
    pub fn wait(mut self) {
        self.join_all();
    }

    fn join_all(&mut self) {
        for t in self.threads.drain(..) {
            if t.join().is_err() {
                error!("{} server thread panicked", self.shared.executable);
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shared.stop();
        self.join_all();
    }
}

fn spawn_named<F>(name: &str, f: F) -> FabricResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| FabricError::io("spawn thread", e))
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if !shared.operating() {
                    break;
                }
                let session = Session::accepted(stream, &shared.room, shared.deadlines);
                // welcome goes out ahead of any broadcast
                if let Err(e) = session.send(format!("{} ", tag::WELCOME)) {
                    warn!("welcome to {} failed: {}", addr, e);
                }
                shared.room.join(session.clone());
                session.listen();
                info!("accepted connection {} from {}", session.id(), addr);
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn control_loop(shared: Arc<Shared>, handler: Arc<dyn CommandHandler>) {
    let tick = Duration::from_millis(timeouts::CONTROL_TICK_MS);
    let inbox = shared.room.inbox();
    let (done_tx, done_rx) = mpsc::channel::<Done>();
    let pid = std::process::id();
    // internal request waiting for the slot to free up
    let mut deferred: Option<Inbound> = None;

    while shared.operating() {
        *shared.control_beat.lock() = Instant::now();
        handler.on_tick();

        let published = shared.published.lock().take();
        if let Some(status) = published {
            if shared.room.connection_count() > 0 {
                shared.room.send(&status);
            }
        }

        while let Ok(done) = done_rx.try_recv() {
            let reply = completion_reply(
                done.kind,
                done.number,
                &done.completion,
                &shared.executable,
                pid,
            );
            shared.slot.lock().processing = false;
            debug!("command {} finished: {}", done.number, reply);
            shared.room.send(&reply);
            if let Some(CommandKind::Shutdown { emergency }) = done.kind {
                if emergency {
                    error!(target: EMERGENCY, "emergency shutdown of {}", shared.executable);
                }
                shared.stop();
            }
        }

        if deferred.is_some() && !shared.slot.lock().processing {
            if let Some(msg) = deferred.take() {
                deferred = admit(&shared, &handler, &done_tx, msg);
            }
        }

        if let Some(msg) = inbox.pop_timeout(tick) {
            if let Some(parked) = admit(&shared, &handler, &done_tx, msg) {
                deferred.get_or_insert(parked);
            }
        }
    }
    debug!("control thread exiting");
}

/// Returns the request back when it came from the daemon itself and has to
/// wait for the running command.
fn admit(
    shared: &Arc<Shared>,
    handler: &Arc<dyn CommandHandler>,
    done_tx: &mpsc::Sender<Done>,
    msg: Inbound,
) -> Option<Inbound> {
    let tokens = tokenize(&msg.payload);
    let code = match classify(&tokens) {
        Lead::Code(code) => code,
        Lead::Tag(Tag::Shutdown) => match shared.shutdown_code {
            Some(code) => code,
            None => {
                warn!("SHUTDOWN from session {} but no shutdown command", msg.origin);
                return None;
            }
        },
        Lead::Tag(Tag::Exit) => {
            if let Some(session) = shared.room.session(msg.origin) {
                debug!("session {} is leaving", msg.origin);
                session.mark_triggered();
                session.quit();
            }
            return None;
        }
        Lead::Tag(t) => {
            debug!("ignoring {} from session {}", t, msg.origin);
            return None;
        }
        Lead::Unknown(first) => {
            warn!("unknown tag {} from session {}, dropped", first, msg.origin);
            return None;
        }
        Lead::Empty => return None,
    };

    let mut slot = shared.slot.lock();
    if slot.processing {
        if msg.origin == INTERNAL_ORIGIN {
            return Some(msg);
        }
        shared
            .room
            .send_to(msg.origin, &format!("{} {}", tag::BUSY, slot.number));
        return None;
    }

    let number = next_command_number(slot.number);
    let kind = handler.classify(code);
    let timeout = handler.timeout(code);
    if msg.origin != INTERNAL_ORIGIN {
        let ack = received_reply(number, timeout.as_secs(), &msg.payload);
        if !shared.room.send_to(msg.origin, &ack) {
            warn!("command from session {} not acknowledged, dropped", msg.origin);
            return None;
        }
    }
    *slot = CommandSlot {
        code,
        number,
        tokens: tokens.clone(),
        origin: msg.origin,
        processing: true,
    };
    drop(slot);
    info!(
        "command {} ({}) admitted from session {}",
        number,
        codes::command_name(code),
        msg.origin
    );

    let command = Command {
        code,
        number,
        tokens,
        origin: msg.origin,
    };
    let handler = handler.clone();
    let tx = done_tx.clone();
    let spawned = thread::Builder::new()
        .name("robo-command".to_string())
        .spawn(move || {
            let completion = match kind {
                Some(CommandKind::ProcessInfo) => Completion::ok(),
                Some(_) => handler.execute(&command),
                None => Completion::error(codes::error::ERROR_UNKNOWN_COMMAND),
            };
            let _ = tx.send(Done {
                number: command.number,
                kind,
                completion,
            });
        });
    if let Err(e) = spawned {
        error!("cannot start command {}: {}", number, e);
        let _ = done_tx.send(Done {
            number,
            kind,
            completion: Completion::error(codes::error::ERROR_START),
        });
    }
    None
}

fn unix_now() -> (i64, u32) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_millis()),
        Err(_) => (0, 0),
    }
}

fn status_loop(
    shared: Arc<Shared>,
    handler: Arc<dyn CommandHandler>,
    files: Option<StatusFiles>,
) {
    let (mut last_sec, _) = unix_now();
    while shared.operating() {
        *shared.status_beat.lock() = Instant::now();
        let (sec, ms) = unix_now();
        if sec != last_sec {
            last_sec = sec;
            let payload = status_payload(
                sec,
                handler.initialized(),
                handler.error_code(),
                &handler.status_fields(),
            );
            if let Some(files) = &files {
                files.record(&payload);
            }
            *shared.published.lock() = Some(payload);
        }
        let to_boundary = 1000u64.saturating_sub(ms as u64).max(1);
        thread::sleep(Duration::from_millis(to_boundary.min(50)));
    }
    debug!("status thread exiting");
}

fn watchdog_loop(shared: Arc<Shared>, options: ServerOptions) {
    let mut tripped = false;
    while shared.operating() {
        for _ in 0..10 {
            if !shared.operating() {
                return;
            }
            thread::sleep(Duration::from_millis(100));
        }
        let control_silent = shared.control_beat.lock().elapsed();
        let status_silent = shared.status_beat.lock().elapsed();
        match assess(
            control_silent,
            status_silent,
            options.control_stall,
            options.status_tolerance,
        ) {
            Health::Healthy => tripped = false,
            Health::Lagging { thread, silent } => {
                warn!(
                    "{} thread silent for {} ms",
                    thread,
                    silent.as_millis()
                );
            }
            Health::Stalled { thread, silent } => {
                error!(
                    target: EMERGENCY,
                    "{} thread stalled for {} ms",
                    thread,
                    silent.as_millis()
                );
                if tripped {
                    continue;
                }
                tripped = true;
                let report = StallReport { thread, silent };
                match &options.stall_action {
                    StallAction::Exit => {
                        if let Some(lock) = &options.lock_file {
                            let _ = std::fs::remove_file(lock);
                        }
                        log::logger().flush();
                        std::process::exit(-1);
                    }
                    StallAction::Notify(f) => f(&report),
                }
            }
        }
    }
}
