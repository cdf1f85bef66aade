//! Client skeleton: one outbound session to a daemon, kept alive by a
//! reconnect ladder that escalates to restarting the peer.

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::codes;
use crate::error::{FabricError, FabricResult};
use crate::logger::EMERGENCY;
use crate::mailbox::Mailbox;
use crate::protocol::{timeouts, BUSY_RETRIES, MAX_ATTEMPTS};
use crate::protocol_core::{tokenize, Tag};
use crate::session::{Deadlines, Inbound, Session};
use crate::supervisor::{is_local_host, is_process_running, Supervisor};

pub type StatusSink = Box<dyn Fn(&[String]) + Send + Sync>;

#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Executable name of the daemon at the other end
    pub executable: String,
    pub host: String,
    pub port: u16,
    /// Extra launch options used when the peer is restarted
    pub daemon_options: String,
    /// Sent after every WELCOME to learn the peer's PID
    pub process_info_code: Option<i32>,
    pub shutdown_code: Option<i32>,
    /// Never restart the peer, only wait and retry
    pub telemetry_only: bool,
    pub deadlines: Deadlines,
    pub max_attempts: u32,
    pub reconnect_delay: Duration,
    pub telemetry_wait: Duration,
    pub send_timeout: Duration,
}

impl ClientOptions {
    pub fn new(executable: &str, host: &str, port: u16) -> Self {
        ClientOptions {
            executable: executable.to_string(),
            host: host.to_string(),
            port,
            daemon_options: String::new(),
            process_info_code: None,
            shutdown_code: None,
            telemetry_only: false,
            deadlines: Deadlines::default(),
            max_attempts: MAX_ATTEMPTS,
            reconnect_delay: Duration::from_millis(timeouts::RECONNECT_MS),
            telemetry_wait: Duration::from_millis(timeouts::TELEMETRY_WAIT_MS),
            send_timeout: Duration::from_millis(timeouts::SEND_ACK_MS),
        }
    }
}

/// Everything the client knows about its peer and the current exchange
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientInfo {
    pub command_number: u32,
    /// Seconds, as advertised in the last RECEIVED
    pub timeout: u64,
    pub message_received: bool,
    pub command_sent: bool,
    pub busy_signal: bool,
    pub busy_number: u32,
    pub complete: bool,
    pub error_code: i32,
    pub last_error: i32,
    pub command_error_code: i32,
    pub params: Vec<String>,
    pub connect_attempts: u32,
    pub reset_attempts: u32,
    pub connected: bool,
    pub welcomes: u32,
    pub daemon_pid: Option<u32>,
    pub telemetry_only: bool,
    /// The peer sent us home; no restarts until it welcomes us again
    pub peer_gone: bool,
    /// The reconnect ladder is exhausted
    pub gave_up: bool,
    pub last_status: Option<String>,
    /// The process-info query sent after WELCOME is still outstanding
    pub query_pending: bool,
    /// Command number the server gave that query
    pub query_number: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandReply {
    pub number: u32,
    pub error: i32,
    pub params: Vec<String>,
}

impl CommandReply {
    /// Non-zero daemon error codes become `FabricError::Domain`
    pub fn into_result(self) -> FabricResult<CommandReply> {
        if self.error == codes::error::NO_ERROR {
            Ok(self)
        } else {
            Err(FabricError::Domain(self.error))
        }
    }
}

struct Inner {
    options: ClientOptions,
    supervisor: Supervisor,
    info: Mutex<ClientInfo>,
    changed: Condvar,
    session: Mutex<Option<Arc<Session>>>,
    inbox: Arc<Mailbox<Inbound>>,
    running: AtomicBool,
    status_sink: Mutex<Option<StatusSink>>,
}

pub struct Client {
    inner: Arc<Inner>,
    thread: Option<JoinHandle<()>>,
}

impl Client {
    pub fn start(options: ClientOptions, supervisor: Supervisor) -> FabricResult<Client> {
        let info = ClientInfo {
            telemetry_only: options.telemetry_only,
            ..ClientInfo::default()
        };
        let inner = Arc::new(Inner {
            options,
            supervisor,
            info: Mutex::new(info),
            changed: Condvar::new(),
            session: Mutex::new(None),
            inbox: Arc::new(Mailbox::new()),
            running: AtomicBool::new(true),
            status_sink: Mutex::new(None),
        });
        let worker = inner.clone();
        let thread = thread::Builder::new()
            .name(format!("client-{}", inner.options.executable))
            .spawn(move || worker.run())
            .map_err(|e| FabricError::io("spawn client thread", e))?;
        Ok(Client {
            inner,
            thread: Some(thread),
        })
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub fn info(&self) -> ClientInfo {
        self.inner.info.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.open_session().is_some()
    }

    /// Receives the tokens of every STATUS payload
    pub fn on_status(&self, sink: StatusSink) {
        *self.inner.status_sink.lock() = Some(sink);
    }

    /// Paused monitors never restart their peer
    pub fn set_telemetry_only(&self, on: bool) {
        self.inner.info.lock().telemetry_only = on;
    }

    /// Wait until `pred` holds for the client state
    pub fn wait_until<F>(&self, wait: Duration, pred: F) -> bool
    where
        F: Fn(&ClientInfo) -> bool,
    {
        let deadline = Instant::now() + wait;
        let mut info = self.inner.info.lock();
        while !pred(&info) {
            if self.inner.changed.wait_until(&mut info, deadline).timed_out() {
                return pred(&info);
            }
        }
        true
    }

    /// Post `payload` and wait for the server to acknowledge it with
    /// RECEIVED (or refuse it with BUSY).
    pub fn send_message(&self, payload: &str) -> FabricResult<u32> {
        self.inner.send_message(payload)
    }

    /// Full round trip: send, retry while busy, then wait for the matching
    /// completion within the advertised timeout.
    pub fn send_command(&self, payload: &str) -> FabricResult<CommandReply> {
        self.inner.send_command(payload)
    }

    /// Close the client. With `shutdown_server` the daemon's shutdown
    /// command is sent first.
    pub fn shutdown(mut self, shutdown_server: bool) {
        if shutdown_server {
            match self.inner.options.shutdown_code {
                Some(code) => match self.send_command(&code.to_string()) {
                    Ok(reply) => info!(
                        "{} acknowledged shutdown {} with {}",
                        self.inner.options.executable, reply.number, reply.error
                    ),
                    Err(e) => warn!(
                        "shutdown of {} not confirmed: {}",
                        self.inner.options.executable, e
                    ),
                },
                None => warn!(
                    "{} has no shutdown command",
                    self.inner.options.executable
                ),
            }
        }
        self.stop();
    }

    fn stop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        {
            let _info = self.inner.info.lock();
            self.inner.changed.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
        if let Some(session) = self.inner.session.lock().take() {
            session.quit();
            session.wait_closed(Duration::from_millis(timeouts::WRITE_MS));
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Inner {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn open_session(&self) -> Option<Arc<Session>> {
        self.session
            .lock()
            .as_ref()
            .filter(|s| s.is_open())
            .cloned()
    }

    /// Sleep that ends early when the client stops
    fn pause(&self, wait: Duration) {
        let deadline = Instant::now() + wait;
        let mut info = self.info.lock();
        while self.running() {
            if self.changed.wait_until(&mut info, deadline).timed_out() {
                break;
            }
        }
    }

    fn run(self: Arc<Self>) {
        let tick = Duration::from_millis(timeouts::CONTROL_TICK_MS);
        while self.running() {
            if !self.check_session() {
                self.reconnect();
                continue;
            }
            if let Some(msg) = self.inbox.pop_timeout(tick) {
                self.dispatch(&msg.payload);
            }
        }
        debug!("client for {} exiting", self.options.executable);
    }

    /// True while the session is usable. Handles a peer that told us to go.
    fn check_session(&self) -> bool {
        let session = match self.session.lock().clone() {
            Some(s) => s,
            None => return false,
        };
        if session.is_triggered() {
            // drain whatever arrived before the farewell
            while let Some(msg) = self.inbox.pop() {
                self.dispatch(&msg.payload);
            }
            session.quit();
            *self.session.lock() = None;
            let mut info = self.info.lock();
            info.connected = false;
            info.peer_gone = true;
            info.query_pending = false;
            info.query_number = None;
            self.changed.notify_all();
            info!("{} on {} closed the connection", self.options.executable, self.options.host);
            return false;
        }
        if !session.is_open() {
            *self.session.lock() = None;
            let mut info = self.info.lock();
            info.connected = false;
            info.query_pending = false;
            info.query_number = None;
            self.changed.notify_all();
            warn!(
                "lost connection to {} on {}:{}",
                self.options.executable, self.options.host, self.options.port
            );
            return false;
        }
        true
    }

    /// One rung of the ladder per call
    fn reconnect(&self) {
        let o = &self.options;
        match Session::connect(&o.host, o.port, o.deadlines, self.inbox.clone()) {
            Ok(session) => {
                session.listen();
                *self.session.lock() = Some(session);
                let mut info = self.info.lock();
                info.connected = true;
                self.changed.notify_all();
                info!("connected to {} on {}:{}", o.executable, o.host, o.port);
                return;
            }
            Err(e) => debug!("connect to {}:{} failed: {}", o.host, o.port, e),
        }

        let (attempts, resets, passive, gave_up) = {
            let mut info = self.info.lock();
            info.connect_attempts += 1;
            (
                info.connect_attempts,
                info.reset_attempts,
                info.telemetry_only || info.peer_gone,
                info.gave_up,
            )
        };
        if attempts < o.max_attempts {
            self.pause(o.reconnect_delay);
            return;
        }
        self.info.lock().connect_attempts = 0;

        if passive || gave_up {
            debug!("waiting for {} to come back", o.executable);
            self.pause(o.telemetry_wait);
            return;
        }
        if resets >= o.max_attempts {
            error!(
                target: EMERGENCY,
                "{} on {} could not be restarted after {} attempts",
                o.executable, o.host, resets
            );
            let mut info = self.info.lock();
            info.gave_up = true;
            info.error_code = codes::error::ERROR_MAX_ATTEMPTS_FAIL;
            self.changed.notify_all();
            return;
        }

        let pid = {
            let mut info = self.info.lock();
            info.reset_attempts += 1;
            info.daemon_pid
        };
        warn!(
            "{} unreachable after {} attempts, restarting it on {}",
            o.executable, o.max_attempts, o.host
        );
        if let Err(e) = self
            .supervisor
            .reset_server(&o.executable, pid, o.port, &o.daemon_options, &o.host)
        {
            error!("restart of {} on {} failed: {}", o.executable, o.host, e);
        }
    }

    fn dispatch(&self, payload: &str) {
        let tokens = tokenize(payload);
        let first = match tokens.first() {
            Some(t) => t.as_str(),
            None => return,
        };
        let tag = match Tag::parse(first) {
            Some(t) => t,
            None => {
                warn!("unknown tag {} from {}, dropped", first, self.options.executable);
                return;
            }
        };
        let mut info = self.info.lock();
        match tag {
            Tag::Welcome => {
                info.connect_attempts = 0;
                info.reset_attempts = 0;
                info.gave_up = false;
                info.peer_gone = false;
                info.welcomes += 1;
                if let Some(code) = self.options.process_info_code {
                    if let Some(session) = self.open_session() {
                        let sent = session.single_send(code.to_string()).is_ok();
                        info.query_pending = sent;
                        info.query_number = None;
                    }
                }
            }
            Tag::Received => {
                if tokens.len() < 4 {
                    warn!("short RECEIVED: {}", payload);
                    return;
                }
                match (tokens[1].parse::<u32>(), tokens[2].parse::<u64>()) {
                    // send_message holds back while the query is out
                    (Ok(n), Ok(_)) if info.query_pending && info.query_number.is_none() => {
                        debug!("process query admitted as {}", n);
                        info.query_number = Some(n);
                    }
                    (Ok(n), Ok(t)) => {
                        info.command_number = n;
                        info.timeout = t;
                        info.message_received = true;
                        info.command_sent = false;
                    }
                    _ => warn!("malformed RECEIVED: {}", payload),
                }
            }
            Tag::Complete | Tag::Shutdown => self.completion(&mut info, tag, &tokens, payload),
            Tag::Error => {
                if tokens.len() != 2 {
                    warn!("malformed ERROR: {}", payload);
                    return;
                }
                if let Ok(err) = tokens[1].parse::<i32>() {
                    info.error_code = err;
                    if err != info.last_error {
                        error!(
                            "{} reports {}",
                            self.options.executable,
                            codes::error_name(err)
                        );
                        info.last_error = err;
                    }
                }
            }
            Tag::Busy => {
                let n = match tokens.get(1).map(|t| t.parse::<u32>()) {
                    Some(Ok(n)) => n,
                    _ => {
                        warn!("malformed BUSY: {}", payload);
                        return;
                    }
                };
                if info.query_pending && info.query_number.is_none() && !info.command_sent {
                    debug!("process query refused, {} busy with {}", self.options.executable, n);
                    info.query_pending = false;
                } else {
                    info.busy_signal = true;
                    info.busy_number = n;
                    info.command_sent = false;
                }
            }
            Tag::Status => {
                if tokens.len() < 5 {
                    warn!("short STATUS: {}", payload);
                    return;
                }
                info.last_status = Some(payload.to_string());
                drop(info);
                if let Some(sink) = self.status_sink.lock().as_ref() {
                    sink(&tokens);
                }
                self.changed.notify_all();
                return;
            }
            Tag::Process => {
                if tokens.len() != 5 {
                    warn!("malformed PROCESS: {}", payload);
                    return;
                }
                let n = match tokens[1].parse::<u32>() {
                    Ok(n) => n,
                    Err(_) => {
                        warn!("malformed PROCESS: {}", payload);
                        return;
                    }
                };
                let ours = info.message_received && n == info.command_number;
                if info.query_number != Some(n) && !ours {
                    debug!("PROCESS {} is not ours", n);
                    return;
                }
                let pid = if is_local_host(&self.options.host) {
                    match is_process_running(&tokens[3]) {
                        Ok(Some(pid)) => Some(pid),
                        Ok(None) => tokens[4].parse().ok(),
                        Err(e) => {
                            warn!("{}", e);
                            None
                        }
                    }
                } else {
                    tokens[4].parse().ok()
                };
                if let Some(pid) = pid {
                    info.daemon_pid = Some(pid);
                    debug!("{} is pid {}", tokens[3], pid);
                }
                if info.query_number == Some(n) {
                    info.query_pending = false;
                    info.query_number = None;
                } else {
                    // an explicit process-info command completes like any other
                    self.completion(&mut info, Tag::Process, &tokens, payload);
                }
            }
            Tag::Exit => {
                if let Some(session) = self.open_session() {
                    session.mark_triggered();
                }
            }
            Tag::ImGone | Tag::GoHome | Tag::Confirm => {
                debug!("{} from {}", tag, self.options.executable);
            }
            Tag::Data | Tag::TipTilt | Tag::Focus | Tag::Failed => {
                debug!("{} not handled by this client", tag);
            }
        }
        self.changed.notify_all();
    }

    fn completion(&self, info: &mut ClientInfo, tag: Tag, tokens: &[String], payload: &str) {
        if tokens.len() < 3 {
            warn!("short {}: {}", tag, payload);
            return;
        }
        let n = match tokens[1].parse::<u32>() {
            Ok(n) => n,
            Err(_) => {
                warn!("malformed {}: {}", tag, payload);
                return;
            }
        };
        if n != info.command_number || !info.message_received {
            debug!("{} {} is not ours", tag, n);
            return;
        }
        let err = tokens[2].parse::<i32>().unwrap_or(codes::error::ERROR);
        info.command_error_code = err;
        info.error_code = err;
        info.params = tokens[3..].to_vec();
        info.message_received = false;
        info.complete = true;
    }

    fn send_message(&self, payload: &str) -> FabricResult<u32> {
        let session = self.open_session().ok_or(FabricError::Closed)?;
        {
            let deadline = Instant::now() + self.options.send_timeout;
            let mut info = self.info.lock();
            while info.query_pending {
                if self.changed.wait_until(&mut info, deadline).timed_out() {
                    debug!("process query to {} never answered", self.options.executable);
                    info.query_pending = false;
                    info.query_number = None;
                    break;
                }
            }
            info.command_sent = true;
            info.message_received = false;
            info.busy_signal = false;
            info.complete = false;
            info.params.clear();
        }
        if let Err(e) = session.send(payload) {
            self.info.lock().command_sent = false;
            return Err(e);
        }

        let deadline = Instant::now() + self.options.send_timeout;
        let mut info = self.info.lock();
        while info.command_sent {
            if self.changed.wait_until(&mut info, deadline).timed_out() {
                break;
            }
        }
        if info.command_sent {
            info.command_sent = false;
            return Err(FabricError::Timeout {
                op: "send_message",
                ms: self.options.send_timeout.as_millis() as u64,
            });
        }
        if info.busy_signal {
            return Err(FabricError::Busy(info.busy_number));
        }
        Ok(info.command_number)
    }

    fn send_command(&self, payload: &str) -> FabricResult<CommandReply> {
        let mut tries = 0;
        let number = loop {
            match self.send_message(payload) {
                Ok(n) => break n,
                Err(FabricError::Busy(n)) => {
                    tries += 1;
                    if tries >= BUSY_RETRIES || !self.running() {
                        return Err(FabricError::Busy(n));
                    }
                    debug!("{} busy with {}, retrying", self.options.executable, n);
                    self.pause(Duration::from_millis(timeouts::BUSY_RETRY_MS));
                }
                Err(e) => return Err(e),
            }
        };

        let mut info = self.info.lock();
        let ms = timeouts::completion_deadline_ms(info.timeout);
        let deadline = Instant::now() + Duration::from_millis(ms);
        while !info.complete {
            if self.changed.wait_until(&mut info, deadline).timed_out() {
                break;
            }
        }
        if !info.complete {
            info.message_received = false;
            return Err(FabricError::Timeout { op: "command", ms });
        }
        info.complete = false;
        Ok(CommandReply {
            number,
            error: info.command_error_code,
            params: info.params.clone(),
        })
    }
}
