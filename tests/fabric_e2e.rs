use parking_lot::Mutex;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use robo_fabric::client::{Client, ClientOptions};
use robo_fabric::config::CommonConfig;
use robo_fabric::error::FabricError;
use robo_fabric::protocol_core::{self, tokenize};
use robo_fabric::server::{
    Command, CommandHandler, CommandKind, Completion, Server, ServerOptions, StallAction,
    StallReport,
};
use robo_fabric::session::Deadlines;
use robo_fabric::supervisor::Supervisor;

const SHUTDOWN: i32 = 900;
const PROCESS_INFO: i32 = 901;
const SLOW: i32 = 101;

struct TestHandler {
    stall: Mutex<Option<Duration>>,
    ticks: AtomicU64,
}

impl TestHandler {
    fn new() -> Arc<Self> {
        Arc::new(TestHandler {
            stall: Mutex::new(None),
            ticks: AtomicU64::new(0),
        })
    }
}

impl CommandHandler for TestHandler {
    fn classify(&self, code: i32) -> Option<CommandKind> {
        match code {
            SHUTDOWN => Some(CommandKind::Shutdown { emergency: false }),
            PROCESS_INFO => Some(CommandKind::ProcessInfo),
            42 | SLOW | 102 | 103 => Some(CommandKind::Domain),
            _ => None,
        }
    }

    fn timeout(&self, code: i32) -> Duration {
        if code == SLOW {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(5)
        }
    }

    fn execute(&self, command: &Command) -> Completion {
        match command.code {
            SLOW => {
                std::thread::sleep(Duration::from_millis(1500));
                Completion::ok()
            }
            103 => Completion::error(17).with_params(vec!["dome".into(), "stuck".into()]),
            _ => Completion::ok(),
        }
    }

    fn shutdown_code(&self) -> Option<i32> {
        Some(SHUTDOWN)
    }

    fn on_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let stall = self.stall.lock().take();
        if let Some(d) = stall {
            std::thread::sleep(d);
        }
    }
}

fn options() -> ServerOptions {
    let mut o = ServerOptions::new("testd", 0);
    o.stall_action = StallAction::Notify(Arc::new(|_: &StallReport| {}));
    o
}

fn start(handler: Arc<TestHandler>) -> Server {
    Server::start(options(), handler).unwrap()
}

/// Bare framed socket, for checking exact wire traffic
struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    fn connect(port: u16) -> RawPeer {
        let stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        RawPeer { stream }
    }

    fn send(&mut self, payload: &str) {
        let frame = protocol_core::encode(payload.as_bytes()).unwrap();
        self.stream.write_all(&frame).unwrap();
    }

    fn recv(&mut self) -> String {
        let mut hdr = [0u8; 4];
        self.stream.read_exact(&mut hdr).unwrap();
        let len = protocol_core::decode_header(&hdr).unwrap();
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).unwrap();
        String::from_utf8(payload).unwrap()
    }

    /// Next payload that is not a periodic STATUS
    fn reply(&mut self) -> String {
        loop {
            let p = self.recv();
            if !p.starts_with("STATUS ") {
                return p;
            }
        }
    }
}

fn client_for(port: u16) -> Client {
    let mut o = ClientOptions::new("testd", "127.0.0.1", port);
    o.telemetry_only = true;
    o.telemetry_wait = Duration::from_millis(300);
    let client = Client::start(o, Supervisor::new(&CommonConfig::default())).unwrap();
    assert!(client.wait_until(Duration::from_secs(5), |i| i.welcomes >= 1));
    client
}

#[test]
fn happy_command_on_the_wire() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    peer.send("42");
    assert_eq!(peer.reply(), "RECEIVED 1 5 42");
    assert_eq!(peer.reply(), "COMPLETE 1 0");
}

#[test]
fn command_right_after_welcome_with_process_query() {
    let server = start(TestHandler::new());
    let mut o = ClientOptions::new("testd", "127.0.0.1", server.local_port());
    o.telemetry_only = true;
    o.process_info_code = Some(PROCESS_INFO);
    let client = Client::start(o, Supervisor::new(&CommonConfig::default())).unwrap();
    assert!(client.wait_until(Duration::from_secs(5), |i| i.welcomes >= 1));

    // the WELCOME query takes number 1
    let reply = client.send_command("42").unwrap();
    assert_eq!(reply.number, 2);
    assert_eq!(reply.error, 0);
    let info = client.info();
    assert!(!info.busy_signal);
    assert!(!info.query_pending);
    assert_eq!(info.daemon_pid, Some(std::process::id()));

    let reply = client.send_command("103").unwrap();
    assert_eq!(reply.number, 3);
    assert_eq!(reply.error, 17);
}

#[test]
fn happy_command_through_client() {
    let server = start(TestHandler::new());
    let client = client_for(server.local_port());
    let reply = client.send_command("42").unwrap();
    assert_eq!(reply.number, 1);
    assert_eq!(reply.error, 0);
    let info = client.info();
    assert_eq!(info.command_number, 1);
    assert_eq!(info.command_error_code, 0);

    let reply = client.send_command("103").unwrap();
    assert_eq!(reply.number, 2);
    assert_eq!(reply.error, 17);
    assert_eq!(reply.params, vec!["dome", "stuck"]);
    assert!(matches!(reply.into_result(), Err(FabricError::Domain(17))));
}

#[test]
fn busy_rejection() {
    let server = start(TestHandler::new());
    let mut a = RawPeer::connect(server.local_port());
    let mut b = RawPeer::connect(server.local_port());
    assert_eq!(a.recv(), "WELCOME ");
    assert_eq!(b.recv(), "WELCOME ");

    a.send("101");
    assert_eq!(a.reply(), "RECEIVED 1 30 101");
    b.send("102");
    assert_eq!(b.reply(), "BUSY 1");

    assert_eq!(a.reply(), "COMPLETE 1 0");
    // completions go to the whole room
    assert_eq!(b.reply(), "COMPLETE 1 0");

    b.send("102");
    assert_eq!(b.reply(), "RECEIVED 2 5 102");
    assert_eq!(b.reply(), "COMPLETE 2 0");
}

#[test]
fn busy_surfaces_as_admission_error() {
    let server = start(TestHandler::new());
    let mut a = RawPeer::connect(server.local_port());
    assert_eq!(a.recv(), "WELCOME ");
    let client = client_for(server.local_port());

    a.send("101");
    assert_eq!(a.reply(), "RECEIVED 1 30 101");
    assert!(server.slot().processing);
    match client.send_message("102") {
        Err(FabricError::Busy(n)) => assert_eq!(n, 1),
        other => panic!("expected BUSY, got {:?}", other),
    }
    // send_command retries until the slow command is done
    let reply = client.send_command("102").unwrap();
    assert_eq!(reply.number, 2);
}

#[test]
fn unknown_tag_is_ignored() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    peer.send("HELLO world");
    peer.send("42");
    assert_eq!(peer.reply(), "RECEIVED 1 5 42");
    assert_eq!(peer.reply(), "COMPLETE 1 0");
    assert_eq!(server.room().connection_count(), 1);
}

#[test]
fn unknown_code_completes_with_error() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    peer.send("7777 a b");
    assert_eq!(peer.reply(), "RECEIVED 1 5 7777 a b");
    assert_eq!(peer.reply(), "COMPLETE 1 22");
}

#[test]
fn oversized_echo_still_acknowledged() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    let request = format!("42 {}", "x".repeat(9990));
    peer.send(&request);
    let ack = peer.reply();
    assert!(ack.starts_with("RECEIVED 1 5 42 xxx"), "got {:.40}", ack);
    assert_eq!(ack.len(), 9999);
    assert_eq!(peer.reply(), "COMPLETE 1 0");
}

#[test]
fn process_info_reports_pid() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    peer.send("901");
    assert_eq!(peer.reply(), "RECEIVED 1 5 901");
    assert_eq!(
        peer.reply(),
        format!("PROCESS 1 0 testd {}", std::process::id())
    );
}

#[test]
fn status_arrives_every_second() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");

    let mut seen = Vec::new();
    while seen.len() < 4 {
        let p = peer.recv();
        if p.starts_with("STATUS ") {
            seen.push((Instant::now(), tokenize(&p)));
        }
    }
    for pair in seen.windows(2) {
        let (t0, a) = &pair[0];
        let (t1, b) = &pair[1];
        assert!(a.len() >= 6);
        let s0: i64 = a[1].parse().unwrap();
        let s1: i64 = b[1].parse().unwrap();
        assert_eq!(s1, s0 + 1);
        let gap = t1.duration_since(*t0);
        assert!(
            gap > Duration::from_millis(800) && gap < Duration::from_millis(1200),
            "status gap {:?}",
            gap
        );
    }
}

#[test]
fn shutdown_goes_home() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    peer.send("SHUTDOWN");
    assert_eq!(peer.reply(), "RECEIVED 1 5 SHUTDOWN");
    assert_eq!(peer.reply(), "SHUTDOWN 1 0");
    assert_eq!(peer.reply(), "GOHOME");
    server.wait();
}

#[test]
fn exit_is_confirmed() {
    let server = start(TestHandler::new());
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");
    peer.send("EXIT");
    assert_eq!(peer.reply(), "CONFIRM");
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.room().connection_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(server.room().connection_count(), 0);
    assert!(server.is_operating());
}

#[test]
fn client_reconnects_after_restart() {
    let server = start(TestHandler::new());
    let port = server.local_port();
    let client = client_for(port);
    assert_eq!(client.send_command("42").unwrap().number, 1);

    drop(server);
    assert!(client.wait_until(Duration::from_secs(5), |i| !i.connected));

    let mut opts = options();
    opts.port = port;
    let mut restarted = None;
    for _ in 0..100 {
        match Server::start(opts.clone(), TestHandler::new()) {
            Ok(s) => {
                restarted = Some(s);
                break;
            }
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
    let _server = restarted.expect("port never came free");
    assert!(client.wait_until(Duration::from_secs(10), |i| i.welcomes >= 2));
    assert_eq!(client.info().welcomes, 2);
    assert_eq!(client.send_command("42").unwrap().number, 1);
}

#[test]
fn control_stall_trips_self_watchdog() {
    let handler = TestHandler::new();
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let mut opts = options();
    opts.stall_action = StallAction::Notify(Arc::new(move |r: &StallReport| {
        let _ = tx.lock().send(r.clone());
    }));
    let _server = Server::start(opts, handler.clone()).unwrap();

    let start = Instant::now();
    *handler.stall.lock() = Some(Duration::from_secs(6));
    let report = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(report.thread, "control");
    assert!(report.silent >= Duration::from_secs(5));
    assert!(start.elapsed() < Duration::from_secs(7));
}

#[test]
fn deferred_shutdown_does_not_spin() {
    let handler = TestHandler::new();
    let server = Server::start(options(), handler.clone()).unwrap();
    let mut peer = RawPeer::connect(server.local_port());
    assert_eq!(peer.recv(), "WELCOME ");

    peer.send("101");
    assert_eq!(peer.reply(), "RECEIVED 1 30 101");
    server.handle().request_shutdown();
    std::thread::sleep(Duration::from_millis(100));
    let before = handler.ticks.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(500));
    let looped = handler.ticks.load(Ordering::Relaxed) - before;
    // one pass per 10 ms tick when idle
    assert!(looped < 200, "control loop spun {} times in 500 ms", looped);

    assert_eq!(peer.reply(), "COMPLETE 1 0");
    assert_eq!(peer.reply(), "SHUTDOWN 2 0");
    assert_eq!(peer.reply(), "GOHOME");
    server.wait();
}

#[test]
fn read_deadline_kills_only_that_session() {
    let mut opts = options();
    opts.deadlines = Deadlines {
        read: Some(Duration::from_millis(100)),
        write: Some(Duration::from_secs(1)),
        idle: None,
    };
    let server = Server::start(opts, TestHandler::new()).unwrap();
    let room = server.room();

    let mut stalled = RawPeer::connect(server.local_port());
    assert_eq!(stalled.recv(), "WELCOME ");
    let deadline = Instant::now() + Duration::from_secs(5);
    while room.connection_count() < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(room.connection_count(), 1);

    // half a header, then nothing
    stalled.stream.write_all(b"00").unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    while room.connection_count() > 0 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(room.connection_count(), 0);
    assert!(server.is_operating());

    let mut fresh = RawPeer::connect(server.local_port());
    assert_eq!(fresh.recv(), "WELCOME ");
    fresh.send("42");
    assert_eq!(fresh.reply(), "RECEIVED 1 5 42");
    assert_eq!(fresh.reply(), "COMPLETE 1 0");
}
