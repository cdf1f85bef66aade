use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use robo_fabric::client::{Client, ClientOptions};
use robo_fabric::codes::watchdog;
use robo_fabric::config::{CommonConfig, PeerDescriptor};
use robo_fabric::protocol_core;
use robo_fabric::server::{Server, ServerOptions, StallAction, StallReport};
use robo_fabric::supervisor::Supervisor;
use robo_fabric::watchdog::{Station, WatchdogDaemon, EXECUTABLE};

fn free_port() -> u16 {
    let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let p = sock.local_addr().unwrap().port();
    drop(sock);
    p
}

fn scratch_config(root: &Path) -> CommonConfig {
    let mut cfg = CommonConfig::default();
    cfg.home_dir = root.to_path_buf();
    cfg.log_dir = root.join("Logs");
    cfg.bin_dir = root.join("bin");
    cfg.status_dir = root.join("Status");
    cfg.telemetry_dir = root.join("Telemetry");
    cfg.control_host = "127.0.0.1".to_string();
    cfg.watchdog.monitor_robod = false;
    cfg
}

fn wait_for<F: Fn() -> bool>(limit: Duration, f: F) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    f()
}

fn start_watchdog(cfg: CommonConfig, station: Station, port: u16) -> (Arc<WatchdogDaemon>, Server) {
    let daemon = Arc::new(WatchdogDaemon::new(Arc::new(cfg), station));
    let mut options = ServerOptions::new(EXECUTABLE, port);
    options.stall_action = StallAction::Notify(Arc::new(|_: &StallReport| {}));
    let server = Server::start(options, daemon.clone()).unwrap();
    (daemon, server)
}

fn frame(stream: &mut TcpStream) -> String {
    let mut hdr = [0u8; 4];
    stream.read_exact(&mut hdr).unwrap();
    let len = protocol_core::decode_header(&hdr).unwrap();
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    String::from_utf8(payload).unwrap()
}

fn reply(stream: &mut TcpStream) -> String {
    loop {
        let p = frame(stream);
        if !p.starts_with("STATUS ") && !p.starts_with("COMPLETE ") && !p.starts_with("PROCESS ") {
            return p;
        }
    }
}

/// Submit `payload`, retrying while the daemon is busy with a monitor's
/// process-info query. Returns the command number it was admitted under.
fn submit(stream: &mut TcpStream, payload: &str) -> u32 {
    let framed = protocol_core::encode(payload.as_bytes()).unwrap();
    for _ in 0..50 {
        stream.write_all(&framed).unwrap();
        let r = reply(stream);
        if r.starts_with("BUSY ") {
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        let t = protocol_core::tokenize(&r);
        assert_eq!(t[0], "RECEIVED", "unexpected reply {}", r);
        assert_eq!(t[2], "30");
        assert_eq!(t[3], payload);
        return t[1].parse().unwrap();
    }
    panic!("daemon stayed busy");
}

#[test]
fn shutdown_propagates_down_the_chain() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, p1, p2) = (free_port(), free_port(), free_port());

    let mut control_cfg = scratch_config(tmp.path());
    control_cfg.watchdog.peers = vec![
        PeerDescriptor {
            name: "alpha".into(),
            ip_address: "127.0.0.1".into(),
            chain_id: 1,
            port: Some(p1),
        },
        PeerDescriptor {
            name: "beta".into(),
            ip_address: "127.0.0.1".into(),
            chain_id: 2,
            port: Some(p2),
        },
    ];
    let mut peer_cfg = scratch_config(tmp.path());
    peer_cfg.watchdog.control_port = Some(pc);

    let (control, control_server) = start_watchdog(control_cfg, Station::Control, pc);
    let (alpha, alpha_server) = start_watchdog(peer_cfg.clone(), Station::Peer(None), p1);
    let (beta, beta_server) = start_watchdog(peer_cfg, Station::Peer(None), p2);

    control.start_monitors();
    alpha.start_monitors();
    beta.start_monitors();
    assert!(wait_for(Duration::from_secs(10), || control.connected() == (2, 2)
        && alpha.connected() == (1, 1)
        && beta.connected() == (1, 1)));

    let mut operator = TcpStream::connect(("127.0.0.1", pc)).unwrap();
    operator
        .set_read_timeout(Some(Duration::from_secs(30)))
        .unwrap();
    assert_eq!(frame(&mut operator), "WELCOME ");
    let n = submit(&mut operator, "SHUTDOWN");
    assert_eq!(reply(&mut operator), format!("SHUTDOWN {} 0", n));
    assert_eq!(reply(&mut operator), "GOHOME");

    assert!(wait_for(Duration::from_secs(5), || !alpha_server.is_operating()
        && !beta_server.is_operating()));
    assert!(wait_for(Duration::from_secs(5), || !control_server.is_operating()));
    assert_eq!(control.connected(), (0, 0));
    assert!(!alpha.is_active() && !beta.is_active());

    alpha_server.wait();
    beta_server.wait();
    control_server.wait();
}

#[test]
fn pause_and_start_toggle_monitors() {
    let tmp = tempfile::tempdir().unwrap();
    let (pc, p1) = (free_port(), free_port());
    let mut control_cfg = scratch_config(tmp.path());
    control_cfg.watchdog.peers = vec![PeerDescriptor {
        name: "alpha".into(),
        ip_address: "127.0.0.1".into(),
        chain_id: 1,
        port: Some(p1),
    }];
    let mut peer_cfg = scratch_config(tmp.path());
    peer_cfg.watchdog.control_port = Some(pc);

    let (control, _control_server) = start_watchdog(control_cfg.clone(), Station::Control, pc);
    let (_alpha, _alpha_server) = start_watchdog(peer_cfg, Station::Peer(None), p1);
    control.start_monitors();
    assert!(wait_for(Duration::from_secs(10), || control.connected() == (1, 1)));

    let mut o = ClientOptions::new(EXECUTABLE, "127.0.0.1", pc);
    o.telemetry_only = true;
    let operator = Client::start(o, Supervisor::new(&control_cfg)).unwrap();
    assert!(operator.wait_until(Duration::from_secs(5), |i| i.welcomes >= 1));

    let reply = operator
        .send_command(&watchdog::PAUSE_WATCHDOG.to_string())
        .unwrap();
    assert_eq!(reply.error, 0);
    assert!(!control.is_active());
    assert_eq!(control.connected(), (0, 0));

    let reply = operator
        .send_command(&watchdog::START_WATCHDOG.to_string())
        .unwrap();
    assert_eq!(reply.error, 0);
    assert!(control.is_active());
    assert!(wait_for(Duration::from_secs(10), || control.connected() == (1, 1)));
}

/// Kill a real watchdogd and let a client's reconnect ladder bring it back.
#[test]
fn killed_daemon_is_restarted() {
    let exe = Path::new(env!("CARGO_BIN_EXE_watchdogd"));
    let tmp = tempfile::tempdir().unwrap();
    let port = free_port();

    // a control station with nothing to monitor
    let mut cfg = scratch_config(tmp.path());
    cfg.control_host = "localhost".to_string();
    cfg.bin_dir = exe.parent().unwrap().to_path_buf();
    let cfg_path = tmp.path().join("common.toml");
    std::fs::write(
        &cfg_path,
        format!(
            "home_dir = {:?}\nlog_dir = {:?}\nbin_dir = {:?}\nstatus_dir = {:?}\ntelemetry_dir = {:?}\ncontrol_host = \"localhost\"\n\n[watchdog]\nmonitor_robod = false\n",
            cfg.home_dir, cfg.log_dir, cfg.bin_dir, cfg.status_dir, cfg.telemetry_dir
        ),
    )
    .unwrap();
    let cfg_arg = cfg_path.to_string_lossy().to_string();

    let mut first = Command::new(exe)
        .args(["-g", "-p", &port.to_string(), "-c", &cfg_arg])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    assert!(wait_for(Duration::from_secs(10), || TcpStream::connect(("127.0.0.1", port)).is_ok()));

    let mut o = ClientOptions::new(EXECUTABLE, "localhost", port);
    o.daemon_options = format!("-g -c {}", cfg_arg);
    o.process_info_code = Some(watchdog::PROCESS_INFO);
    o.shutdown_code = Some(watchdog::SHUTDOWN);
    o.max_attempts = 2;
    let supervisor = Supervisor::new(&cfg);
    let client = Client::start(o, supervisor.clone()).unwrap();
    assert!(client.wait_until(Duration::from_secs(10), |i| i.welcomes >= 1 && i.daemon_pid.is_some()));

    first.kill().unwrap();
    let _ = first.wait();

    let back = client.wait_until(Duration::from_secs(20), |i| i.welcomes >= 2);
    let info = client.info();
    client.shutdown(true);
    if !back {
        let _ = supervisor.kill_server(EXECUTABLE, None, "localhost");
    }
    assert!(back, "no fresh WELCOME after restart: {:?}", info);
    assert_eq!(info.reset_attempts, 0);
}
