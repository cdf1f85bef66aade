//! The watchdog daemon: horizontal supervision of the robotic controller
//! and of the other watchdogs in the chain.
//!
//! The watchdog on the control host monitors `robod` and every peer
//! watchdog. Each peer monitors the control watchdog and the next link of
//! the chain (peers ordered by `chain_id`, wrapping). A SHUTDOWN received
//! by the control watchdog is forwarded to every peer before it stops.

use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::client::{Client, ClientOptions};
use crate::codes::{self, robod, watchdog};
use crate::config::{CommonConfig, PeerDescriptor};
use crate::ports::RoboPort;
use crate::server::{Command, CommandHandler, CommandKind, Completion};
use crate::supervisor::{is_local_host, Supervisor};

pub const EXECUTABLE: &str = "watchdogd";

/// Generous enough to walk the whole chain
const SHUTDOWN_TIMEOUT_S: u64 = 30;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Station {
    Control,
    /// `None` when this host is not listed among the peers
    Peer(Option<PeerDescriptor>),
}

impl Station {
    /// Decide which station runs on this host
    pub fn detect(config: &CommonConfig) -> Station {
        if is_local_host(&config.control_host) {
            return Station::Control;
        }
        let me = config
            .watchdog
            .peers
            .iter()
            .find(|p| is_local_host(&p.name) || is_local_host(&p.ip_address))
            .cloned();
        Station::Peer(me)
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Station::Control)
    }

    fn label(&self) -> String {
        match self {
            Station::Control => "control".to_string(),
            Station::Peer(Some(p)) => format!("peer-{}", p.chain_id),
            Station::Peer(None) => "peer".to_string(),
        }
    }
}

/// One daemon a watchdog keeps an eye on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorTarget {
    pub name: String,
    pub executable: String,
    pub host: String,
    pub port: u16,
    pub options: String,
    pub process_info_code: i32,
    pub shutdown_code: i32,
}

impl MonitorTarget {
    fn watchdog(name: &str, host: &str, port: Option<u16>) -> Self {
        MonitorTarget {
            name: name.to_string(),
            executable: EXECUTABLE.to_string(),
            host: host.to_string(),
            port: port.unwrap_or(RoboPort::Watchdogd.port()),
            options: String::new(),
            process_info_code: watchdog::PROCESS_INFO,
            shutdown_code: watchdog::SHUTDOWN,
        }
    }

    pub fn is_watchdog(&self) -> bool {
        self.executable == EXECUTABLE
    }

    pub fn client_options(&self, config: &CommonConfig) -> ClientOptions {
        let mut o = ClientOptions::new(&self.executable, &self.host, self.port);
        o.daemon_options = self.options.clone();
        o.process_info_code = Some(self.process_info_code);
        o.shutdown_code = Some(self.shutdown_code);
        o.deadlines = config.deadlines.to_deadlines();
        o
    }
}

/// Peers in chain order, without the control host
pub fn chain(config: &CommonConfig) -> Vec<PeerDescriptor> {
    let mut peers: Vec<PeerDescriptor> = config
        .watchdog
        .peers
        .iter()
        .filter(|p| p.name != config.control_host)
        .cloned()
        .collect();
    peers.sort_by_key(|p| p.chain_id);
    peers
}

pub fn monitor_targets(config: &CommonConfig, station: &Station) -> Vec<MonitorTarget> {
    let peers = chain(config);
    let mut targets = Vec::new();
    match station {
        Station::Control => {
            if config.watchdog.monitor_robod {
                targets.push(MonitorTarget {
                    name: "robod".to_string(),
                    executable: RoboPort::Robod.executable().to_string(),
                    host: "localhost".to_string(),
                    port: RoboPort::Robod.port(),
                    options: config.watchdog.robod_options.clone(),
                    process_info_code: robod::PROCESS_INFO,
                    shutdown_code: robod::SHUTDOWN,
                });
            }
            for p in &peers {
                targets.push(MonitorTarget::watchdog(&p.name, &p.ip_address, p.port));
            }
        }
        Station::Peer(me) => {
            targets.push(MonitorTarget::watchdog(
                &config.control_host,
                &config.control_host,
                config.watchdog.control_port,
            ));
            if let Some(me) = me {
                if let Some(i) = peers.iter().position(|p| p.name == me.name) {
                    let next = &peers[(i + 1) % peers.len()];
                    if next.name != me.name {
                        targets.push(MonitorTarget::watchdog(
                            &next.name,
                            &next.ip_address,
                            next.port,
                        ));
                    }
                }
            }
        }
    }
    targets
}

struct Monitor {
    target: MonitorTarget,
    client: Client,
}

pub struct WatchdogDaemon {
    config: Arc<CommonConfig>,
    station: Station,
    targets: Vec<MonitorTarget>,
    supervisor: Supervisor,
    monitors: Mutex<Vec<Monitor>>,
    active: AtomicBool,
}

impl WatchdogDaemon {
    pub fn new(config: Arc<CommonConfig>, station: Station) -> Self {
        let targets = monitor_targets(&config, &station);
        let supervisor = Supervisor::new(&config);
        WatchdogDaemon {
            config,
            station,
            targets,
            supervisor,
            monitors: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
        }
    }

    pub fn station(&self) -> &Station {
        &self.station
    }

    pub fn targets(&self) -> &[MonitorTarget] {
        &self.targets
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// (connected, total) across the monitor clients
    pub fn connected(&self) -> (usize, usize) {
        let monitors = self.monitors.lock();
        let up = monitors.iter().filter(|m| m.client.is_connected()).count();
        (up, monitors.len())
    }

    pub fn start_monitors(&self) {
        if self.active.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut monitors = self.monitors.lock();
        for target in &self.targets {
            let options = target.client_options(&self.config);
            match Client::start(options, self.supervisor.clone()) {
                Ok(client) => {
                    info!(
                        "monitoring {} ({}) on {}:{}",
                        target.name, target.executable, target.host, target.port
                    );
                    monitors.push(Monitor {
                        target: target.clone(),
                        client,
                    });
                }
                Err(e) => warn!("cannot monitor {}: {}", target.name, e),
            }
        }
    }

    /// Close every monitor. With `propagate`, watchdog peers are told to
    /// shut down first.
    pub fn stop_monitors(&self, propagate: bool) {
        self.active.store(false, Ordering::SeqCst);
        let monitors: Vec<Monitor> = self.monitors.lock().drain(..).collect();
        for m in monitors {
            let forward = propagate && m.target.is_watchdog();
            if forward {
                info!("forwarding shutdown to {}", m.target.name);
            } else {
                debug!("closing monitor for {}", m.target.name);
            }
            m.client.shutdown(forward);
        }
    }
}

impl CommandHandler for WatchdogDaemon {
    fn classify(&self, code: i32) -> Option<CommandKind> {
        match code {
            watchdog::PROCESS_INFO => Some(CommandKind::ProcessInfo),
            watchdog::START_WATCHDOG | watchdog::PAUSE_WATCHDOG => Some(CommandKind::Domain),
            watchdog::SHUTDOWN => Some(CommandKind::Shutdown { emergency: false }),
            watchdog::EMERGENCY_SHUTDOWN => Some(CommandKind::Shutdown { emergency: true }),
            _ => None,
        }
    }

    fn timeout(&self, code: i32) -> Duration {
        match code {
            watchdog::SHUTDOWN | watchdog::EMERGENCY_SHUTDOWN => {
                Duration::from_secs(SHUTDOWN_TIMEOUT_S)
            }
            _ => Duration::from_secs(crate::protocol::timeouts::COMMAND_S),
        }
    }

    fn execute(&self, command: &Command) -> Completion {
        info!(
            "executing command {}: {}",
            command.number,
            codes::command_name(command.code)
        );
        match command.code {
            watchdog::START_WATCHDOG => {
                self.start_monitors();
                Completion::ok()
            }
            watchdog::PAUSE_WATCHDOG => {
                self.stop_monitors(false);
                Completion::ok()
            }
            watchdog::SHUTDOWN | watchdog::EMERGENCY_SHUTDOWN => {
                self.stop_monitors(self.station.is_control());
                Completion::ok()
            }
            other => {
                warn!("unknown command {}", other);
                Completion::error(codes::error::ERROR_UNKNOWN_COMMAND)
            }
        }
    }

    fn shutdown_code(&self) -> Option<i32> {
        Some(watchdog::SHUTDOWN)
    }

    fn status_fields(&self) -> String {
        let (up, total) = self.connected();
        format!(
            "{} {} {} {}",
            self.station.label(),
            if self.is_active() { 1 } else { 0 },
            up,
            total
        )
    }
}
