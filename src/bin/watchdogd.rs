use anyhow::{Context, Result};
use log::{error, info};
use std::sync::Arc;

use robo_fabric::cli::DaemonOpts;
use robo_fabric::config::CommonConfig;
use robo_fabric::logger::{level_for, DaemonLogger};
use robo_fabric::ports::RoboPort;
use robo_fabric::server::{Server, ServerOptions};
use robo_fabric::status::StatusFiles;
use robo_fabric::supervisor;
use robo_fabric::watchdog::{Station, WatchdogDaemon, EXECUTABLE};

fn main() -> Result<()> {
    let opts = DaemonOpts::parse_or_exit();
    let config = Arc::new(CommonConfig::load(opts.config.as_deref())?);

    // Detach before the I/O runtime spawns any threads
    if opts.daemon {
        supervisor::daemonize().context("Failed to daemonize")?;
    }

    DaemonLogger::new(
        config.log_file(EXECUTABLE),
        level_for(opts.verbose, opts.quiet),
        opts.verbose,
    )?
    .install()?;

    let mut lock = match supervisor::check_process(EXECUTABLE, &config.lock_file(EXECUTABLE), opts.debug) {
        Ok(lock) => lock,
        Err(e) => {
            error!("single-instance check failed: {}", e);
            return Err(e).context("another watchdogd is running");
        }
    };

    let station = Station::detect(&config);
    info!("starting {} as {:?}", EXECUTABLE, station);
    let daemon = Arc::new(WatchdogDaemon::new(config.clone(), station));

    let mut options = ServerOptions::new(EXECUTABLE, opts.listen_port(RoboPort::Watchdogd.port()));
    options.deadlines = config.deadlines.to_deadlines();
    options.status_files = Some(StatusFiles::new(&config, EXECUTABLE));
    options.lock_file = lock.path().map(|p| p.to_path_buf());

    let server = Server::start(options, daemon.clone()).context("Failed to start watchdogd server")?;

    let handle = server.handle();
    ctrlc::set_handler(move || {
        info!("interrupted, shutting down");
        handle.request_shutdown();
    })
    .context("Error setting Ctrl-C handler")?;

    daemon.start_monitors();
    server.wait();
    daemon.stop_monitors(false);

    lock.release();
    info!("{} exiting", EXECUTABLE);
    log::logger().flush();
    Ok(())
}
