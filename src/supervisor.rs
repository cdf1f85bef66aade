//! Process supervision: single-instance locking, PID discovery, and
//! killing or relaunching a named daemon on a named host.

use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Signal, System};

use crate::config::CommonConfig;
use crate::error::{FabricError, FabricResult};
use crate::protocol::timeouts;

/// Linux truncates process names to this many bytes
const COMM_LEN: usize = 15;

fn name_matches(process_name: &str, executable: &str) -> bool {
    if process_name == executable {
        return true;
    }
    executable.len() > COMM_LEN
        && process_name.len() == COMM_LEN
        && executable.as_bytes().starts_with(process_name.as_bytes())
}

/// Scan the process table. `None` means the table could not be read.
fn scan(executable: &str) -> Option<Vec<u32>> {
    let sys = System::new_all();
    if sys.processes().is_empty() {
        return None;
    }
    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter(|(_, p)| p.thread_kind().is_none())
        .filter(|(_, p)| name_matches(&OsStr::new(p.name()).to_string_lossy(), executable))
        .map(|(pid, _)| pid.as_u32())
        .collect();
    pids.sort_unstable();
    Some(pids)
}

pub fn find_pids(executable: &str) -> Vec<u32> {
    scan(executable).unwrap_or_default()
}

/// The PID of the one running `executable`, if any. More than one match is
/// an error.
pub fn is_process_running(executable: &str) -> FabricResult<Option<u32>> {
    let pids = find_pids(executable);
    match pids.len() {
        0 => Ok(None),
        1 => Ok(Some(pids[0])),
        n => Err(FabricError::Supervisory(format!(
            "{} instances of {} running: {:?}",
            n, executable, pids
        ))),
    }
}

pub fn is_local_host(host: &str) -> bool {
    if host.is_empty() || host == "localhost" || host == "127.0.0.1" || host == "::1" {
        return true;
    }
    match hostname::get() {
        Ok(name) => {
            let name = name.to_string_lossy();
            let short = name.split('.').next().unwrap_or(&*name);
            host == &*name || host == short
        }
        Err(_) => false,
    }
}

/// Marker held for the life of a daemon; removes its lock file on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: Option<PathBuf>,
}

impl InstanceLock {
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            match fs::remove_file(&path) {
                Ok(()) => debug!("removed lock file {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("cannot remove lock file {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn lock_contents() -> String {
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("{} {}\n", std::process::id(), epoch)
}

fn write_lock(path: &Path, exclusive: bool) -> FabricResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| FabricError::io("create status dir", e))?;
    }
    let mut opts = OpenOptions::new();
    opts.write(true);
    if exclusive {
        opts.create_new(true);
    } else {
        opts.create(true).truncate(true);
    }
    let mut f = opts.open(path).map_err(|e| {
        if e.kind() == ErrorKind::AlreadyExists {
            FabricError::Supervisory(format!("lock file {} exists", path.display()))
        } else {
            FabricError::io("create lock file", e)
        }
    })?;
    f.write_all(lock_contents().as_bytes())
        .map_err(|e| FabricError::io("write lock file", e))
}

/// Make sure this is the only `executable` on the host.
///
/// With a readable process table, any other process of the same name is a
/// conflict and the lock file is (re)written. Without one, the lock file
/// alone decides: it must not already exist. `debug` skips the check.
pub fn check_process(executable: &str, lock_path: &Path, debug: bool) -> FabricResult<InstanceLock> {
    if debug {
        info!("debug mode, single-instance check skipped for {}", executable);
        return Ok(InstanceLock { path: None });
    }
    let me = std::process::id();
    match scan(executable) {
        Some(pids) => check_scan(executable, &pids, me, lock_path),
        None => {
            warn!("process table unavailable, falling back to {}", lock_path.display());
            write_lock(lock_path, true)?;
            Ok(InstanceLock {
                path: Some(lock_path.to_path_buf()),
            })
        }
    }
}

fn check_scan(executable: &str, pids: &[u32], me: u32, lock_path: &Path) -> FabricResult<InstanceLock> {
    let others: Vec<u32> = pids.iter().copied().filter(|&p| p != me).collect();
    if !others.is_empty() {
        return Err(FabricError::Supervisory(format!(
            "{} already running as {:?}",
            executable, others
        )));
    }
    write_lock(lock_path, false)?;
    Ok(InstanceLock {
        path: Some(lock_path.to_path_buf()),
    })
}

fn run_remote(host: &str, args: &[&str]) -> FabricResult<()> {
    debug!("ssh {} {}", host, args.join(" "));
    let status = Command::new("ssh")
        .arg(host)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| FabricError::io("ssh", e))?;
    if !status.success() {
        debug!("ssh {} {} exited with {}", host, args.join(" "), status);
    }
    Ok(())
}

/// Kills and relaunches daemons. Paths come from the common configuration.
#[derive(Clone, Debug)]
pub struct Supervisor {
    bin_dir: PathBuf,
    status_dir: PathBuf,
}

impl Supervisor {
    pub fn new(config: &CommonConfig) -> Self {
        Supervisor {
            bin_dir: config.bin_dir.clone(),
            status_dir: config.status_dir.clone(),
        }
    }

    pub fn lock_path(&self, executable: &str) -> PathBuf {
        self.status_dir.join(format!("{}.running", executable))
    }

    pub fn remove_lock_file(&self, executable: &str, host: &str) -> FabricResult<()> {
        let path = self.lock_path(executable);
        if is_local_host(host) {
            match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(FabricError::io("remove lock file", e)),
            }
        } else {
            let p = path.to_string_lossy();
            run_remote(host, &["rm", "-f", &*p])
        }
    }

    /// Forcibly stop `executable` on `host` and let its sockets drain
    pub fn kill_server(&self, executable: &str, pid: Option<u32>, host: &str) -> FabricResult<()> {
        if is_local_host(host) {
            let sys = System::new_all();
            let mut killed = 0;
            for (p, process) in sys.processes() {
                if process.thread_kind().is_some() {
                    continue;
                }
                let hit = name_matches(&OsStr::new(process.name()).to_string_lossy(), executable)
                    || pid == Some(p.as_u32());
                if hit && p.as_u32() != std::process::id() {
                    if process.kill_with(Signal::Kill).unwrap_or(false) {
                        killed += 1;
                    }
                }
            }
            info!("killed {} {} process(es)", killed, executable);
            self.remove_lock_file(executable, host)?;
            thread::sleep(Duration::from_millis(timeouts::LOCAL_DRAIN_MS));
        } else {
            run_remote(host, &["killall", executable])?;
            thread::sleep(Duration::from_millis(timeouts::REMOTE_DRAIN_MS));
        }
        Ok(())
    }

    /// Kill, relaunch as `[ssh host] <bin_dir>/<exe> -d <options> -p <port>`,
    /// then give the new server time to come up.
    pub fn reset_server(
        &self,
        executable: &str,
        pid: Option<u32>,
        port: u16,
        options: &str,
        host: &str,
    ) -> FabricResult<()> {
        self.kill_server(executable, pid, host)?;
        let args = launch_args(options, port);
        let program = self.bin_dir.join(executable);
        let mut cmd = if is_local_host(host) {
            let mut c = Command::new(&program);
            c.args(&args);
            c
        } else {
            let mut c = Command::new("ssh");
            c.arg(host).arg(program.as_os_str()).args(&args);
            c
        };
        info!(
            "relaunching {} on {}: {} {}",
            executable,
            host,
            program.display(),
            args.join(" ")
        );
        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                FabricError::Supervisory(format!("cannot launch {}: {}", program.display(), e))
            })?;
        // Reap the launcher; with -d it returns as soon as the daemon detaches
        thread::spawn(move || {
            let _ = child.wait();
        });
        thread::sleep(Duration::from_millis(timeouts::RELAUNCH_SETTLE_MS));
        Ok(())
    }
}

pub fn launch_args(options: &str, port: u16) -> Vec<String> {
    let mut args = vec!["-d".to_string()];
    args.extend(options.split_whitespace().map(str::to_string));
    args.push("-p".to_string());
    args.push(port.to_string());
    args
}

/// Detach from the controlling terminal. Must run before the I/O runtime
/// starts any threads.
#[cfg(unix)]
pub fn daemonize() -> FabricResult<()> {
    let rc = unsafe { libc::daemon(0, 0) };
    if rc != 0 {
        return Err(FabricError::io("daemonize", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn daemonize() -> FabricResult<()> {
    Err(FabricError::Supervisory(
        "daemon mode is not supported on this platform".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_names_match() {
        assert!(name_matches("watchdogd", "watchdogd"));
        assert!(!name_matches("watchdog", "watchdogd"));
        assert!(name_matches("telescope_contr", "telescope_controller"));
        assert!(!name_matches("telescope_cont", "telescope_controller"));
    }

    #[test]
    fn test_launch_line() {
        assert_eq!(launch_args("", 62024), vec!["-d", "-p", "62024"]);
        assert_eq!(
            launch_args(" -g  --verbose ", 62025),
            vec!["-d", "-g", "--verbose", "-p", "62025"]
        );
    }

    #[test]
    fn test_local_hosts() {
        assert!(is_local_host("localhost"));
        assert!(is_local_host("127.0.0.1"));
        let me = hostname::get().unwrap().to_string_lossy().to_string();
        assert!(is_local_host(&me));
        assert!(!is_local_host("no-such-host.invalid"));
    }

    #[test]
    fn test_lock_file_holds_pid_and_epoch() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("Status").join("testd.running");
        let mut lock = check_scan("testd", &[std::process::id()], std::process::id(), &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let fields: Vec<&str> = text.split_whitespace().collect();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0], std::process::id().to_string());
        assert!(fields[1].parse::<u64>().unwrap() > 1_600_000_000);
        lock.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_another_instance_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("testd.running");
        let err = check_scan("testd", &[1, std::process::id()], std::process::id(), &path).unwrap_err();
        assert!(matches!(err, FabricError::Supervisory(_)));
        assert!(!path.exists());
    }

    #[test]
    fn test_exclusive_lock_file_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("testd.running");
        write_lock(&path, true).unwrap();
        assert!(matches!(
            write_lock(&path, true),
            Err(FabricError::Supervisory(_))
        ));
    }

    #[test]
    fn test_lock_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("testd.running");
        {
            let _lock = check_scan("testd", &[], 1, &path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_debug_mode_skips_check() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("testd.running");
        let lock = check_process("testd", &path, true).unwrap();
        assert!(lock.path().is_none());
        assert!(!path.exists());
    }

    #[test]
    fn test_remove_missing_lock_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = CommonConfig::default();
        cfg.status_dir = tmp.path().to_path_buf();
        let sup = Supervisor::new(&cfg);
        sup.remove_lock_file("testd", "localhost").unwrap();
        fs::write(sup.lock_path("testd"), "1 2\n").unwrap();
        sup.remove_lock_file("testd", "localhost").unwrap();
        assert!(!sup.lock_path("testd").exists());
    }

    #[test]
    fn test_own_process_is_discoverable() {
        let me = std::process::id();
        let sys = System::new_all();
        if sys.processes().is_empty() {
            return;
        }
        let name = sys
            .process(sysinfo::Pid::from_u32(me))
            .map(|p| OsStr::new(p.name()).to_string_lossy().to_string());
        if let Some(name) = name {
            assert!(find_pids(&name).contains(&me));
        }
    }
}
