//! Daemon log file backend for the `log` facade.
//!
//! Several processes may append to the same file, so every line is written
//! under an exclusive advisory lock.

use anyhow::{Context, Result};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Records logged with this target are tagged EMERGENCY.
pub const EMERGENCY: &str = "emergency";

pub struct DaemonLogger {
    file: Mutex<File>,
    echo: bool,
    level: LevelFilter,
}

impl DaemonLogger {
    pub fn new<P: AsRef<Path>>(path: P, level: LevelFilter, echo: bool) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("open log file {}", path.as_ref().display()))?;
        Ok(Self {
            file: Mutex::new(f),
            echo,
            level,
        })
    }

    /// Install as the global logger.
    pub fn install(self) -> Result<()> {
        let level = self.level;
        log::set_boxed_logger(Box::new(self)).context("install daemon logger")?;
        log::set_max_level(level);
        Ok(())
    }

    fn line(&self, s: &str) {
        let f = self.file.lock();
        let _guard = FileLock::exclusive(&f);
        let mut handle: &File = &f;
        let _ = handle.write_all(s.as_bytes());
        if self.echo {
            eprint!("{}", s);
        }
    }
}

pub fn format_line(record: &Record) -> String {
    let stamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    let origin = record.module_path().unwrap_or_else(|| record.target());
    let marker = if record.target() == EMERGENCY {
        "EMERGENCY: "
    } else {
        match record.level() {
            Level::Error => "ERROR: ",
            Level::Warn => "WARNING: ",
            Level::Debug | Level::Trace => "DEBUG: ",
            Level::Info => "",
        }
    };
    format!("{} {} {}{}\n", stamp, origin, marker, record.args())
}

impl Log for DaemonLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            self.line(&format_line(record));
        }
    }

    fn flush(&self) {
        let _ = self.file.lock().flush();
    }
}

/// Holds `flock(LOCK_EX)` on a file until dropped.
struct FileLock<'a> {
    #[allow(dead_code)]
    file: &'a File,
}

impl<'a> FileLock<'a> {
    #[cfg(unix)]
    fn exclusive(file: &'a File) -> Self {
        use std::os::unix::io::AsRawFd;
        unsafe {
            libc::flock(file.as_raw_fd(), libc::LOCK_EX);
        }
        FileLock { file }
    }

    #[cfg(not(unix))]
    fn exclusive(file: &'a File) -> Self {
        FileLock { file }
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
    }
}

/// Level filter from the `--verbose` / `--quiet` switches.
pub fn level_for(verbose: bool, quiet: bool) -> LevelFilter {
    if quiet {
        LevelFilter::Warn
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    }
}
