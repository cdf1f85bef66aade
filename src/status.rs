//! STATUS payload assembly and its on-disk copies

use chrono::{DateTime, Local, TimeZone};
use log::warn;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::config::CommonConfig;
use crate::protocol::tag;

/// `STATUS <unix_sec> <YYYY-MM-DD HH:MM:SS> <initialized> <error_code> [fields]`
pub fn status_payload(unix_sec: i64, initialized: bool, error_code: i32, fields: &str) -> String {
    let stamp = match Local.timestamp_opt(unix_sec, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "1970-01-01 00:00:00".to_string(),
    };
    let mut out = format!(
        "{} {} {} {} {}",
        tag::STATUS,
        unix_sec,
        stamp,
        if initialized { 1 } else { 0 },
        error_code
    );
    let fields = fields.trim();
    if !fields.is_empty() {
        out.push(' ');
        out.push_str(fields);
    }
    out
}

/// `<status_dir>/<exe>_status` (rewritten) and `<telemetry_dir>/<exe>.dat`
/// (appended)
#[derive(Clone, Debug)]
pub struct StatusFiles {
    status: PathBuf,
    telemetry: PathBuf,
}

impl StatusFiles {
    pub fn new(config: &CommonConfig, executable: &str) -> Self {
        StatusFiles {
            status: config.status_file(executable),
            telemetry: config.telemetry_file(executable),
        }
    }

    pub fn status_path(&self) -> &Path {
        &self.status
    }

    pub fn telemetry_path(&self) -> &Path {
        &self.telemetry
    }

    pub fn record(&self, payload: &str) {
        self.record_at(Local::now(), payload);
    }

    fn record_at(&self, now: DateTime<Local>, payload: &str) {
        let line = format!("{} {}\n", now.format("%H:%M:%S%.3f"), payload);
        if let Err(e) = write_replacing(&self.status, &line) {
            warn!("status file {}: {}", self.status.display(), e);
        }
        if let Err(e) = append(&self.telemetry, &line) {
            warn!("telemetry file {}: {}", self.telemetry.display(), e);
        }
    }
}

fn write_replacing(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, line)
}

fn append(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())
}
