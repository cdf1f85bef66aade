//! Command line shared by every daemon

use clap::Parser;
use std::ffi::OsString;
use std::path::PathBuf;

/// Common daemon options
#[derive(Clone, Debug, Parser)]
#[command(version, about = "Robotic instrument daemon")]
pub struct DaemonOpts {
    /// Detach and run in the background
    #[arg(short = 'd', long = "daemon")]
    pub daemon: bool,

    /// Listen port (defaults to the role port)
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Debug mode: skip the single-instance check
    #[arg(short = 'g', long = "debug")]
    pub debug: bool,

    /// Debug logging, echoed to stderr
    #[arg(long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Warnings and errors only
    #[arg(long)]
    pub quiet: bool,

    /// Common configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,
}

impl DaemonOpts {
    /// Parse, printing usage and exiting 0 on `--help` or anything unknown
    pub fn parse_or_exit() -> Self {
        Self::parse_args_or_exit(std::env::args_os())
    }

    pub fn parse_args_or_exit<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        match Self::try_parse_from(args) {
            Ok(opts) => opts,
            Err(e) => {
                let _ = e.print();
                std::process::exit(0);
            }
        }
    }

    pub fn listen_port(&self, role_port: u16) -> u16 {
        self.port.unwrap_or(role_port)
    }
}
