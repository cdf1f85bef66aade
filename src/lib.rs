//! Robo daemon communication fabric
//!
//! Length-prefixed framing, sessions, broadcast rooms, and the server and
//! client skeletons every instrument daemon is built on, plus process
//! supervision and the watchdog daemon that keeps the fleet running.

pub mod cli;
pub mod client;
pub mod codes;
pub mod config;
pub mod error;
pub mod logger;
pub mod mailbox;
pub mod ports;
pub mod protocol;
pub mod protocol_core;
pub mod room;
pub mod runtime;
pub mod server;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod watchdog;
