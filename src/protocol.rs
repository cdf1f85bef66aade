//! Shared protocol constants for the robo fabric framed transport

// Wire header: fixed-width, zero-padded decimal byte count of the payload
pub const HEADER_WIDTH: usize = 4;

// Largest payload a 4-digit header can describe
pub const MAX_PAYLOAD: usize = 9999;

// Default tokenizer delimiters (space, tab, newline, NUL, carriage return)
pub const DELIMITERS: &str = " \t\n\0\r";

// Quote character that groups a run of text into one token
pub const QUOTE: char = '"';

// Command numbers run 1..=COMMAND_NUMBER_MODULUS and then wrap
pub const COMMAND_NUMBER_MODULUS: u32 = 15000;

// Connection attempts before a client escalates to a peer restart, and
// restart attempts before it gives up
pub const MAX_ATTEMPTS: u32 = 5;

// BUSY replies are retried this many times before the caller sees the error
pub const BUSY_RETRIES: u32 = 10;

/// Reply and control tags. The first token of every non-command payload is
/// one of these.
pub mod tag {
    pub const WELCOME: &str = "WELCOME";
    pub const RECEIVED: &str = "RECEIVED";
    pub const COMPLETE: &str = "COMPLETE";
    pub const BUSY: &str = "BUSY";
    pub const ERROR: &str = "ERROR";
    pub const STATUS: &str = "STATUS";
    pub const PROCESS: &str = "PROCESS";
    pub const EXIT: &str = "EXIT";
    pub const IMGONE: &str = "IMGONE";
    pub const SHUTDOWN: &str = "SHUTDOWN";
    pub const GOHOME: &str = "GOHOME";
    pub const CONFIRM: &str = "CONFIRM";
    pub const DATA: &str = "DATA";
    pub const TIP_TILT: &str = "TIP_TILT";
    pub const FOCUS: &str = "FOCUS";
    pub const FAILED: &str = "FAILED";
}

// Centralized timing constants for sessions, servers and clients
pub mod timeouts {
    // Per-phase inbound deadline (ms)
    pub const READ_MS: u64 = 5000;

    // Per-write outbound deadline (ms)
    pub const WRITE_MS: u64 = 5000;

    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 1000;

    // Default command timeout advertised in RECEIVED (s)
    pub const COMMAND_S: u64 = 5;

    // Bound on waiting for RECEIVED after a send (ms)
    pub const SEND_ACK_MS: u64 = 5000;

    // Control thread tick (ms)
    pub const CONTROL_TICK_MS: u64 = 10;

    // Client thread tick (ms)
    pub const CLIENT_TICK_MS: u64 = 1;

    // Spacing between reconnect attempts (ms)
    pub const RECONNECT_MS: u64 = 200;

    // Telemetry-only clients wait this long instead of restarting a peer (ms)
    pub const TELEMETRY_WAIT_MS: u64 = 10_000;

    // Pause between BUSY retries (ms)
    pub const BUSY_RETRY_MS: u64 = 1000;

    // Control thread silence that trips the self-watchdog (s)
    pub const CONTROL_STALL_S: u64 = 5;

    // Extra status thread silence tolerated beyond its 1 s period (s)
    pub const STATUS_TOLERANCE_S: u64 = 2;

    // Socket drain after killing a local peer (ms)
    pub const LOCAL_DRAIN_MS: u64 = 100;

    // Socket drain after killing a remote peer (ms)
    pub const REMOTE_DRAIN_MS: u64 = 1000;

    // Time allowed for a relaunched peer to start accepting (ms)
    pub const RELAUNCH_SETTLE_MS: u64 = 2000;

    // Extra slack added to an advertised command timeout before giving up (ms)
    pub fn completion_deadline_ms(advertised_s: u64) -> u64 {
        advertised_s * 1000 + 500
    }
}
