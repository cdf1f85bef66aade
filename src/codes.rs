//! Command and error code registries.
//!
//! Codes are plain integers on the wire. These tables give them names for
//! log messages; unknown codes print as their number.

/// Error codes shared by every daemon
pub mod error {
    pub const NO_ERROR: i32 = 0;
    pub const ERROR: i32 = -1;
    pub const ERROR_FILE_NAME_EMPTY: i32 = 1;
    pub const ERROR_FILE_NO_EXIST: i32 = 2;
    pub const ERROR_FILE_OPEN: i32 = 3;
    pub const ERROR_FILE_CLOSE: i32 = 4;
    pub const ERROR_FILE_EMPTY: i32 = 5;
    pub const ERROR_MAX_ATTEMPTS_FAIL: i32 = 6;
    pub const ERROR_PARAM_BLANK: i32 = 7;
    pub const ERROR_DIRECTORY: i32 = 8;
    pub const ERROR_SYSTEM_DIRECTORY: i32 = 9;
    pub const ERROR_CONTROL_CAUGHT: i32 = 10;
    pub const ERROR_FATAL: i32 = 11;
    pub const ERROR_OPEN: i32 = 12;
    pub const ERROR_CLOSE: i32 = 13;
    pub const ERROR_START: i32 = 14;
    pub const ERROR_STOP: i32 = 15;
    pub const ERROR_STATUS: i32 = 16;
    pub const ERROR_FOUND: i32 = 17;
    pub const ERROR_TIME_DIFFERENCE: i32 = 18;
    pub const ERROR_CLIENT_BUSY: i32 = 19;
    pub const ERROR_TIMEOUT: i32 = 20;
    pub const ERROR_UNKNOWN: i32 = 21;
    pub const ERROR_UNKNOWN_COMMAND: i32 = 22;
    pub const ERROR_DAEMON_CONNECTION: i32 = 23;
}

/// Command codes shared by every daemon
pub mod command {
    pub const NO_COMMAND: i32 = 0;
    pub const MESSAGE_REPLY: i32 = 1;
    pub const ROUTINE_EXIT: i32 = 2;
    pub const DAEMON_SHUTDOWN: i32 = 3;
}

/// robod partition: 1000..1099
pub mod robod {
    pub const PROCESS_INFO: i32 = 1000;
    pub const SHUTDOWN: i32 = 1001;
    pub const EMERGENCY_SHUTDOWN: i32 = 1002;
}

/// watchdogd partition: 1100..1199
pub mod watchdog {
    pub const PROCESS_INFO: i32 = 1100;
    pub const START_WATCHDOG: i32 = 1101;
    pub const PAUSE_WATCHDOG: i32 = 1102;
    pub const SHUTDOWN: i32 = 1103;
    pub const EMERGENCY_SHUTDOWN: i32 = 1104;

    pub const ERROR_DAEMON_CONNECTION: i32 = 1150;
    pub const CONTROL_COMMAND_ERROR: i32 = 1151;
    pub const CONTROL_STATUS_ERROR: i32 = 1152;
    pub const ERROR_CONTROL_ERROR: i32 = 1153;
    pub const ERROR_PEER_SHUTDOWN: i32 = 1154;
}

const ERROR_NAMES: &[(i32, &str)] = &[
    (error::NO_ERROR, "NO_ERROR"),
    (error::ERROR, "ERROR"),
    (error::ERROR_FILE_NAME_EMPTY, "ERROR_FILE_NAME_EMPTY"),
    (error::ERROR_FILE_NO_EXIST, "ERROR_FILE_NO_EXIST"),
    (error::ERROR_FILE_OPEN, "ERROR_FILE_OPEN"),
    (error::ERROR_FILE_CLOSE, "ERROR_FILE_CLOSE"),
    (error::ERROR_FILE_EMPTY, "ERROR_FILE_EMPTY"),
    (error::ERROR_MAX_ATTEMPTS_FAIL, "ERROR_MAX_ATTEMPTS_FAIL"),
    (error::ERROR_PARAM_BLANK, "ERROR_PARAM_BLANK"),
    (error::ERROR_DIRECTORY, "ERROR_DIRECTORY"),
    (error::ERROR_SYSTEM_DIRECTORY, "ERROR_SYSTEM_DIRECTORY"),
    (error::ERROR_CONTROL_CAUGHT, "ERROR_CONTROL_CAUGHT"),
    (error::ERROR_FATAL, "ERROR_FATAL"),
    (error::ERROR_OPEN, "ERROR_OPEN"),
    (error::ERROR_CLOSE, "ERROR_CLOSE"),
    (error::ERROR_START, "ERROR_START"),
    (error::ERROR_STOP, "ERROR_STOP"),
    (error::ERROR_STATUS, "ERROR_STATUS"),
    (error::ERROR_FOUND, "ERROR_FOUND"),
    (error::ERROR_TIME_DIFFERENCE, "ERROR_TIME_DIFFERENCE"),
    (error::ERROR_CLIENT_BUSY, "ERROR_CLIENT_BUSY"),
    (error::ERROR_TIMEOUT, "ERROR_TIMEOUT"),
    (error::ERROR_UNKNOWN, "ERROR_UNKNOWN"),
    (error::ERROR_UNKNOWN_COMMAND, "ERROR_UNKNOWN_COMMAND"),
    (error::ERROR_DAEMON_CONNECTION, "ERROR_DAEMON_CONNECTION"),
    (watchdog::ERROR_DAEMON_CONNECTION, "WATCHDOGD_ERROR_DAEMON_CONNECTION"),
    (watchdog::CONTROL_COMMAND_ERROR, "WATCHDOGD_CONTROL_COMMAND_ERROR"),
    (watchdog::CONTROL_STATUS_ERROR, "WATCHDOGD_CONTROL_STATUS_ERROR"),
    (watchdog::ERROR_CONTROL_ERROR, "WATCHDOGD_ERROR_CONTROL_ERROR"),
    (watchdog::ERROR_PEER_SHUTDOWN, "WATCHDOGD_ERROR_PEER_SHUTDOWN"),
];

const COMMAND_NAMES: &[(i32, &str)] = &[
    (command::NO_COMMAND, "NO_COMMAND"),
    (command::MESSAGE_REPLY, "MESSAGE_REPLY"),
    (command::ROUTINE_EXIT, "ROUTINE_EXIT"),
    (command::DAEMON_SHUTDOWN, "DAEMON_SHUTDOWN"),
    (robod::PROCESS_INFO, "ROBOD_PROCESS_INFO"),
    (robod::SHUTDOWN, "ROBOD_SHUTDOWN"),
    (robod::EMERGENCY_SHUTDOWN, "ROBOD_EMERGENCY_SHUTDOWN"),
    (watchdog::PROCESS_INFO, "WATCHDOG_PROCESS_INFO"),
    (watchdog::START_WATCHDOG, "START_WATCHDOG"),
    (watchdog::PAUSE_WATCHDOG, "PAUSE_WATCHDOG"),
    (watchdog::SHUTDOWN, "WATCHDOG_SHUTDOWN"),
    (watchdog::EMERGENCY_SHUTDOWN, "WATCHDOG_EMERGENCY_SHUTDOWN"),
];

fn lookup(table: &[(i32, &'static str)], code: i32) -> Option<&'static str> {
    table.iter().find(|(c, _)| *c == code).map(|(_, n)| *n)
}

pub fn error_name(code: i32) -> String {
    lookup(ERROR_NAMES, code)
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string())
}

pub fn command_name(code: i32) -> String {
    lookup(COMMAND_NAMES, code)
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string())
}
