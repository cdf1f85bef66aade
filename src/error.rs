//! Fabric error taxonomy

use thiserror::Error;

/// Coarse classes that decide how a failure propagates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Kills the session; the client reconnects.
    Transport,
    /// Kills the session; the client reconnects.
    Timeout,
    /// Logged, payload dropped, session continues.
    Protocol,
    /// Returned to the caller, who may retry.
    Admission,
    /// Fatal at startup, error state at runtime.
    Supervisory,
    /// Opaque daemon error code, passed through unchanged.
    Domain,
}

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("i/o error during {op}: {source}")]
    Io {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{op} timed out after {ms} ms")]
    Timeout { op: &'static str, ms: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server busy with command {0}")]
    Busy(u32),

    #[error("supervisor error: {0}")]
    Supervisory(String),

    #[error("daemon reported error code {0}")]
    Domain(i32),

    #[error("session closed")]
    Closed,
}

impl FabricError {
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        FabricError::Io { op, source }
    }

    pub fn kind(&self) -> ErrorClass {
        match self {
            FabricError::Framing(_) | FabricError::Io { .. } | FabricError::Closed => {
                ErrorClass::Transport
            }
            FabricError::Timeout { .. } => ErrorClass::Timeout,
            FabricError::Protocol(_) => ErrorClass::Protocol,
            FabricError::Busy(_) => ErrorClass::Admission,
            FabricError::Supervisory(_) => ErrorClass::Supervisory,
            FabricError::Domain(_) => ErrorClass::Domain,
        }
    }

    /// True when the failure should take the session down with it.
    pub fn kills_session(&self) -> bool {
        matches!(self.kind(), ErrorClass::Transport | ErrorClass::Timeout)
    }
}

pub type FabricResult<T> = std::result::Result<T, FabricError>;
