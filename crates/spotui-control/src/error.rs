use std::time::Duration;

use thiserror::Error;

use crate::installer::InstallState;

/// Error taxonomy for the control plane.
///
/// Verification and repair outcomes are *not* errors — they come back as
/// typed results the caller branches on.  `ControlError` covers the cases
/// where an operation cannot produce a result at all.
#[derive(Debug, Error)]
pub enum ControlError {
    /// The only fatal startup condition: no release archive exists for this
    /// host, so install can never succeed.
    #[error("no spotifyd release available for {os}-{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("download failed: {0}")]
    Download(String),

    #[error("archive extraction failed: {0}")]
    Extract(String),

    #[error("install already in progress (lock held by pid {pid})")]
    InstallLockHeld { pid: u32 },

    #[error("binary state {0:?} is not repairable")]
    Unrepairable(InstallState),

    /// Operator-supplied binary failed verification.  Never modified or
    /// replaced; the operator has to fix or unset the override.
    #[error("operator-supplied binary is unusable ({0:?}); refusing to modify it")]
    CustomBinaryUnusable(InstallState),

    #[error("process spawn failed: {0}")]
    ProcessSpawn(String),

    #[error("spotifyd exited immediately after starting")]
    ProcessExited,

    #[error("spotifyd did not register on the session bus in time")]
    RegistrationTimeout,

    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    #[error("D-Bus FDO error: {0}")]
    Fdo(#[from] zbus::fdo::Error),

    #[error("no spotifyd player found on the session bus")]
    PlayerNotFound,

    #[error("not connected to the control protocol")]
    NotConnected,

    #[error("command rejected by player: {0}")]
    CommandRejected(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// True when retrying cannot help and startup should stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::UnsupportedPlatform { .. })
    }
}
