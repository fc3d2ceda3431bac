//! Error types for the daemon.
//!
//! This module defines the primary error type, `ArchonError`, used across the
//! crate. Library APIs return `ArchonResult<T>`; the daemon binary wraps
//! everything in `anyhow` for context chains.
//!
//! ## Error classes
//!
//! - **`Protocol`**: a malformed wire frame, a reply for an unknown command
//!   id, or a binary payload with the wrong length.
//! - **`CommandFailed`**: the controller replied with an explicit NAK.
//! - **`Timeout`**: no reply arrived within the command deadline. Fails only
//!   the originating command.
//! - **`Disconnected`**: the socket was lost. Fatal to all in-flight commands
//!   on that controller.
//! - **`InvalidState`**: a command was issued while the status bitmask forbids
//!   it. Does not modify the controller status.
//! - **`Config`**: a missing parameter, a malformed ACF document, or
//!   inconsistent readout geometry. Does not modify the controller status.
//! - **`Device`**: the controller reported bad power or failed a hardware
//!   sanity check.
//! - **`Fetch`**: buffer selection or frame decoding failed.
//! - **`Persist`**: a FITS write or rename failed. The exposure itself is not
//!   failed; the lockfile keeps the data for recovery.
//!
//! Exit codes distinguish user errors (2) from device-side errors (3), see
//! [`ArchonError::exit_code`].

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type ArchonResult<T> = std::result::Result<T, ArchonError>;

#[derive(Error, Debug)]
pub enum ArchonError {
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("command {command:?} failed: controller replied NAK")]
    CommandFailed { command: String },

    #[error("command {command:?} timed out")]
    Timeout { command: String },

    #[error("controller disconnected")]
    Disconnected,

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("persist error: {0}")]
    Persist(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings error: {0}")]
    Settings(#[from] config::ConfigError),
}

impl ArchonError {
    /// Process exit code for this error: 2 for caller mistakes, 3 for
    /// device-side failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            ArchonError::InvalidState(_)
            | ArchonError::Config(_)
            | ArchonError::Settings(_) => 2,
            _ => 3,
        }
    }

    /// True if the error indicates the controller itself is unhealthy, as
    /// opposed to a bad request.
    pub fn is_device_error(&self) -> bool {
        self.exit_code() == 3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_command_text() {
        let err = ArchonError::Timeout {
            command: "FRAME".to_string(),
        };
        assert_eq!(err.to_string(), "command \"FRAME\" timed out");
    }

    #[test]
    fn exit_codes_split_user_and_device() {
        assert_eq!(ArchonError::Config("bad ACF".into()).exit_code(), 2);
        assert_eq!(ArchonError::InvalidState("not idle".into()).exit_code(), 2);
        assert_eq!(ArchonError::Disconnected.exit_code(), 3);
        assert_eq!(
            ArchonError::CommandFailed {
                command: "POWERON".into()
            }
            .exit_code(),
            3
        );
    }
}
