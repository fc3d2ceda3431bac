//! Command types for the daemon actor.
//!
//! Operators reach the daemon through a message bus whose transport lives
//! outside this crate; what arrives here is a [`DaemonCommand`] with a
//! `oneshot` response channel. The helper constructors build the matching
//! `(command, receiver)` pairs so callers never wire channels by hand.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::controller::ApplyCommand;
use crate::error::ArchonResult;
use crate::exposure::ExposeParams;

/// Status summary of one controller, as published on the `status` key.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub controller: String,
    pub status: u16,
    pub status_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_exposure_no: Option<u64>,
}

/// Commands accepted by the daemon actor.
#[derive(Debug)]
pub enum DaemonCommand {
    /// Run an exposure across the fleet (or a subset).
    Expose {
        params: ExposeParams,
        response: oneshot::Sender<ArchonResult<Option<Vec<PathBuf>>>>,
    },

    /// Read out, fetch, and persist an integrated exposure.
    Readout {
        extra_header: serde_json::Map<String, Value>,
        response: oneshot::Sender<ArchonResult<Vec<PathBuf>>>,
    },

    /// Abort the in-flight exposure.
    Abort {
        response: oneshot::Sender<ArchonResult<()>>,
    },

    /// Flush the detectors.
    Flush {
        count: u32,
        controllers: Option<Vec<String>>,
        response: oneshot::Sender<ArchonResult<()>>,
    },

    /// Status bitmask report for one or all controllers.
    GetStatus {
        controller: Option<String>,
        response: oneshot::Sender<ArchonResult<Vec<StatusReport>>>,
    },

    /// `SYSTEM` keyword report.
    GetSystem {
        controller: String,
        response: oneshot::Sender<ArchonResult<Value>>,
    },

    /// `FRAME` buffer report.
    GetFrame {
        controller: String,
        response: oneshot::Sender<ArchonResult<Value>>,
    },

    /// Upload a configuration file.
    WriteConfig {
        controller: String,
        text: String,
        overrides: Vec<(String, String)>,
        apply: Vec<ApplyCommand>,
        response: oneshot::Sender<ArchonResult<()>>,
    },

    /// Read the configuration back from the controller.
    ReadConfig {
        controller: String,
        response: oneshot::Sender<ArchonResult<String>>,
    },

    /// Raw command pass-through.
    Talk {
        controller: String,
        text: String,
        response: oneshot::Sender<ArchonResult<String>>,
    },

    /// CCD bias power on/off.
    Power {
        controller: Option<String>,
        on: bool,
        response: oneshot::Sender<ArchonResult<()>>,
    },

    /// Drop and re-dial one controller.
    Reconnect {
        controller: String,
        response: oneshot::Sender<ArchonResult<()>>,
    },

    /// Replay any lockfiles into finished files.
    Recover {
        response: oneshot::Sender<ArchonResult<Vec<PathBuf>>>,
    },

    /// Abort everything and return the fleet to IDLE.
    Reset {
        response: oneshot::Sender<ArchonResult<()>>,
    },

    /// Stop the daemon actor.
    Shutdown { response: oneshot::Sender<()> },
}

impl DaemonCommand {
    pub fn expose(
        params: ExposeParams,
    ) -> (Self, oneshot::Receiver<ArchonResult<Option<Vec<PathBuf>>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Expose { params, response: tx }, rx)
    }

    pub fn readout(
        extra_header: serde_json::Map<String, Value>,
    ) -> (Self, oneshot::Receiver<ArchonResult<Vec<PathBuf>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Readout {
                extra_header,
                response: tx,
            },
            rx,
        )
    }

    pub fn abort() -> (Self, oneshot::Receiver<ArchonResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Abort { response: tx }, rx)
    }

    pub fn flush(
        count: u32,
        controllers: Option<Vec<String>>,
    ) -> (Self, oneshot::Receiver<ArchonResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Flush {
                count,
                controllers,
                response: tx,
            },
            rx,
        )
    }

    pub fn get_status(
        controller: Option<String>,
    ) -> (Self, oneshot::Receiver<ArchonResult<Vec<StatusReport>>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::GetStatus {
                controller,
                response: tx,
            },
            rx,
        )
    }

    pub fn get_system(controller: String) -> (Self, oneshot::Receiver<ArchonResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::GetSystem {
                controller,
                response: tx,
            },
            rx,
        )
    }

    pub fn get_frame(controller: String) -> (Self, oneshot::Receiver<ArchonResult<Value>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::GetFrame {
                controller,
                response: tx,
            },
            rx,
        )
    }

    pub fn write_config(
        controller: String,
        text: String,
        overrides: Vec<(String, String)>,
        apply: Vec<ApplyCommand>,
    ) -> (Self, oneshot::Receiver<ArchonResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::WriteConfig {
                controller,
                text,
                overrides,
                apply,
                response: tx,
            },
            rx,
        )
    }

    pub fn read_config(controller: String) -> (Self, oneshot::Receiver<ArchonResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::ReadConfig {
                controller,
                response: tx,
            },
            rx,
        )
    }

    pub fn talk(
        controller: String,
        text: String,
    ) -> (Self, oneshot::Receiver<ArchonResult<String>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Talk {
                controller,
                text,
                response: tx,
            },
            rx,
        )
    }

    pub fn power(
        controller: Option<String>,
        on: bool,
    ) -> (Self, oneshot::Receiver<ArchonResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Power {
                controller,
                on,
                response: tx,
            },
            rx,
        )
    }

    pub fn reconnect(controller: String) -> (Self, oneshot::Receiver<ArchonResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Reconnect {
                controller,
                response: tx,
            },
            rx,
        )
    }

    pub fn recover() -> (Self, oneshot::Receiver<ArchonResult<Vec<PathBuf>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Recover { response: tx }, rx)
    }

    pub fn reset() -> (Self, oneshot::Receiver<ArchonResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Reset { response: tx }, rx)
    }

    pub fn shutdown() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}
