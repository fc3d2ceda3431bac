//! `archond` drives STA Archon CCD controllers for astronomical
//! spectrographs.
//!
//! The daemon speaks the Archon's line-oriented TCP protocol, reconstructs
//! the exposure state machine the firmware does not expose, orchestrates
//! synchronised exposures across a controller fleet, and persists FITS
//! files with lockfile-based crash recovery.
//!
//! # Layout
//!
//! - [`controller`]: wire codec, the correlated TCP client, the ACF
//!   configuration model, and the per-controller exposure engine.
//! - [`exposure`]: the multi-controller orchestrator, exposure numbering,
//!   header assembly, and recovery.
//! - [`core`]: the injected ports (reply sink, frame writer, sensors,
//!   clock, counter store) the machinery is written against.
//! - [`storage`]: the default FITS writer and the checksum sidecar.
//! - [`daemon`] / [`messages`]: the actor owning the fleet and its command
//!   surface; the bus transport itself lives outside this crate.

pub mod config;
pub mod controller;
pub mod core;
pub mod daemon;
pub mod error;
pub mod exposure;
pub mod messages;
pub mod storage;

pub use crate::config::Settings;
pub use crate::controller::{ArchonController, ControllerStatus};
pub use crate::daemon::ArchonDaemon;
pub use crate::error::{ArchonError, ArchonResult};
pub use crate::exposure::{ExposeParams, ExposureDelegate};
pub use crate::messages::DaemonCommand;
