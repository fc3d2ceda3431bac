//! Archon controller protocol and state machine.
//!
//! Layering, bottom up: [`codec`] frames and classifies wire traffic,
//! [`client`] owns the socket and the request/reply correlator, [`acf`] /
//! [`geometry`] / [`frame`] model the controller's configuration and frame
//! buffers, [`status`] holds the reconstructed status bitmask, and
//! [`device`] drives the exposure state machine on top of it all.

pub mod acf;
pub mod client;
pub mod codec;
pub mod command;
pub mod device;
pub mod frame;
pub mod geometry;
pub mod status;

pub use acf::AcfDocument;
pub use client::{ArchonClient, FetchStream, SendOptions};
pub use codec::{CommandId, MAX_COMMAND_ID};
pub use command::{CommandStatus, Reply, ReplyFuture};
pub use device::{
    centiseconds, ApplyCommand, ArchonController, ArchonPower, ExposeOutcome, ExposureHandle,
    FetchedFrame, ModType,
};
pub use frame::{BufferInfo, FrameData, FrameInfo};
pub use geometry::FrameGeometry;
pub use status::{ControllerStatus, StatusBus};
