//! Exposure orchestration: fleet-wide expose/readout, header assembly,
//! exposure numbering, and lockfile recovery.

pub mod counter;
pub mod delegate;
pub mod header;
pub mod recovery;

pub use counter::FileCounterStore;
pub use delegate::{ExposeParams, ExposureDelegate};
pub use header::{build_header, ExposureInfo};
pub use recovery::{lock_path, ExposureRecovery, LockfilePayload};
