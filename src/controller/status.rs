//! Controller status bitmask and its subscriber bus.
//!
//! The Archon firmware does not expose a composite exposure state; the daemon
//! reconstructs one client-side as a bitmask. Two groups of bits are mutually
//! exclusive: the activity group (`IDLE`, `EXPOSING`, `READING`, `FETCHING`)
//! and the power group (`POWERON`, `POWEROFF`, `POWERBAD`). Setting any bit
//! in a group clears the rest of that group. `READOUT_PENDING` may coexist
//! with `EXPOSING`: it records that an automatic readout follows the
//! integration.
//!
//! Subscribers get snapshots through a `tokio::sync::watch` channel, which
//! keeps only the latest value per receiver: a slow consumer never stalls
//! the producer, and identical re-sets are elided.

use bitflags::bitflags;
use tokio::sync::watch;

bitflags! {
    /// Client-side status of an Archon controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerStatus: u16 {
        /// No information yet (pre-connect, or after connection loss).
        const UNKNOWN = 0x001;
        /// Ready for a new operation.
        const IDLE = 0x002;
        /// Integration in progress.
        const EXPOSING = 0x004;
        /// An automatic readout should follow the current integration.
        const READOUT_PENDING = 0x008;
        /// The hardware is clocking the CCD into a frame buffer.
        const READING = 0x010;
        /// A complete buffer is waiting to be fetched.
        const FETCH_PENDING = 0x020;
        /// A buffer is being transferred to the host.
        const FETCHING = 0x040;
        /// The detector is being flushed.
        const FLUSHING = 0x080;
        /// A command on the exposure path failed; reset required.
        const ERROR = 0x100;
        /// CCD bias power is on.
        const POWERON = 0x200;
        /// CCD bias power is off.
        const POWEROFF = 0x400;
        /// Power readback is out of spec.
        const POWERBAD = 0x800;

        /// Activity bits: mutually exclusive.
        const ACTIVITY = Self::IDLE.bits()
            | Self::EXPOSING.bits()
            | Self::READING.bits()
            | Self::FETCHING.bits();
        /// Power bits: mutually exclusive.
        const POWER = Self::POWERON.bits()
            | Self::POWEROFF.bits()
            | Self::POWERBAD.bits();
    }
}

impl ControllerStatus {
    /// Applies a delta to the bitmask, honouring the exclusion groups.
    ///
    /// With `on = true` each group touched by `bits` is cleared before the
    /// new bit is set; any non-UNKNOWN update also clears `UNKNOWN`. With
    /// `on = false` the bits are simply removed.
    pub fn apply(self, bits: ControllerStatus, on: bool) -> ControllerStatus {
        let mut next = self;
        if on {
            if bits.intersects(Self::ACTIVITY) {
                next &= !Self::ACTIVITY;
            }
            if bits.intersects(Self::POWER) {
                next &= !Self::POWER;
            }
            next |= bits;
            if bits != Self::UNKNOWN {
                next &= !Self::UNKNOWN;
            }
        } else {
            next &= !bits;
        }
        next
    }

    /// Names of the set bits, for the `status_names` reply key.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for (name, flag) in [
            ("UNKNOWN", Self::UNKNOWN),
            ("IDLE", Self::IDLE),
            ("EXPOSING", Self::EXPOSING),
            ("READOUT_PENDING", Self::READOUT_PENDING),
            ("READING", Self::READING),
            ("FETCH_PENDING", Self::FETCH_PENDING),
            ("FETCHING", Self::FETCHING),
            ("FLUSHING", Self::FLUSHING),
            ("ERROR", Self::ERROR),
            ("POWERON", Self::POWERON),
            ("POWEROFF", Self::POWEROFF),
            ("POWERBAD", Self::POWERBAD),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        names
    }
}

impl Default for ControllerStatus {
    fn default() -> Self {
        ControllerStatus::UNKNOWN
    }
}

/// Publishes status changes to any number of subscribers.
///
/// The bus is the single source of truth for a controller's status. Updates
/// that do not change the value are not published.
#[derive(Debug)]
pub struct StatusBus {
    tx: watch::Sender<ControllerStatus>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ControllerStatus::UNKNOWN);
        Self { tx }
    }

    /// Current status snapshot.
    pub fn get(&self) -> ControllerStatus {
        *self.tx.borrow()
    }

    /// Applies a delta with the exclusion rules; publishes only on change.
    pub fn update(&self, bits: ControllerStatus, on: bool) -> ControllerStatus {
        let mut next = self.get();
        next = next.apply(bits, on);
        self.set(next);
        next
    }

    /// Clears `off` and sets `on` as a single published transition, so
    /// subscribers never observe the intermediate value.
    pub fn transition(&self, off: ControllerStatus, on: ControllerStatus) -> ControllerStatus {
        let next = self.get().apply(off, false).apply(on, true);
        self.set(next);
        next
    }

    /// Replaces the whole bitmask; publishes only on change.
    pub fn set(&self, status: ControllerStatus) {
        self.tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Subscribes to status changes. The receiver starts with the current
    /// value marked as seen-able; consumers read it with `borrow` before
    /// awaiting `changed`.
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.tx.subscribe()
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}
