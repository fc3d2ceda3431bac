//! Archon wire codec.
//!
//! The Archon speaks a line-oriented ASCII protocol over TCP. A command is
//! framed as `>IISSSS\n` where `II` is a two-digit uppercase hex command id
//! and `SSSS` the command text. Replies echo the id: `<II<payload>\n` on
//! success, `?II\n` on failure. A binary reply (used by `FETCH`) is framed as
//! `<II:` followed by exactly 1024 payload bytes and no trailing newline; a
//! bulk transfer is a run of such chunks.
//!
//! The codec is pure: framing, classification, and command-id allocation.
//! Socket handling lives in [`super::client`].

use std::collections::HashSet;
use std::fmt;

use crate::error::{ArchonError, ArchonResult};

/// Highest usable command id. Id 0x00 is never issued.
pub const MAX_COMMAND_ID: u8 = 0xFF;

/// Payload bytes carried by one binary reply chunk.
pub const BINARY_CHUNK: usize = 1024;

/// Bytes on the wire for one binary reply chunk (`<II:` prefix included).
pub const BINARY_CHUNK_WIRE: usize = BINARY_CHUNK + 4;

/// A two-hex-digit wire command id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId(pub u8);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}", self.0)
    }
}

/// Builds the framed command line for `(id, text)`, newline included.
///
/// The Archon is case-sensitive and expects uppercase command names; callers
/// are responsible for casing the text.
pub fn frame_command(id: CommandId, text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 4);
    out.extend_from_slice(format!(">{id}{text}\n").as_bytes());
    out
}

/// A classified inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// `<II<payload>\n`: a text acknowledgement.
    AckText { id: CommandId, line: String },
    /// `<II:` plus 1024 bytes: one chunk of a binary reply.
    AckBinary { id: CommandId, payload: Vec<u8> },
    /// `?II\n`: the controller rejected the command.
    Nak { id: CommandId },
}

impl InboundFrame {
    pub fn id(&self) -> CommandId {
        match self {
            InboundFrame::AckText { id, .. } => *id,
            InboundFrame::AckBinary { id, .. } => *id,
            InboundFrame::Nak { id } => *id,
        }
    }
}

fn parse_id(raw: &[u8]) -> ArchonResult<CommandId> {
    let hex = std::str::from_utf8(&raw[1..3])
        .map_err(|_| ArchonError::Protocol(format!("non-ASCII command id in {raw:?}")))?;
    let id = u8::from_str_radix(hex, 16)
        .map_err(|_| ArchonError::Protocol(format!("bad command id {hex:?}")))?;
    Ok(CommandId(id))
}

/// Classifies a complete inbound frame.
///
/// `raw` must be one whole frame: either a text line (trailing newline
/// optional) or a `<II:` binary chunk with its full 1024-byte payload.
pub fn classify(raw: &[u8]) -> ArchonResult<InboundFrame> {
    if raw.len() < 3 {
        return Err(ArchonError::Protocol(format!("short frame {raw:?}")));
    }

    match raw[0] {
        b'?' => Ok(InboundFrame::Nak { id: parse_id(raw)? }),
        b'<' => {
            let id = parse_id(raw)?;
            if raw.len() > 3 && raw[3] == b':' {
                let payload = &raw[4..];
                if payload.len() != BINARY_CHUNK {
                    return Err(ArchonError::Protocol(format!(
                        "binary chunk for {id} has {} bytes, expected {BINARY_CHUNK}",
                        payload.len()
                    )));
                }
                Ok(InboundFrame::AckBinary {
                    id,
                    payload: payload.to_vec(),
                })
            } else {
                let text = &raw[3..];
                let text = text.strip_suffix(b"\n").unwrap_or(text);
                let text = text.strip_suffix(b"\r").unwrap_or(text);
                let line = String::from_utf8(text.to_vec()).map_err(|_| {
                    ArchonError::Protocol(format!("non-UTF8 reply for command {id}"))
                })?;
                Ok(InboundFrame::AckText { id, line })
            }
        }
        other => Err(ArchonError::Protocol(format!(
            "unknown frame marker {:?}",
            other as char
        ))),
    }
}

/// Circular allocator for wire command ids.
///
/// Ids cycle through 0x01..=0xFF, skipping 0x00 and any id currently in
/// flight. A timed-out command keeps its id checked out ("poisoned") until a
/// late reply for it is finally consumed, so a new command can never be
/// misattributed an old reply.
#[derive(Debug, Default)]
pub struct IdPool {
    next: u8,
    in_flight: HashSet<u8>,
}

impl IdPool {
    pub fn new() -> Self {
        Self {
            next: 0,
            in_flight: HashSet::new(),
        }
    }

    /// Takes the next free id, cycling and skipping 0x00.
    pub fn acquire(&mut self) -> ArchonResult<CommandId> {
        for _ in 0..=MAX_COMMAND_ID {
            self.next = self.next.wrapping_add(1);
            if self.next == 0 {
                self.next = 1;
            }
            if self.in_flight.insert(self.next) {
                return Ok(CommandId(self.next));
            }
        }
        Err(ArchonError::Protocol(
            "no free command ids: 255 commands in flight".to_string(),
        ))
    }

    /// Checks out a specific id, for commands that will be retried under the
    /// same id.
    pub fn reserve(&mut self, id: CommandId) -> ArchonResult<()> {
        if id.0 == 0 {
            return Err(ArchonError::Protocol("command id 0x00 is reserved".into()));
        }
        if !self.in_flight.insert(id.0) {
            return Err(ArchonError::Protocol(format!("command id {id} is in flight")));
        }
        Ok(())
    }

    /// Returns an id to the pool.
    pub fn release(&mut self, id: CommandId) {
        self.in_flight.remove(&id.0);
    }

    /// Forgets every checkout. Used on connection loss.
    pub fn clear(&mut self) {
        self.in_flight.clear();
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
