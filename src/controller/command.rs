//! Command bookkeeping for the controller client.
//!
//! A command in flight is represented twice, linked by its wire id: the
//! [`PendingCommand`] record owned by the client (literal text, reply lines,
//! terminal status), and the [`ReplyFuture`] handle held by the caller, which
//! resolves when the command reaches a terminal state.

use tokio::sync::oneshot;

use super::codec::CommandId;
use crate::error::{ArchonError, ArchonResult};

/// Terminal (and initial) states of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Sent, no terminal state yet.
    Running,
    /// The controller acknowledged the command.
    Done,
    /// The controller replied with a NAK.
    Failed,
    /// The deadline expired before a reply arrived.
    TimedOut,
    /// The connection dropped while the command was in flight.
    Disconnected,
}

/// The resolved outcome of a command.
#[derive(Debug, Clone)]
pub struct Reply {
    pub id: CommandId,
    pub command: String,
    pub status: CommandStatus,
    /// Text reply lines, in arrival order. Empty for binary replies, whose
    /// payload is streamed separately.
    pub lines: Vec<String>,
}

impl Reply {
    /// The first reply line, or the empty string.
    pub fn line(&self) -> &str {
        self.lines.first().map(String::as_str).unwrap_or("")
    }

    pub fn succeeded(&self) -> bool {
        self.status == CommandStatus::Done
    }

    /// Converts a non-`Done` outcome into the matching error.
    pub fn into_result(self) -> ArchonResult<Reply> {
        match self.status {
            CommandStatus::Done => Ok(self),
            CommandStatus::Failed => Err(ArchonError::CommandFailed {
                command: self.command,
            }),
            CommandStatus::TimedOut => Err(ArchonError::Timeout {
                command: self.command,
            }),
            CommandStatus::Disconnected => Err(ArchonError::Disconnected),
            CommandStatus::Running => Err(ArchonError::Protocol(format!(
                "command {:?} resolved while still running",
                self.command
            ))),
        }
    }
}

/// Client-side record of a command whose reply has not completed.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub id: CommandId,
    pub text: String,
    pub lines: Vec<String>,
    /// Resolves the caller's [`ReplyFuture`]. Taken on completion; a timed
    /// out command keeps its entry (poisoned) with `tx` already consumed.
    pub tx: Option<oneshot::Sender<Reply>>,
    /// Set when the deadline fired. The next inbound reply for this id is
    /// dropped and the id returned to the pool.
    pub poisoned: bool,
    /// The command expects a binary bulk reply (`FETCH`).
    pub binary: bool,
}

impl PendingCommand {
    pub fn new(id: CommandId, text: String, tx: oneshot::Sender<Reply>, binary: bool) -> Self {
        Self {
            id,
            text,
            lines: Vec::new(),
            tx: Some(tx),
            poisoned: false,
            binary,
        }
    }

    /// Moves the command to a terminal state, resolving the caller's future.
    pub fn resolve(&mut self, status: CommandStatus) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Reply {
                id: self.id,
                command: self.text.clone(),
                status,
                lines: std::mem::take(&mut self.lines),
            });
        }
    }
}

/// Caller-side handle for an issued command.
#[derive(Debug)]
pub struct ReplyFuture {
    pub(crate) id: CommandId,
    pub(crate) command: String,
    pub(crate) rx: oneshot::Receiver<Reply>,
}

impl ReplyFuture {
    pub fn id(&self) -> CommandId {
        self.id
    }

    /// Waits for the terminal outcome, whatever it is.
    pub async fn outcome(self) -> Reply {
        match self.rx.await {
            Ok(reply) => reply,
            // Client dropped without resolving: the connection is gone.
            Err(_) => Reply {
                id: self.id,
                command: self.command,
                status: CommandStatus::Disconnected,
                lines: Vec::new(),
            },
        }
    }

    /// Waits for the outcome and errors unless the command succeeded.
    pub async fn wait(self) -> ArchonResult<Reply> {
        self.outcome().await.into_result()
    }
}
