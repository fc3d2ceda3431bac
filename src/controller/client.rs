//! TCP client for a single Archon controller.
//!
//! One persistent connection per controller. A single reader task pulls
//! frames off the socket and attributes replies to pending commands by wire
//! id; a single writer task serialises outbound bytes so two callers can
//! never interleave. Timeouts resolve the caller's future and leave the id
//! poisoned until the late reply finally arrives, so a recycled id can never
//! be handed someone else's answer.
//!
//! Binary bulk replies (`FETCH`) are not buffered whole: the reader forwards
//! each 1024-byte chunk into an [`FetchStream`] channel and restores normal
//! correlation once the declared block count has passed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::codec::{classify, frame_command, CommandId, IdPool, InboundFrame, BINARY_CHUNK};
use super::command::{CommandStatus, PendingCommand, Reply, ReplyFuture};
use super::status::{ControllerStatus, StatusBus};
use crate::error::{ArchonError, ArchonResult};

/// Outbound write queue depth. Writes are small command lines; the queue
/// exists only to decouple callers from socket backpressure.
const WRITE_QUEUE: usize = 64;

/// In-flight chunk capacity of a fetch stream.
const FETCH_QUEUE: usize = 64;

/// Options for [`ArchonClient::send`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Deadline for the reply. `None` disables the timeout.
    pub timeout: Option<Duration>,
    /// Reject the send if a command with the same literal text is in flight.
    pub unique: bool,
    /// Use a pre-reserved id instead of allocating one (for retries).
    pub command_id: Option<CommandId>,
}

impl SendOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Receives the payload of a binary bulk reply chunk by chunk.
///
/// The channel ends when the declared block count has been transferred, the
/// command fails, or the connection drops; `reply` then carries the terminal
/// command status.
pub struct FetchStream {
    pub chunks: mpsc::Receiver<Vec<u8>>,
    pub reply: ReplyFuture,
}

/// An active binary transfer. At most one may be in progress per connection;
/// the controller serialises FETCH replies itself.
struct BulkTransfer {
    id: CommandId,
    remaining: usize,
    tx: mpsc::Sender<Vec<u8>>,
}

/// Correlation table shared between callers and the reader task.
#[derive(Default)]
struct PendingTable {
    commands: HashMap<u8, PendingCommand>,
    ids: IdPool,
    bulk: Option<BulkTransfer>,
}

struct Shared {
    name: String,
    pending: StdMutex<PendingTable>,
    status: StatusBus,
    connected: AtomicBool,
}

impl Shared {
    /// Resolves every outstanding command as disconnected and clears the id
    /// pool. Status drops to `UNKNOWN | ERROR`.
    fn fail_all(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut table = self.pending.lock().expect("pending table poisoned");
        for (_, mut cmd) in table.commands.drain() {
            cmd.resolve(CommandStatus::Disconnected);
        }
        table.ids.clear();
        table.bulk = None;
        drop(table);
        self.status
            .set(ControllerStatus::UNKNOWN | ControllerStatus::ERROR);
        warn!(controller = %self.name, "connection lost, all in-flight commands failed");
    }

    fn on_timeout(&self, id: CommandId) {
        let mut table = self.pending.lock().expect("pending table poisoned");
        if let Some(cmd) = table.commands.get_mut(&id.0) {
            if cmd.tx.is_some() {
                debug!(controller = %self.name, command = %cmd.text, %id, "command timed out");
                cmd.resolve(CommandStatus::TimedOut);
                cmd.poisoned = true;
            }
        }
        // A timed-out fetch also ends its chunk stream.
        if table.bulk.as_ref().map(|bulk| bulk.id) == Some(id) {
            table.bulk = None;
        }
    }

    /// Routes one classified frame to its pending command.
    async fn dispatch(&self, frame: InboundFrame) {
        // Binary chunks are forwarded outside the table lock.
        if let InboundFrame::AckBinary { id, payload } = frame {
            let (chunk_tx, finished) = {
                let mut table = self.pending.lock().expect("pending table poisoned");
                match table.bulk.as_mut() {
                    Some(bulk) if bulk.id == id => {
                        bulk.remaining = bulk.remaining.saturating_sub(1);
                        (Some(bulk.tx.clone()), bulk.remaining == 0)
                    }
                    _ => {
                        warn!(controller = %self.name, %id, "binary chunk with no active fetch");
                        (None, false)
                    }
                }
            };
            if let Some(tx) = chunk_tx {
                // Receiver gone means the caller gave up; drain silently.
                let _ = tx.send(payload).await;
            }
            if finished {
                let mut table = self.pending.lock().expect("pending table poisoned");
                table.bulk = None;
                if let Some(mut cmd) = table.commands.remove(&id.0) {
                    cmd.resolve(CommandStatus::Done);
                    table.ids.release(id);
                }
            }
            return;
        }

        let id = frame.id();
        let mut table = self.pending.lock().expect("pending table poisoned");
        let Some(cmd) = table.commands.get_mut(&id.0) else {
            warn!(controller = %self.name, %id, "reply for unknown command id, dropped");
            return;
        };

        if cmd.poisoned {
            debug!(controller = %self.name, %id, "late reply for timed-out command, id reclaimed");
            table.commands.remove(&id.0);
            table.ids.release(id);
            return;
        }

        let binary = cmd.binary;
        match frame {
            InboundFrame::AckText { line, .. } => {
                cmd.lines.push(line);
                cmd.resolve(CommandStatus::Done);
            }
            InboundFrame::Nak { .. } => {
                cmd.resolve(CommandStatus::Failed);
            }
            InboundFrame::AckBinary { .. } => unreachable!("binary handled above"),
        }

        // A failed FETCH also tears down the bulk transfer.
        if binary && table.bulk.as_ref().map(|bulk| bulk.id) == Some(id) {
            table.bulk = None;
        }

        table.commands.remove(&id.0);
        table.ids.release(id);
    }
}

struct ConnState {
    writer_tx: mpsc::Sender<Vec<u8>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

/// Asynchronous client for one Archon controller.
pub struct ArchonClient {
    host: String,
    port: u16,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    conn: StdMutex<Option<ConnState>>,
}

impl ArchonClient {
    /// Creates a client for `host:port`. No connection is attempted until
    /// [`connect`](Self::connect).
    pub fn new(name: &str, host: &str, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
            shared: Arc::new(Shared {
                name: name.to_string(),
                pending: StdMutex::new(PendingTable::default()),
                status: StatusBus::new(),
                connected: AtomicBool::new(false),
            }),
            conn: StdMutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Opens the socket with a bounded handshake timeout and starts the
    /// reader and writer tasks.
    pub async fn connect(&self) -> ArchonResult<()> {
        if self.is_connected() {
            return Err(ArchonError::InvalidState(format!(
                "{} is already connected",
                self.shared.name
            )));
        }

        let addr = format!("{}:{}", self.host, self.port);
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                ArchonError::ConnectFailed(format!("timed out connecting to {addr}"))
            })?
            .map_err(|err| ArchonError::ConnectFailed(format!("{addr}: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| ArchonError::ConnectFailed(format!("{addr}: {err}")))?;

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE);

        self.shared.connected.store(true, Ordering::SeqCst);

        let reader_shared = Arc::clone(&self.shared);
        let reader_task = tokio::spawn(async move {
            reader_loop(read_half, reader_shared).await;
        });
        let writer_shared = Arc::clone(&self.shared);
        let writer_task = tokio::spawn(async move {
            writer_loop(write_half, writer_rx, writer_shared).await;
        });

        *self.conn.lock().expect("conn state poisoned") = Some(ConnState {
            writer_tx,
            reader_task,
            writer_task,
        });

        info!(controller = %self.shared.name, %addr, "connected");
        Ok(())
    }

    /// Tears the connection down, failing every in-flight command.
    pub async fn disconnect(&self) {
        if let Some(conn) = self.conn.lock().expect("conn state poisoned").take() {
            conn.reader_task.abort();
            conn.writer_task.abort();
        }
        self.shared.fail_all();
    }

    /// Drops the current connection (if any) and dials again.
    pub async fn reconnect(&self) -> ArchonResult<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Current status bitmask.
    pub fn status(&self) -> ControllerStatus {
        self.shared.status.get()
    }

    /// Applies a status delta; exclusion rules enforced, change fan-out
    /// coalesced per subscriber.
    pub fn update_status(&self, bits: ControllerStatus, on: bool) -> ControllerStatus {
        self.shared.status.update(bits, on)
    }

    /// Clears `off` and sets `on` in one published step.
    pub fn transition_status(&self, off: ControllerStatus, on: ControllerStatus) {
        self.shared.status.transition(off, on);
    }

    /// Replaces the status bitmask wholesale.
    pub fn set_status(&self, status: ControllerStatus) {
        self.shared.status.set(status);
    }

    /// Subscribes to status snapshots. New subscribers observe the current
    /// value first; slow subscribers only ever see the latest.
    pub fn subscribe_status(&self) -> watch::Receiver<ControllerStatus> {
        self.shared.status.subscribe()
    }

    fn writer(&self) -> ArchonResult<mpsc::Sender<Vec<u8>>> {
        self.conn
            .lock()
            .expect("conn state poisoned")
            .as_ref()
            .map(|conn| conn.writer_tx.clone())
            .ok_or(ArchonError::Disconnected)
    }

    /// Issues a command and returns a handle resolving on reply, timeout,
    /// NAK, or disconnect.
    pub async fn send(&self, text: &str, opts: SendOptions) -> ArchonResult<ReplyFuture> {
        self.send_inner(text, opts, false).await
    }

    async fn send_inner(
        &self,
        text: &str,
        opts: SendOptions,
        binary: bool,
    ) -> ArchonResult<ReplyFuture> {
        if !self.is_connected() {
            return Err(ArchonError::Disconnected);
        }
        let writer_tx = self.writer()?;

        let (tx, rx) = oneshot::channel();
        let id = {
            let mut table = self.shared.pending.lock().expect("pending table poisoned");
            if opts.unique {
                let duplicate = table
                    .commands
                    .values()
                    .any(|cmd| !cmd.poisoned && cmd.text == text);
                if duplicate {
                    return Err(ArchonError::InvalidState(format!(
                        "command {text:?} is already in flight"
                    )));
                }
            }
            // A caller-supplied id must already be checked out via
            // `reserve_id`; allocating here would race the reader.
            let id = match opts.command_id {
                Some(id) => id,
                None => table.ids.acquire()?,
            };
            table
                .commands
                .insert(id.0, PendingCommand::new(id, text.to_string(), tx, binary));
            id
        };

        debug!(controller = %self.shared.name, %id, command = text, "-> archon");
        if writer_tx.send(frame_command(id, text)).await.is_err() {
            // Writer task is gone; undo the table entry.
            let mut table = self.shared.pending.lock().expect("pending table poisoned");
            table.commands.remove(&id.0);
            table.ids.release(id);
            return Err(ArchonError::Disconnected);
        }

        if let Some(timeout) = opts.timeout {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                shared.on_timeout(id);
            });
        }

        Ok(ReplyFuture {
            id,
            command: text.to_string(),
            rx,
        })
    }

    /// Sends a batch of commands, pipelining up to `max_chunk` at a time.
    /// Stops at the first chunk containing a failure. Returns the done and
    /// failed replies; `done + failed` may be fewer than the inputs.
    pub async fn send_many(
        &self,
        texts: &[String],
        max_chunk: usize,
        timeout: Option<Duration>,
    ) -> ArchonResult<(Vec<Reply>, Vec<Reply>)> {
        let mut done = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(max_chunk.max(1)) {
            let mut futures = Vec::with_capacity(chunk.len());
            for text in chunk {
                let opts = SendOptions {
                    timeout,
                    ..Default::default()
                };
                futures.push(self.send(text, opts).await?);
            }
            let mut failed = Vec::new();
            for fut in futures {
                let reply = fut.outcome().await;
                if reply.succeeded() {
                    done.push(reply);
                } else {
                    failed.push(reply);
                }
            }
            if !failed.is_empty() {
                return Ok((done, failed));
            }
        }
        Ok((done, Vec::new()))
    }

    /// Issues a `FETCH` for `block_count` 1024-byte blocks starting at
    /// `start_address`, streaming the payload without buffering it whole.
    pub async fn stream_fetch(
        &self,
        start_address: u32,
        block_count: u32,
        timeout: Option<Duration>,
    ) -> ArchonResult<FetchStream> {
        if block_count == 0 {
            return Err(ArchonError::Fetch("zero-length fetch".to_string()));
        }

        let (chunk_tx, chunk_rx) = mpsc::channel(FETCH_QUEUE);
        let text = format!("FETCH{start_address:08X}{block_count:08X}");

        // Register the transfer, with its final id, before the command goes
        // out so the first chunk cannot race the bookkeeping.
        let id = {
            let mut table = self.shared.pending.lock().expect("pending table poisoned");
            if table.bulk.is_some() {
                return Err(ArchonError::InvalidState(
                    "a fetch is already in progress".to_string(),
                ));
            }
            let id = table.ids.acquire()?;
            table.bulk = Some(BulkTransfer {
                id,
                remaining: block_count as usize,
                tx: chunk_tx,
            });
            id
        };

        let opts = SendOptions {
            timeout,
            command_id: Some(id),
            ..Default::default()
        };
        let reply = match self.send_inner(&text, opts, true).await {
            Ok(reply) => reply,
            Err(err) => {
                let mut table = self.shared.pending.lock().expect("pending table poisoned");
                table.bulk = None;
                table.ids.release(id);
                return Err(err);
            }
        };

        Ok(FetchStream {
            chunks: chunk_rx,
            reply,
        })
    }

    /// Checks out an id ahead of time, for a command that may be retried
    /// under the same id. Pass it back via [`SendOptions::command_id`].
    pub fn reserve_id(&self) -> ArchonResult<CommandId> {
        let mut table = self.shared.pending.lock().expect("pending table poisoned");
        table.ids.acquire()
    }
}

async fn reader_loop(read_half: OwnedReadHalf, shared: Arc<Shared>) {
    let mut reader = BufReader::new(read_half);
    let mut head = [0u8; 4];

    loop {
        // Shortest complete frames (`?II\n`, `<II\n`) are four bytes; longer
        // ones declare themselves in the fourth byte.
        if reader.read_exact(&mut head).await.is_err() {
            break;
        }
        let mut frame = head.to_vec();
        if head[3] == b'\n' {
            // Complete short frame.
        } else if head[3] == b':' {
            let mut payload = vec![0u8; BINARY_CHUNK];
            if reader.read_exact(&mut payload).await.is_err() {
                break;
            }
            frame.extend_from_slice(&payload);
        } else {
            let mut rest = Vec::new();
            match reader.read_until(b'\n', &mut rest).await {
                Ok(0) | Err(_) => break,
                Ok(_) => frame.extend_from_slice(&rest),
            }
        }

        match classify(&frame) {
            Ok(inbound) => shared.dispatch(inbound).await,
            Err(err) => {
                warn!(controller = %shared.name, %err, "unparseable frame, dropped");
            }
        }
    }

    shared.fail_all();
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    shared: Arc<Shared>,
) {
    while let Some(bytes) = rx.recv().await {
        if write_half.write_all(&bytes).await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
    shared.fail_all();
}
