//! Sequenced, line-delimited TCP command channel to one radio.
//!
//! [`CommandChannel`] owns one TCP (or TLS) connection to a radio's control
//! port. Outbound commands are written as `C<seq>|<command>\n`; the
//! sequence number and the bytes on the wire are assigned under the same
//! writer lock, so concurrent senders can never interleave or reorder
//! them. A background task reads inbound lines and publishes them as
//! [`CommandEvent`]s; replies are also routed to any caller waiting on
//! [`send_with_reply`](CommandChannel::send_with_reply).
//!
//! There is no reply timeout and no automatic reconnect. A caller that
//! wants either layers it on top using the returned sequence number and
//! the [`ChannelStatus`] events.
//!
//! # Example
//!
//! ```no_run
//! use flexlink::command::{CommandChannel, CommandOptions};
//! use flexlink::codec;
//!
//! # async fn example(radio: flexlink_core::Radio) -> flexlink_core::Result<()> {
//! let channel = CommandChannel::new(CommandOptions::default());
//! channel.connect(&radio).await?;
//! let (seq, reply) = channel.send_with_reply(&codec::cmd_info()).await?;
//! if let Ok(reply) = reply.await {
//!     println!("R{seq}: {}", reply.message);
//! }
//! channel.disconnect().await;
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use flexlink_core::error::{Error, Result};
use flexlink_core::{ChannelState, ChannelStatus, Radio};
use flexlink_transport::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT, NetStream, TrustPolicy};

use crate::codec::{self, CommandReply, InboundLine, ProtocolVersion, StatusUpdate};
use crate::endpoint::{self, CommandEndpoint};

/// Broadcast channel capacity for command and status subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for a [`CommandChannel`].
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Timeout for the TCP connect.
    pub connect_timeout: Duration,
    /// Certificate policy for relay (TLS) connections.
    pub trust: TrustPolicy,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            trust: TrustPolicy::default(),
        }
    }
}

/// An inbound line, parsed.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    /// Protocol version announced by the radio.
    Version(ProtocolVersion),
    /// Client handle assigned by the radio.
    Handle(u32),
    /// Reply to a command.
    Reply(CommandReply),
    /// Unsolicited status update.
    Status(StatusUpdate),
    /// Informational or error message.
    Message { code: u32, text: String },
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<CommandReply>>>>;

/// The write half and the sequence counter, guarded together.
struct Writer {
    half: WriteHalf<NetStream>,
    next_seq: u64,
}

struct Session {
    id: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    host: String,
    port: u16,
}

/// State shared with the read loop.
#[derive(Clone)]
struct Shared {
    writer: Arc<Mutex<Option<Writer>>>,
    pending: PendingMap,
    session: Arc<Mutex<Option<Session>>>,
    connected: Arc<AtomicBool>,
    handle_tx: Arc<watch::Sender<Option<u32>>>,
    version: Arc<Mutex<Option<ProtocolVersion>>>,
    event_tx: broadcast::Sender<CommandEvent>,
    status_tx: broadcast::Sender<ChannelStatus>,
}

/// Command channel to one radio.
pub struct CommandChannel {
    options: CommandOptions,
    shared: Shared,
    next_session: AtomicU64,
}

impl CommandChannel {
    pub fn new(options: CommandOptions) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (handle_tx, _) = watch::channel(None);

        Self {
            options,
            shared: Shared {
                writer: Arc::new(Mutex::new(None)),
                pending: Arc::new(Mutex::new(HashMap::new())),
                session: Arc::new(Mutex::new(None)),
                connected: Arc::new(AtomicBool::new(false)),
                handle_tx: Arc::new(handle_tx),
                version: Arc::new(Mutex::new(None)),
                event_tx,
                status_tx,
            },
            next_session: AtomicU64::new(1),
        }
    }

    /// Connect to `radio`'s control port.
    ///
    /// The target is chosen by [`endpoint::command_endpoint`]. Policy
    /// problems (such as a hole punch without a local interface) are
    /// rejected before any socket is opened and emit no status.
    pub async fn connect(&self, radio: &Radio) -> Result<()> {
        let target = endpoint::command_endpoint(radio)?;
        self.connect_endpoint(&target).await
    }

    /// Connect to an explicit endpoint.
    ///
    /// Emits `Connecting`, `Connected` and (for TLS) `Secured`. On failure a
    /// `Disconnected` status carrying the error is emitted and the error is
    /// returned. On success the sequence number restarts at 0.
    pub async fn connect_endpoint(&self, target: &CommandEndpoint) -> Result<()> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut session = self.shared.session.lock().await;
            if session.is_some() {
                return Err(Error::InvalidParameter(
                    "command channel is already connected".into(),
                ));
            }
            *session = Some(Session {
                id,
                cancel: cancel.clone(),
                task: None,
                host: target.host.clone(),
                port: target.port,
            });
        }

        self.shared.emit(ChannelStatus::new(
            ChannelState::Connecting,
            &target.host,
            target.port,
        ));

        let opened = tokio::select! {
            result = self.open(target) => result,
            _ = cancel.cancelled() => return Err(Error::NotConnected),
        };

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                let mut session = self.shared.session.lock().await;
                if !cancel.is_cancelled() {
                    *session = None;
                    drop(session);
                    self.shared.emit(ChannelStatus::disconnected(
                        &target.host,
                        target.port,
                        Some(e.to_string()),
                    ));
                }
                return Err(e);
            }
        };

        let (read_half, write_half) = tokio::io::split(stream);

        let mut session = self.shared.session.lock().await;
        let Some(current) = session.as_mut().filter(|s| s.id == id && !cancel.is_cancelled())
        else {
            return Err(Error::NotConnected);
        };

        *self.shared.writer.lock().await = Some(Writer {
            half: write_half,
            next_seq: 0,
        });
        *self.shared.version.lock().await = None;
        self.shared.handle_tx.send_replace(None);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let reader = BufReader::new(read_half);
        let host = target.host.clone();
        let port = target.port;
        current.task = Some(tokio::spawn(async move {
            read_loop(reader, shared, id, cancel, host, port).await;
        }));

        tracing::info!(host = %target.host, port = target.port, tls = target.tls, "Command channel open");
        Ok(())
    }

    async fn open(&self, target: &CommandEndpoint) -> Result<NetStream> {
        let connect = ConnectOptions {
            timeout: self.options.connect_timeout,
            local_addr: target.local_bind,
        };
        let stream = NetStream::connect(&target.host, target.port, &connect).await?;
        self.shared.emit(ChannelStatus::new(
            ChannelState::Connected,
            &target.host,
            target.port,
        ));

        if !target.tls {
            return Ok(stream);
        }

        let stream = stream.into_tls(&target.host, &self.options.trust).await?;
        self.shared.emit(ChannelStatus::new(
            ChannelState::Secured,
            &target.host,
            target.port,
        ));
        Ok(stream)
    }

    /// Send a command and return its sequence number.
    ///
    /// With `diagnostic` set the line is prefixed `CD` instead of `C`.
    pub async fn send(&self, command: &str, diagnostic: bool) -> Result<u64> {
        self.write_command(command, diagnostic, None).await
    }

    /// Send a command and get a receiver for its reply.
    ///
    /// The receiver resolves when the matching `R` line arrives, or fails
    /// if the channel closes first. No timeout is applied.
    pub async fn send_with_reply(
        &self,
        command: &str,
    ) -> Result<(u64, oneshot::Receiver<CommandReply>)> {
        let (tx, rx) = oneshot::channel();
        let seq = self.write_command(command, false, Some(tx)).await?;
        Ok((seq, rx))
    }

    async fn write_command(
        &self,
        command: &str,
        diagnostic: bool,
        reply: Option<oneshot::Sender<CommandReply>>,
    ) -> Result<u64> {
        if command.contains(['\n', '\r']) {
            return Err(Error::InvalidParameter(format!(
                "command contains a line break: {command:?}"
            )));
        }

        let mut guard = self.shared.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;

        let seq = writer.next_seq;
        if let Some(tx) = reply {
            self.shared.pending.lock().await.insert(seq, tx);
        }

        let encoded = codec::encode_command(seq, command, diagnostic);
        tracing::trace!(seq = seq, command = %command, "Sending command");

        let written = async {
            writer.half.write_all(&encoded).await?;
            writer.half.flush().await
        }
        .await;

        if let Err(e) = written {
            // Part of the line may be on the wire, so the session cannot
            // carry another command under any sequence number.
            let error = format!("failed to send command: {e}");
            tracing::debug!(seq = seq, error = %e, "Command write failed");
            if let Some(mut writer) = guard.take() {
                let _ = writer.half.shutdown().await;
            }
            drop(guard);
            self.shared.fail(error.clone()).await;
            return Err(Error::Transport(error));
        }

        writer.next_seq += 1;
        Ok(seq)
    }

    /// Close the connection. Safe to call at any time, including while a
    /// connect is in flight.
    pub async fn disconnect(&self) {
        let Some(session) = self.shared.session.lock().await.take() else {
            return;
        };

        tracing::debug!(host = %session.host, port = session.port, "Disconnecting command channel");
        session.cancel.cancel();
        let was_open = self.shared.connected.swap(false, Ordering::SeqCst);
        let was_connecting = session.task.is_none();
        if let Some(task) = session.task {
            let _ = task.await;
        }

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.half.shutdown().await;
        }
        self.shared.pending.lock().await.clear();

        if was_open || was_connecting {
            self.shared
                .emit(ChannelStatus::disconnected(session.host, session.port, None));
        }
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// The client handle from the radio's `H` line, once received.
    pub fn handle(&self) -> Option<u32> {
        *self.shared.handle_tx.borrow()
    }

    /// Wait until the radio has assigned a client handle.
    ///
    /// Never resolves if the radio does not send one; wrap it in a timeout.
    pub async fn wait_for_handle(&self) -> Result<u32> {
        let mut rx = self.shared.handle_tx.subscribe();
        let handle = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::NotConnected)?;
        (*handle).ok_or(Error::NotConnected)
    }

    /// The protocol version from the radio's `V` line, once received.
    pub async fn version(&self) -> Option<ProtocolVersion> {
        self.shared.version.lock().await.clone()
    }

    /// Subscribe to parsed inbound lines.
    pub fn subscribe(&self) -> broadcast::Receiver<CommandEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Subscribe to connection state transitions.
    pub fn subscribe_status(&self) -> broadcast::Receiver<ChannelStatus> {
        self.shared.status_tx.subscribe()
    }
}

impl Drop for CommandChannel {
    fn drop(&mut self) {
        if let Ok(mut session) = self.shared.session.try_lock() {
            if let Some(session) = session.take() {
                session.cancel.cancel();
            }
        }
    }
}

impl Shared {
    fn emit(&self, status: ChannelStatus) {
        tracing::debug!(
            state = %status.state,
            host = %status.host,
            port = status.port,
            error = ?status.error,
            "Command channel status"
        );
        let _ = self.status_tx.send(status);
    }

    fn publish(&self, event: CommandEvent) {
        let _ = self.event_tx.send(event);
    }

    /// End the current session after a write failure.
    async fn fail(&self, error: String) {
        let Some(session) = self.session.lock().await.take() else {
            return;
        };
        session.cancel.cancel();
        self.pending.lock().await.clear();

        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(ChannelStatus::disconnected(
                session.host,
                session.port,
                Some(error),
            ));
        }
    }
}

/// Background task that reads lines and dispatches them until the remote
/// closes, a read fails, or the session is cancelled.
async fn read_loop(
    mut reader: BufReader<ReadHalf<NetStream>>,
    shared: Shared,
    id: u64,
    cancel: CancellationToken,
    host: String,
    port: u16,
) {
    let mut line_buf = Vec::new();

    let error = loop {
        line_buf.clear();
        let read = tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_until(b'\n', &mut line_buf) => read,
        };

        match read {
            Ok(0) => {
                tracing::debug!(host = %host, "Command connection closed by radio");
                break None;
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&line_buf);
                if matches!(line, Cow::Owned(_)) {
                    tracing::debug!(host = %host, "Line from radio is not valid UTF-8");
                }
                let trimmed = line.trim_end_matches(['\r', '\n']);
                if !trimmed.is_empty() {
                    dispatch(trimmed, &shared).await;
                }
            }
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "Command channel read error");
                break Some(e.to_string());
            }
        }
    };

    {
        let mut session = shared.session.lock().await;
        if session.as_ref().is_some_and(|s| s.id == id) {
            *session = None;
        }
    }
    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = writer.half.shutdown().await;
    }
    // Dropping the senders fails every waiting reply receiver.
    shared.pending.lock().await.clear();

    if shared.connected.swap(false, Ordering::SeqCst) {
        shared.emit(ChannelStatus::disconnected(host, port, error));
    }
}

async fn dispatch(line: &str, shared: &Shared) {
    tracing::trace!(line = %line, "Received line");

    match codec::parse_line(line) {
        Ok(InboundLine::Reply(reply)) => {
            if let Some(tx) = shared.pending.lock().await.remove(&reply.sequence) {
                let _ = tx.send(reply.clone());
            }
            shared.publish(CommandEvent::Reply(reply));
        }
        Ok(InboundLine::Status(status)) => shared.publish(CommandEvent::Status(status)),
        Ok(InboundLine::Message { code, text }) => {
            tracing::debug!(code = format!("{code:08X}"), message = %text, "Radio message");
            shared.publish(CommandEvent::Message { code, text });
        }
        Ok(InboundLine::Handle(handle)) => {
            tracing::debug!(handle = format!("{handle:08X}"), "Client handle received");
            shared.handle_tx.send_replace(Some(handle));
            shared.publish(CommandEvent::Handle(handle));
        }
        Ok(InboundLine::Version(version)) => {
            tracing::debug!(version = %version, "Protocol version received");
            *shared.version.lock().await = Some(version.clone());
            shared.publish(CommandEvent::Version(version));
        }
        Ok(InboundLine::Unknown(line)) => {
            tracing::warn!(line = %line, "Unrecognized line from radio, dropping");
        }
        Err(e) => {
            tracing::warn!(error = %e, line = %line, "Failed to parse line, dropping");
        }
    }
}
