//! Channel multiplexer.
//!
//! Carries independent channels over one duplex byte stream:
//!
//! - a single reader task drains the stream and hands each frame to its
//!   channel's bounded queue, to the pending opener, or to the command handler.
//!   It never waits on a channel: one that stops draining is closed;
//! - callers on any task write to their channels through one outbound queue,
//!   which a single writer task serializes onto the stream.
//!
//! The session moves `AwaitingHello → Active → Closed`. The writer holds
//! every outbound frame until the remote agent's `hello` arrives, so opens
//! and writes issued early are queued, not lost. Teardown closes every
//! channel and fires each registered close callback exactly once.

use super::command::{CommandMessage, ControlCommand};
use super::frame::{Frame, FrameCodec, FrameFlags, OpenRequest, CONTROL_CHANNEL, MAX_PAYLOAD};
use crate::{DynoError, Result};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound frames buffered per channel; a channel that falls this far
/// behind is closed so the other channels keep flowing
const CHANNEL_QUEUE: usize = 256;

/// Outbound frames buffered before writers wait
const OUTBOUND_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHello,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    Run { command: String },
    Tunnel { port: u16 },
}

impl From<&ChannelKind> for OpenRequest {
    fn from(kind: &ChannelKind) -> Self {
        match kind {
            ChannelKind::Run { command } => OpenRequest::Run {
                command: command.clone(),
            },
            ChannelKind::Tunnel { port } => OpenRequest::Tunnel { port: *port },
        }
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;
type CommandHandler = Arc<dyn Fn(ControlCommand) + Send + Sync>;

struct ChannelEntry {
    kind: ChannelKind,
    inbound: mpsc::Sender<Bytes>,
    ack: Option<oneshot::Sender<()>>,
    on_close: Option<CloseCallback>,
}

#[derive(Default)]
struct ChannelTable {
    channels: HashMap<u32, ChannelEntry>,
    closed: bool,
}

struct Shared {
    table: Mutex<ChannelTable>,
    outbound: mpsc::Sender<Frame>,
    state: watch::Sender<SessionState>,
    activated: AtomicBool,
    next_id: AtomicU32,
    handler: Mutex<Option<CommandHandler>>,
    shutdown: CancellationToken,
}

/// Cloneable handle to the channel multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<Shared>,
}

/// Starts the multiplexer's reader and writer tasks on a transport.
pub struct MuxDriver {
    shared: Arc<Shared>,
    outbound: mpsc::Receiver<Frame>,
}

/// A running session: the multiplexer plus the tasks driving its stream.
pub struct Connection {
    mux: Multiplexer,
    // None once `closed` has consumed the reader's result
    reader: Option<JoinHandle<Result<()>>>,
    writer: JoinHandle<()>,
}

impl Multiplexer {
    /// New multiplexer awaiting hello, and the driver that will run it.
    pub fn new() -> (Multiplexer, MuxDriver) {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state, _) = watch::channel(SessionState::AwaitingHello);

        let shared = Arc::new(Shared {
            table: Mutex::new(ChannelTable::default()),
            outbound: outbound_tx,
            state,
            activated: AtomicBool::new(false),
            next_id: AtomicU32::new(CONTROL_CHANNEL + 1),
            handler: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        (
            Multiplexer {
                shared: Arc::clone(&shared),
            },
            MuxDriver {
                shared,
                outbound: outbound_rx,
            },
        )
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    /// True once the remote hello has arrived, even after the session closed.
    pub fn was_activated(&self) -> bool {
        self.shared.activated.load(Ordering::SeqCst)
    }

    /// Wait for the remote hello. Fails if the session closes first.
    pub async fn wait_active(&self) -> Result<()> {
        let mut state = self.shared.state.subscribe();
        loop {
            match *state.borrow_and_update() {
                SessionState::Active => return Ok(()),
                SessionState::Closed => return Err(session_closed()),
                SessionState::AwaitingHello => {}
            }
            if state.changed().await.is_err() {
                return Err(session_closed());
            }
        }
    }

    /// Wait until the session is torn down.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        loop {
            if *state.borrow_and_update() == SessionState::Closed {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    /// Open a run-channel executing `command` remotely.
    pub async fn run(&self, command: &str) -> Result<Channel> {
        self.open(ChannelKind::Run {
            command: command.to_string(),
        })
        .await
    }

    /// Open a tunnel-channel to `port` on the remote side.
    pub async fn tunnel(&self, port: u16) -> Result<Channel> {
        self.open(ChannelKind::Tunnel { port }).await
    }

    /// Open a channel; resolves once the remote side acknowledges it.
    pub async fn open(&self, kind: ChannelKind) -> Result<Channel> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_QUEUE);
        let (ack_tx, ack_rx) = oneshot::channel();

        {
            let mut table = self.lock_table();
            if table.closed {
                return Err(session_closed());
            }
            table.channels.insert(
                id,
                ChannelEntry {
                    kind: kind.clone(),
                    inbound: inbound_tx,
                    ack: Some(ack_tx),
                    on_close: None,
                },
            );
        }

        let request = OpenRequest::from(&kind);
        self.send_frame(Frame::open(id, &request)?).await?;
        debug!("Channel {} open requested: {:?}", id, kind);

        ack_rx.await.map_err(|_| {
            DynoError::Connection(format!("channel {} closed before it was acknowledged", id))
        })?;
        debug!("Channel {} acknowledged", id);

        Ok(Channel {
            id,
            kind,
            inbound: inbound_rx,
            mux: self.clone(),
        })
    }

    /// Register the close callback for channel `id`.
    ///
    /// Replaces a previously registered callback. If the channel is already
    /// closed the callback runs immediately.
    pub fn on_close<F>(&self, id: u32, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let already_closed = {
            let mut table = self.lock_table();
            match table.channels.get_mut(&id) {
                Some(entry) => {
                    entry.on_close = Some(Box::new(callback));
                    None
                }
                None => Some(callback),
            }
        };
        if let Some(callback) = already_closed {
            callback();
        }
    }

    /// Write `data` to channel `id`, split into frames as needed.
    pub async fn write(&self, id: u32, data: Bytes) -> Result<()> {
        if !self.lock_table().channels.contains_key(&id) {
            return Err(DynoError::Connection(format!("channel {} is closed", id)));
        }

        let mut data = data;
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(MAX_PAYLOAD));
            self.send_frame(Frame::data(id, chunk)).await?;
        }
        Ok(())
    }

    /// Close channel `id` locally: tell the remote side and fire its callback.
    pub async fn close(&self, id: u32) {
        let entry = self.lock_table().channels.remove(&id);
        if let Some(entry) = entry {
            debug!("Closing channel {}", id);
            if let Err(e) = self.send_frame(Frame::close(id)).await {
                debug!("Close of channel {} not sent: {}", id, e);
            }
            fire(entry);
        }
    }

    /// Send a control command on the control channel.
    pub async fn command(&self, message: impl Into<CommandMessage>) -> Result<()> {
        let message = message.into();
        debug!("Sending command {}", message.command);
        self.send_frame(Frame::data(CONTROL_CHANNEL, message.to_bytes()?))
            .await
    }

    /// Register the handler invoked for each inbound control command.
    pub fn on_command<F>(&self, handler: F)
    where
        F: Fn(ControlCommand) + Send + Sync + 'static,
    {
        *self
            .shared
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(handler));
    }

    /// Number of open channels.
    pub fn channel_count(&self) -> usize {
        self.lock_table().channels.len()
    }

    /// Tear the session down: stop both tasks and close every channel.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
        self.close_all();
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, ChannelTable> {
        self.shared.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(session_closed());
        }
        self.shared
            .outbound
            .send(frame)
            .await
            .map_err(|_| session_closed())
    }

    fn close_all(&self) {
        let drained: Vec<(u32, ChannelEntry)> = {
            let mut table = self.lock_table();
            if table.closed {
                return;
            }
            table.closed = true;
            table.channels.drain().collect()
        };

        self.shared.state.send_replace(SessionState::Closed);
        info!("Session closed ({} channels open)", drained.len());

        for (id, entry) in drained {
            debug!("Channel {} closed by teardown", id);
            fire(entry);
        }
    }

    fn handle_control(&self, payload: &[u8]) {
        let command = match CommandMessage::from_slice(payload).and_then(ControlCommand::try_from) {
            Ok(command) => command,
            Err(e) => {
                warn!("Ignoring control message: {}", e);
                return;
            }
        };

        if command == ControlCommand::Hello {
            let activated = self.shared.state.send_if_modified(|state| {
                if *state == SessionState::AwaitingHello {
                    *state = SessionState::Active;
                    true
                } else {
                    false
                }
            });
            if activated {
                self.shared.activated.store(true, Ordering::SeqCst);
                info!("Remote hello received, session active");
            }
            return;
        }

        let handler = self
            .shared
            .handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler(command),
            None => debug!("No command handler for {:?}", command),
        }
    }

    fn handle_frame(&self, frame: Frame) {
        if frame.channel == CONTROL_CHANNEL {
            if frame.is_data() {
                self.handle_control(&frame.payload);
            } else {
                warn!("Ignoring {:?} frame on control channel", frame.flags);
            }
            return;
        }

        let id = frame.channel;
        if frame.flags.contains(FrameFlags::CLOSE) {
            let entry = self.lock_table().channels.remove(&id);
            if let Some(entry) = entry {
                debug!("Channel {} closed by remote", id);
                fire(entry);
            }
            return;
        }

        if frame.flags.contains(FrameFlags::ACK) {
            let ack = self
                .lock_table()
                .channels
                .get_mut(&id)
                .and_then(|entry| entry.ack.take());
            match ack {
                Some(ack) => {
                    let _ = ack.send(());
                }
                None => warn!("Unexpected ack for channel {}", id),
            }
            return;
        }

        if frame.flags.contains(FrameFlags::OPEN) {
            warn!("Remote tried to open channel {}; refusing", id);
            self.send_in_background(Frame::close(id));
            return;
        }

        let inbound = self
            .lock_table()
            .channels
            .get(&id)
            .map(|entry| entry.inbound.clone());
        let Some(inbound) = inbound else {
            debug!("Dropping {} bytes for closed channel {}", frame.payload.len(), id);
            return;
        };

        // The reader never waits on one channel: a consumer that falls a
        // full queue behind loses its channel instead of stalling the rest
        match inbound.try_send(frame.payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Channel {} is not draining its input; closing it", id);
                self.close_overflowed(id);
            }
            Err(TrySendError::Closed(_)) => debug!("Channel {} reader is gone", id),
        }
    }

    /// Close a channel from the reader task without waiting on the writer.
    fn close_overflowed(&self, id: u32) {
        let Some(entry) = self.lock_table().channels.remove(&id) else {
            return;
        };
        fire(entry);
        self.send_in_background(Frame::close(id));
    }

    /// Queue `frame` for the writer from a task of its own.
    fn send_in_background(&self, frame: Frame) {
        let mux = self.clone();
        tokio::spawn(async move {
            let channel = frame.channel;
            if let Err(e) = mux.send_frame(frame).await {
                debug!("Frame for channel {} not sent: {}", channel, e);
            }
        });
    }
}

impl MuxDriver {
    /// Spawn the reader and writer tasks on `io`.
    pub fn start<T>(self, io: T) -> Connection
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(io);
        let mux = Multiplexer {
            shared: Arc::clone(&self.shared),
        };

        let writer = tokio::spawn(write_loop(
            mux.clone(),
            FramedWrite::new(write_half, FrameCodec),
            self.outbound,
        ));
        let reader = tokio::spawn(read_loop(mux.clone(), FramedRead::new(read_half, FrameCodec)));

        Connection {
            mux,
            reader: Some(reader),
            writer,
        }
    }
}

impl Connection {
    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    /// Wait for the reader to finish. `Ok` means the remote hung up or the
    /// session was shut down; `Err` is a transport or framing failure.
    pub async fn closed(&mut self) -> Result<()> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(());
        };
        let result = match reader.await {
            Ok(result) => result,
            Err(e) => Err(DynoError::Connection(format!("reader task failed: {}", e))),
        };
        self.reader = None;
        result
    }

    /// Shut the session down and wait for both tasks.
    pub async fn shutdown(self) {
        self.mux.shutdown();
        if let Some(reader) = self.reader {
            let _ = reader.await;
        }
        let _ = self.writer.await;
    }
}

async fn read_loop<R>(mux: Multiplexer, mut frames: FramedRead<R, FrameCodec>) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let shutdown = mux.shared.shutdown.clone();
    let result = loop {
        let next = tokio::select! {
            next = frames.next() => next,
            _ = shutdown.cancelled() => break Ok(()),
        };

        match next {
            Some(Ok(frame)) => mux.handle_frame(frame),
            Some(Err(DynoError::Io(e))) => {
                break Err(DynoError::Connection(format!("connection lost: {}", e)))
            }
            Some(Err(e)) => break Err(e),
            None => {
                info!("Remote end closed the connection");
                break Ok(());
            }
        }
    };

    if let Err(e) = &result {
        warn!("Session reader stopped: {}", e);
    }
    mux.shutdown();
    result
}

async fn write_loop<W>(mux: Multiplexer, mut sink: FramedWrite<W, FrameCodec>, mut outbound: mpsc::Receiver<Frame>)
where
    W: AsyncWrite + Unpin,
{
    let shutdown = mux.shared.shutdown.clone();

    tokio::select! {
        active = mux.wait_active() => {
            if active.is_err() {
                return;
            }
        }
        _ = shutdown.cancelled() => return,
    }
    debug!("Writer released after hello");

    loop {
        let frame = tokio::select! {
            frame = outbound.recv() => frame,
            _ = shutdown.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };

        if let Err(e) = sink.send(frame).await {
            warn!("Session writer failed: {}", e);
            mux.shutdown();
            break;
        }
    }

    let _ = sink.close().await;
}

fn fire(entry: ChannelEntry) {
    let ChannelEntry {
        kind,
        inbound,
        ack,
        on_close,
    } = entry;
    // Dropping the queue sender ends the channel's inbound stream
    drop(inbound);
    drop(ack);
    if let Some(callback) = on_close {
        debug!("Firing close callback for {:?}", kind);
        callback();
    }
}

fn session_closed() -> DynoError {
    DynoError::Connection("session closed".into())
}

/// One multiplexed channel: an inbound byte queue plus a write path.
pub struct Channel {
    id: u32,
    kind: ChannelKind,
    inbound: mpsc::Receiver<Bytes>,
    mux: Multiplexer,
}

impl Channel {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn kind(&self) -> &ChannelKind {
        &self.kind
    }

    /// Next chunk from the remote side; `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    pub async fn write(&self, data: Bytes) -> Result<()> {
        self.mux.write(self.id, data).await
    }

    pub async fn close(&self) {
        self.mux.close(self.id).await
    }

    pub fn on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.mux.on_close(self.id, callback)
    }

    /// Split into independently owned read and write halves.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (
            ChannelReader {
                id: self.id,
                inbound: self.inbound,
            },
            ChannelWriter {
                id: self.id,
                mux: self.mux,
            },
        )
    }
}

pub struct ChannelReader {
    id: u32,
    inbound: mpsc::Receiver<Bytes>,
}

impl ChannelReader {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }
}

#[derive(Clone)]
pub struct ChannelWriter {
    id: u32,
    mux: Multiplexer,
}

impl ChannelWriter {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub async fn write(&self, data: Bytes) -> Result<()> {
        self.mux.write(self.id, data).await
    }

    pub async fn close(&self) {
        self.mux.close(self.id).await
    }
}
