use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use anyhow::{Context, Result, anyhow, bail};
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify, broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, warn};

use sessiond_protocol::{
    Event, MAX_JSON_LINE_BYTES, MessageEnvelope, ResponseEnvelope, ServerMessage,
};

use crate::background::{SessionsBackground, SharedBackground};

const EVENT_BUFFER: usize = 256;

/// First id handed to requests sent without one, clear of the low ids
/// clients number their own requests with.
const ASSIGNED_ID_BASE: u64 = 1 << 32;

/// Transport between a context and the sessions background.
pub trait SessionsChannel: Send + Sync {
    /// Deliver one request and wait for its response.
    fn send(
        &self,
        envelope: MessageEnvelope,
    ) -> impl Future<Output = Result<ResponseEnvelope>> + Send;

    /// Receive every event the service broadcasts from now on.
    fn subscribe(&self) -> broadcast::Receiver<Event>;
}

/// In-process channel: contexts share the background directly.
#[derive(Clone)]
pub struct LocalChannel {
    shared: SharedBackground,
    events: broadcast::Sender<Event>,
}

impl LocalChannel {
    pub fn new(background: SessionsBackground) -> Self {
        let events = background.event_sender();
        Self {
            shared: background.into_shared(),
            events,
        }
    }

    pub async fn from_shared(shared: SharedBackground) -> Self {
        let events = shared.lock().await.event_sender();
        Self { shared, events }
    }

    pub fn shared(&self) -> &SharedBackground {
        &self.shared
    }
}

impl SessionsChannel for LocalChannel {
    async fn send(&self, envelope: MessageEnvelope) -> Result<ResponseEnvelope> {
        let mut background = self.shared.lock().await;
        Ok(background.handle_message(envelope))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

type Pending = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<ResponseEnvelope>>>>;

/// Channel to a `sessiond-server` over its Unix socket.
///
/// A reader task routes responses to waiting requests by correlation id and
/// pushes events to subscribers. Requests sent without an id get one
/// assigned; an id may only be in flight once.
pub struct SocketChannel {
    writer: Mutex<FramedWrite<OwnedWriteHalf, LinesCodec>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    hangup: Arc<Notify>,
    events: broadcast::Sender<Event>,
    reader: JoinHandle<()>,
}

impl SocketChannel {
    pub async fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused
                || e.kind() == std::io::ErrorKind::NotFound
            {
                anyhow!(
                    "sessions service is not running at {}. Start it with: sessiond-server",
                    socket_path.display()
                )
            } else {
                anyhow!(
                    "failed to connect to sessions service at {}: {e}",
                    socket_path.display()
                )
            }
        })?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already connected stream. Must be called inside a tokio runtime.
    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(
            read_half,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );
        let writer = FramedWrite::new(
            write_half,
            LinesCodec::new_with_max_length(MAX_JSON_LINE_BYTES),
        );

        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));
        let hangup = Arc::new(Notify::new());
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&closed),
            Arc::clone(&hangup),
            events.clone(),
        ));

        Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(ASSIGNED_ID_BASE),
            closed,
            hangup,
            events,
            reader,
        }
    }

    /// Whether the service side has hung up.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once the service side has hung up.
    pub async fn closed(&self) {
        loop {
            let notified = self.hangup.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }

    fn take_pending(&self, id: u64) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

impl SessionsChannel for SocketChannel {
    async fn send(&self, mut envelope: MessageEnvelope) -> Result<ResponseEnvelope> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            let id = match envelope.id {
                Some(id) if pending.contains_key(&id) => {
                    bail!("request id {id} is already in flight");
                }
                Some(id) => id,
                None => {
                    let mut id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    while pending.contains_key(&id) {
                        id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    }
                    envelope.id = Some(id);
                    id
                }
            };
            pending.insert(id, tx);
            id
        };
        // The reader marks closed before draining, so a request registered
        // after the drain is caught here.
        if self.is_closed() {
            self.take_pending(id);
            bail!("sessions service connection closed");
        }

        let line = match serde_json::to_string(&envelope) {
            Ok(line) => line,
            Err(e) => {
                self.take_pending(id);
                return Err(e).context("failed to encode request");
            }
        };
        let sent = self.writer.lock().await.send(line).await;
        if let Err(e) = sent {
            self.take_pending(id);
            return Err(e).context("failed to send request");
        }

        rx.await
            .map_err(|_| anyhow!("sessions service closed the connection before responding"))
    }

    fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, LinesCodec>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    hangup: Arc<Notify>,
    events: broadcast::Sender<Event>,
) {
    while let Some(line) = reader.next().await {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                warn!("sessions service read failed: {e}");
                break;
            }
        };
        match serde_json::from_str::<ServerMessage>(&line) {
            Ok(ServerMessage::Event { event }) => {
                let _ = events.send(event);
            }
            Ok(ServerMessage::Response(response)) => {
                let waiter = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!(id = response.id, "response with no waiting request"),
                }
            }
            Err(e) => warn!("unparseable line from sessions service: {e}"),
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders fails every request still waiting.
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
    hangup.notify_waiters();
}
