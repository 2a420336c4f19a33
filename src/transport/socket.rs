use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{FrameEvent, Inbound, OutboundMessage, decode_message};

use super::{Backoff, ConnectionState, Connector, Link, ReconnectPolicy, TransportError};

const OUTBOUND_CAPACITY: usize = 64;

/// Frames decoded from one inbound message, shared by every subscriber.
#[derive(Debug)]
pub struct FrameBatch {
    pub frames: Vec<Arc<FrameEvent>>,
    /// Reply to a history request rather than live traffic.
    pub history: bool,
}

type Callback = dyn Fn(&Arc<FrameBatch>) -> Result<()> + Send + Sync;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Arc<Callback>,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Registry {
    fn add(&self, callback: Arc<Callback>) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.lock().push(Subscriber {
            id,
            active: active.clone(),
            callback,
        });
        (id, active)
    }

    fn remove(&self, id: u64) {
        self.lock().retain(|s| s.id != id);
    }

    fn deactivate_all(&self) {
        for subscriber in self.lock().drain(..) {
            subscriber.active.store(false, Ordering::Release);
        }
    }

    /// Fan a batch out to every active subscriber. Callbacks run outside the
    /// lock, so they may subscribe or cancel freely. A subscriber cancelled
    /// mid-delivery is skipped even for the current batch.
    fn deliver(&self, batch: &Arc<FrameBatch>) -> usize {
        let targets: Vec<Subscriber> = self.lock().clone();
        let mut delivered = 0;
        for target in targets {
            if !target.active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (target.callback)(batch))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("Subscriber {} failed: {e:#}", target.id),
                Err(_) => error!("Subscriber {} panicked during delivery", target.id),
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cancellation token for one subscriber. Cancelling is idempotent, safe
/// from inside a callback, and also happens on drop.
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn cancel(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(shared) = self.shared.upgrade() {
                shared.registry.remove(self.id);
            }
            debug!("Subscriber {} removed", self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    decode_errors: AtomicU64,
    rejected_entries: AtomicU64,
    connects: AtomicU64,
    failed_attempts: AtomicU64,
}

/// Point-in-time copy of the client's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SocketStats {
    pub messages: u64,
    pub decode_errors: u64,
    pub rejected_entries: u64,
    pub connects: u64,
    pub failed_attempts: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SocketOptions {
    pub policy: ReconnectPolicy,
    /// Ask for this many frames of history after every connect.
    pub history_limit: Option<usize>,
}

struct Shared {
    url: String,
    registry: Registry,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    counters: Counters,
    /// Replayed after a reconnect; the server forgets per-connection filters.
    last_filters: Mutex<Option<OutboundMessage>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectionState::Closed {
                return false;
            }
            debug!("Stream state {current} -> {next}");
            *current = next;
            true
        });
    }

    fn dispatch_text(&self, text: &str) {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        match decode_message(text) {
            Ok(Inbound::Frames {
                frames,
                rejected,
                history,
            }) => {
                if rejected > 0 {
                    self.counters
                        .rejected_entries
                        .fetch_add(rejected as u64, Ordering::Relaxed);
                }
                if frames.is_empty() && !history {
                    return;
                }
                let batch = Arc::new(FrameBatch {
                    frames: frames.into_iter().map(Arc::new).collect(),
                    history,
                });
                self.registry.deliver(&batch);
            }
            Ok(Inbound::Control { kind }) => debug!("Ignoring control message kind={kind}"),
            Err(e) => {
                self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Discarding stream message: {e}");
            }
        }
    }
}

/// Handle to one auto-reconnecting stream connection. Clones share the
/// connection; it lives until `close()` is called, independent of how many
/// subscribers come and go.
#[derive(Clone)]
pub struct SocketClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<OutboundMessage>,
}

impl SocketClient {
    /// Start connecting in the background. Must be called inside a tokio
    /// runtime.
    pub fn connect(
        url: impl Into<String>,
        connector: Arc<dyn Connector>,
        options: SocketOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared {
            url: url.into(),
            registry: Registry::default(),
            state,
            cancel: CancellationToken::new(),
            counters: Counters::default(),
            last_filters: Mutex::new(None),
        });
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        let task_shared = shared.clone();
        tokio::spawn(async move {
            connection_loop(task_shared, connector, outbound_rx, options).await;
        });

        Self { shared, outbound }
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    /// Register a callback run once per decoded message, in arrival order.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Arc<FrameBatch>) -> Result<()> + Send + Sync + 'static,
    {
        if self.is_closed() {
            return Subscription {
                id: u64::MAX,
                active: Arc::new(AtomicBool::new(false)),
                shared: Weak::new(),
            };
        }
        let (id, active) = self.shared.registry.add(Arc::new(callback));
        debug!("Subscriber {id} added");
        Subscription {
            id,
            active,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Best-effort send. Returns false when disconnected or the outbound
    /// queue is full; the message is dropped in both cases.
    pub fn send(&self, message: OutboundMessage) -> bool {
        if matches!(message, OutboundMessage::Filters(_)) {
            *self
                .shared
                .last_filters
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(message.clone());
        }
        if !self.state().is_connected() {
            debug!("Not connected, dropping outbound message");
            return false;
        }
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!("Outbound message dropped: {e}");
                false
            }
        }
    }

    /// Shut the connection down for good. No reconnect follows and no
    /// subscriber receives anything afterwards.
    pub fn close(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        info!("Closing stream {}", self.shared.url);
        self.shared.cancel.cancel();
        self.shared.registry.deactivate_all();
        self.shared.set_state(ConnectionState::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn stats(&self) -> SocketStats {
        let c = &self.shared.counters;
        SocketStats {
            messages: c.messages.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            rejected_entries: c.rejected_entries.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            failed_attempts: c.failed_attempts.load(Ordering::Relaxed),
        }
    }
}

enum LinkEnd {
    Cancelled,
    Closed,
    Failed(TransportError),
}

async fn connection_loop(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    mut outbound_rx: mpsc::Receiver<OutboundMessage>,
    options: SocketOptions,
) {
    let mut backoff = Backoff::new(options.policy);

    loop {
        shared.set_state(ConnectionState::Connecting);
        info!("Stream connecting to {}", shared.url);

        let attempt = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            result = connector.connect(&shared.url) => result,
        };

        match attempt {
            Ok(mut link) => {
                backoff.reset();
                shared.counters.connects.fetch_add(1, Ordering::Relaxed);
                shared.set_state(ConnectionState::Connected);
                info!("Stream connected");

                // Anything queued for the previous connection is stale
                while outbound_rx.try_recv().is_ok() {}

                let end = match greet(&shared, link.as_mut(), options.history_limit).await {
                    Ok(()) => pump(&shared, link.as_mut(), &mut outbound_rx).await,
                    Err(e) => LinkEnd::Failed(e),
                };
                match end {
                    LinkEnd::Cancelled => break,
                    LinkEnd::Closed => info!("Stream closed by peer, reconnecting..."),
                    LinkEnd::Failed(e) => warn!("Stream error: {e}, reconnecting..."),
                }
            }
            Err(e) => {
                shared.counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
                warn!("{e}");
            }
        }

        shared.set_state(ConnectionState::Disconnected);
        let delay = backoff.next_delay();
        debug!("Next connect attempt in {delay:?}");
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.set_state(ConnectionState::Closed);
    debug!("Stream task for {} finished", shared.url);
}

async fn greet(
    shared: &Shared,
    link: &mut dyn Link,
    history_limit: Option<usize>,
) -> Result<(), TransportError> {
    if let Some(limit) = history_limit {
        send_message(link, &OutboundMessage::History { limit }).await?;
    }
    let replay = shared
        .last_filters
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    if let Some(filters) = replay {
        send_message(link, &filters).await?;
    }
    Ok(())
}

async fn pump(
    shared: &Shared,
    link: &mut dyn Link,
    outbound_rx: &mut mpsc::Receiver<OutboundMessage>,
) -> LinkEnd {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                link.close().await;
                return LinkEnd::Cancelled;
            }
            incoming = link.recv() => match incoming {
                Ok(Some(text)) => shared.dispatch_text(&text),
                Ok(None) => return LinkEnd::Closed,
                Err(e) => return LinkEnd::Failed(e),
            },
            Some(message) = outbound_rx.recv() => {
                if let Err(e) = send_message(link, &message).await {
                    return LinkEnd::Failed(e);
                }
            }
        }
    }
}

async fn send_message(link: &mut dyn Link, message: &OutboundMessage) -> Result<(), TransportError> {
    let text = message
        .to_text()
        .map_err(|e| TransportError::Send(e.to_string()))?;
    link.send(text).await
}
