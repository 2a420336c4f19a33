use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::buffer::FrameBuffer;
use crate::debounce::Debouncer;
use crate::filter::{self, FilterPatch, FilterState};
use crate::protocol::{Direction, FilterUpdate, FrameEvent, Role};
use crate::render::{DirtyMarker, RenderScheduler};
use crate::transport::{ConnectionState, FrameBatch, SocketClient, SocketStats, Subscription};

/// Draws one render pass. The TUI implements it over ratatui; anything that
/// can show a list of frames can stand in.
pub trait RenderSink: Send {
    fn render(&mut self, frame: &ViewFrame) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct ViewOptions {
    pub capacity: usize,
    pub display_limit: usize,
    /// Replace the buffer with each history reply.
    pub clear_on_history: bool,
    /// Mirror filter changes to the server after `filter_debounce`.
    pub send_filters: bool,
    pub filter_debounce: Duration,
}

impl Default for ViewOptions {
    fn default() -> Self {
        Self {
            capacity: 1000,
            display_limit: 300,
            clear_on_history: true,
            send_filters: true,
            filter_debounce: Duration::from_millis(150),
        }
    }
}

/// Frame counters and drop accounting shown in the status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    frames: [[u64; 2]; 2],
    pub freeze_dropped: u64,
    pub queue_dropped: u64,
    pub decode_errors: u64,
    pub reconnects: u64,
}

impl StreamStats {
    pub fn frames(&self, role: Role, direction: Direction) -> u64 {
        self.frames[role_index(role)][direction_index(direction)]
    }

    pub fn total_frames(&self) -> u64 {
        self.frames.iter().flatten().sum()
    }

    fn record(&mut self, frame: &FrameEvent) {
        self.frames[role_index(frame.role)][direction_index(frame.direction)] += 1;
    }
}

fn role_index(role: Role) -> usize {
    match role {
        Role::Client => 0,
        Role::Server => 1,
    }
}

fn direction_index(direction: Direction) -> usize {
    match direction {
        Direction::Tx => 0,
        Direction::Rx => 1,
    }
}

/// A text field being edited, shown in place of its filter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub label: &'static str,
    pub input: String,
}

/// Everything one render pass needs, taken from a single buffer snapshot.
#[derive(Debug, Clone)]
pub struct ViewFrame {
    pub connection: ConnectionState,
    pub filter: FilterState,
    /// Matching frames, most recent first.
    pub frames: Vec<Arc<FrameEvent>>,
    pub buffered: usize,
    pub capacity: usize,
    pub stats: StreamStats,
    pub selected: Option<usize>,
    pub inspector: bool,
    pub prompt: Option<Prompt>,
    pub invalid_fields: Vec<&'static str>,
}

impl ViewFrame {
    pub fn selected_frame(&self) -> Option<&Arc<FrameEvent>> {
        self.selected.and_then(|i| self.frames.get(i))
    }
}

/// View state the flush callback renders from. Kept apart from the
/// scheduler so the callback can borrow it mutably.
struct ViewState {
    display_limit: usize,
    buffer: FrameBuffer,
    filter: FilterState,
    stats: StreamStats,
    connection: ConnectionState,
    connected_before: bool,
    selected: Option<usize>,
    inspector: bool,
    prompt: Option<Prompt>,
    render_error: Option<anyhow::Error>,
}

impl ViewState {
    fn visible(&self) -> Vec<Arc<FrameEvent>> {
        filter::visible(&self.buffer.snapshot(), &self.filter, self.display_limit)
    }

    fn view_frame(&self) -> ViewFrame {
        let frames = self.visible();
        let selected = match (self.selected, frames.len()) {
            (_, 0) | (None, _) => None,
            (Some(i), len) => Some(i.min(len - 1)),
        };
        ViewFrame {
            connection: self.connection,
            filter: self.filter.clone(),
            frames,
            buffered: self.buffer.len(),
            capacity: self.buffer.capacity(),
            stats: self.stats,
            selected,
            inspector: self.inspector && selected.is_some(),
            prompt: self.prompt.clone(),
            invalid_fields: self.filter.invalid_numeric_fields(),
        }
    }
}

/// UI-free view model for one live stream: bounded buffer, filter, stats
/// and selection, with redraws coalesced through a render scheduler.
///
/// Owned by a single task. Every mutation marks the view dirty; the owner
/// calls `tick` on its refresh clock and the attached sink draws at most
/// once per tick.
pub struct StreamView {
    state: ViewState,
    scheduler: RenderScheduler<ViewState>,
    dirty: DirtyMarker,
    debouncer: Debouncer<FilterUpdate>,
    clear_on_history: bool,
    send_filters: bool,
}

impl StreamView {
    pub fn new(options: ViewOptions) -> Self {
        let scheduler = RenderScheduler::new();
        Self {
            state: ViewState {
                display_limit: options.display_limit,
                buffer: FrameBuffer::new(options.capacity),
                filter: FilterState::default(),
                stats: StreamStats::default(),
                connection: ConnectionState::Idle,
                connected_before: false,
                selected: None,
                inspector: false,
                prompt: None,
                render_error: None,
            },
            dirty: scheduler.marker(),
            scheduler,
            debouncer: Debouncer::new(options.filter_debounce),
            clear_on_history: options.clear_on_history,
            send_filters: options.send_filters,
        }
    }

    /// Route render passes to `sink`, replacing any previous sink. The
    /// first tick after attaching always draws.
    pub fn attach<S>(&mut self, mut sink: S)
    where
        S: RenderSink + 'static,
    {
        self.scheduler.on_flush(move |state: &mut ViewState| {
            let frame = state.view_frame();
            if let Err(e) = sink.render(&frame) {
                state.render_error = Some(e);
            }
        });
        self.scheduler.mark_dirty();
    }

    /// Stop rendering. A filter update still waiting out its debounce is
    /// dropped with the sink.
    pub fn detach(&mut self) {
        self.scheduler.clear_flush();
        if let Some(update) = self.debouncer.cancel() {
            debug!("Dropping unsent filter update {update:?}");
        }
    }

    /// One refresh tick. Returns whether a render pass ran; a sink failure
    /// surfaces here.
    pub fn tick(&mut self) -> Result<bool> {
        let flushed = self.scheduler.tick(&mut self.state);
        match self.state.render_error.take() {
            Some(e) => Err(e),
            None => Ok(flushed),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.mark_dirty();
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.scheduler.is_dirty()
    }

    /// Append a delivered batch. While frozen, arrivals are dropped and
    /// counted. A history reply replaces the buffer when configured to.
    pub fn ingest(&mut self, batch: &FrameBatch) {
        if self.state.filter.freeze {
            self.state.stats.freeze_dropped += batch.frames.len() as u64;
            self.mark_dirty();
            return;
        }
        if batch.history && self.clear_on_history {
            debug!("History reply with {} frames replaces buffer", batch.frames.len());
            self.state.buffer.clear();
        }
        for frame in &batch.frames {
            self.state.stats.record(frame);
        }
        self.state.buffer.extend(batch.frames.iter().cloned());
        self.mark_dirty();
    }

    pub fn visible_frames(&self) -> Vec<Arc<FrameEvent>> {
        self.state.visible()
    }

    #[cfg(test)]
    pub fn view_frame(&self) -> ViewFrame {
        self.state.view_frame()
    }

    pub fn filter(&self) -> &FilterState {
        &self.state.filter
    }

    /// Apply a filter patch. A change to any predicate (not just freeze)
    /// schedules a debounced outbound update.
    pub fn set_filter(&mut self, patch: FilterPatch) -> bool {
        let before = self.state.filter.to_update();
        if !self.state.filter.apply(patch) {
            return false;
        }
        self.state.selected = None;
        self.mark_dirty();
        let after = self.state.filter.to_update();
        if self.send_filters && after != before {
            self.debouncer.schedule(after);
        }
        true
    }

    /// Resolves with the latest filter update once the debounce quiet
    /// period has passed. Pending forever while nothing changed.
    pub async fn take_filter_update(&mut self) -> FilterUpdate {
        self.debouncer.fired().await
    }

    pub fn clear(&mut self) {
        self.state.buffer.clear();
        self.state.selected = None;
        self.mark_dirty();
    }

    pub fn len(&self) -> usize {
        self.state.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.buffer.is_empty()
    }

    pub fn connection(&self) -> ConnectionState {
        self.state.connection
    }

    pub fn on_connection(&mut self, connection: ConnectionState) {
        if connection == self.state.connection {
            return;
        }
        if connection.is_connected() {
            if self.state.connected_before {
                self.state.stats.reconnects += 1;
            }
            self.state.connected_before = true;
        }
        self.state.connection = connection;
        self.mark_dirty();
    }

    /// Fold the socket's decode counters into the view's stats.
    pub fn sync_socket_stats(&mut self, socket: SocketStats) {
        let decode_errors = socket.decode_errors + socket.rejected_entries;
        if decode_errors != self.state.stats.decode_errors {
            self.state.stats.decode_errors = decode_errors;
            self.mark_dirty();
        }
    }

    pub fn record_queue_drops(&mut self, dropped: u64) {
        if dropped > 0 {
            self.state.stats.queue_dropped += dropped;
            self.mark_dirty();
        }
    }

    pub fn stats(&self) -> StreamStats {
        self.state.stats
    }

    // ── Selection / inspector ──

    pub fn select_next(&mut self) {
        let len = self.visible_frames().len();
        if len == 0 {
            return;
        }
        self.state.selected = Some(match self.state.selected {
            None => 0,
            Some(i) => (i + 1).min(len - 1),
        });
        self.mark_dirty();
    }

    pub fn select_previous(&mut self) {
        self.state.selected = match self.state.selected {
            None | Some(0) => None,
            Some(i) => Some(i - 1),
        };
        self.mark_dirty();
    }

    #[cfg(test)]
    pub fn selected_frame(&self) -> Option<Arc<FrameEvent>> {
        self.state.view_frame().selected_frame().cloned()
    }

    pub fn toggle_inspector(&mut self) {
        self.state.inspector = !self.state.inspector;
        self.mark_dirty();
    }

    pub fn set_prompt(&mut self, prompt: Option<Prompt>) {
        self.state.prompt = prompt;
        self.mark_dirty();
    }
}

/// The view end of a socket subscription: batches are forwarded onto a
/// bounded queue so the socket task never waits on a slow view. Overflow is
/// dropped and counted. Dropping the feed unsubscribes.
pub struct FrameFeed {
    rx: mpsc::Receiver<Arc<FrameBatch>>,
    dropped: Arc<AtomicU64>,
    _subscription: Subscription,
}

impl FrameFeed {
    pub fn subscribe(client: &SocketClient, depth: usize) -> Self {
        let (tx, rx) = mpsc::channel(depth.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let subscription = client.subscribe(forwarder(tx, dropped.clone()));
        Self {
            rx,
            dropped,
            _subscription: subscription,
        }
    }

    pub async fn recv(&mut self) -> Option<Arc<FrameBatch>> {
        self.rx.recv().await
    }

    /// Frames dropped on overflow since the last call.
    pub fn take_dropped(&self) -> u64 {
        self.dropped.swap(0, Ordering::Relaxed)
    }
}

fn forwarder(
    tx: mpsc::Sender<Arc<FrameBatch>>,
    dropped: Arc<AtomicU64>,
) -> impl Fn(&Arc<FrameBatch>) -> Result<()> + Send + Sync + 'static {
    move |batch| {
        match tx.try_send(batch.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(batch)) => {
                dropped.fetch_add(batch.frames.len() as u64, Ordering::Relaxed);
                warn!("View queue full, dropped {} frames", batch.frames.len());
            }
            // The view is gone; its subscription is about to be dropped
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::{advance, timeout};

    use super::*;
    use crate::protocol::tests::frame;

    fn batch(frames: Vec<FrameEvent>) -> FrameBatch {
        FrameBatch {
            frames: frames.into_iter().map(Arc::new).collect(),
            history: false,
        }
    }

    fn view(capacity: usize) -> StreamView {
        StreamView::new(ViewOptions {
            capacity,
            ..Default::default()
        })
    }

    fn type_ids(frames: &[Arc<FrameEvent>]) -> Vec<i64> {
        frames.iter().filter_map(|f| f.asdu.type_id).collect()
    }

    /// Records what each render pass saw.
    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<Vec<i64>>>>);

    impl RenderSink for RecordingSink {
        fn render(&mut self, frame: &ViewFrame) -> Result<()> {
            self.0.lock().unwrap().push(type_ids(&frame.frames));
            Ok(())
        }
    }

    struct BrokenSink;

    impl RenderSink for BrokenSink {
        fn render(&mut self, _: &ViewFrame) -> Result<()> {
            anyhow::bail!("terminal went away")
        }
    }

    #[test]
    fn ingest_keeps_the_last_n_and_shows_newest_first() {
        let mut view = view(3);
        for ti in 1..=5 {
            view.ingest(&batch(vec![frame("client", "tx", ti)]));
        }
        assert_eq!(view.len(), 3);
        assert_eq!(type_ids(&view.visible_frames()), vec![5, 4, 3]);
        assert_eq!(view.stats().frames(Role::Client, Direction::Tx), 5);
    }

    #[test]
    fn display_limit_caps_visible_frames() {
        let mut view = StreamView::new(ViewOptions {
            capacity: 10,
            display_limit: 2,
            ..Default::default()
        });
        view.ingest(&batch((1..=6).map(|ti| frame("server", "rx", ti)).collect()));
        assert_eq!(type_ids(&view.visible_frames()), vec![6, 5]);
        assert_eq!(view.len(), 6);
    }

    #[test]
    fn freeze_holds_the_snapshot_and_counts_drops() {
        let mut view = view(10);
        view.ingest(&batch(vec![frame("client", "tx", 1)]));
        view.set_filter(FilterPatch {
            freeze: Some(true),
            ..Default::default()
        });

        view.ingest(&batch(vec![frame("client", "tx", 2), frame("server", "rx", 3)]));
        assert_eq!(type_ids(&view.visible_frames()), vec![1]);
        assert_eq!(view.stats().freeze_dropped, 2);

        view.set_filter(FilterPatch {
            freeze: Some(false),
            ..Default::default()
        });
        view.ingest(&batch(vec![frame("client", "rx", 4)]));
        assert_eq!(type_ids(&view.visible_frames()), vec![4, 1]);
    }

    #[test]
    fn history_reply_replaces_the_buffer() {
        let mut view = view(10);
        view.ingest(&batch(vec![frame("client", "tx", 1), frame("client", "tx", 2)]));
        view.ingest(&FrameBatch {
            frames: vec![Arc::new(frame("server", "tx", 9))],
            history: true,
        });
        assert_eq!(type_ids(&view.visible_frames()), vec![9]);

        let mut keep = StreamView::new(ViewOptions {
            clear_on_history: false,
            ..Default::default()
        });
        keep.ingest(&batch(vec![frame("client", "tx", 1)]));
        keep.ingest(&FrameBatch {
            frames: vec![Arc::new(frame("server", "tx", 9))],
            history: true,
        });
        assert_eq!(keep.len(), 2);
    }

    #[test]
    fn a_burst_renders_once_from_one_snapshot() {
        let mut view = view(100);
        let sink = RecordingSink::default();
        view.attach(sink.clone());
        assert!(view.tick().unwrap());

        for ti in 1..=50 {
            view.ingest(&batch(vec![frame("client", "tx", ti)]));
        }
        assert!(view.tick().unwrap());
        assert!(!view.tick().unwrap());

        let passes = sink.0.lock().unwrap();
        assert_eq!(passes.len(), 2);
        assert!(passes[0].is_empty());
        assert_eq!(passes[1].len(), 50);
        assert_eq!(passes[1][0], 50);
    }

    #[test]
    fn filter_change_rerenders_with_the_new_filter() {
        let mut view = view(10);
        view.ingest(&batch(vec![
            frame("client", "tx", 45),
            frame("client", "rx", 1),
            frame("server", "tx", 1),
        ]));
        let sink = RecordingSink::default();
        view.attach(sink.clone());
        view.tick().unwrap();

        assert!(view.set_filter(FilterPatch {
            direction: Some(Some(Direction::Rx)),
            ..Default::default()
        }));
        view.tick().unwrap();
        assert_eq!(sink.0.lock().unwrap().last().unwrap(), &vec![1]);
    }

    #[test]
    fn sink_errors_surface_from_tick() {
        let mut view = view(10);
        view.attach(BrokenSink);
        let err = view.tick().unwrap_err();
        assert!(err.to_string().contains("terminal went away"));
        assert!(!view.tick().unwrap());
    }

    #[test]
    fn detached_view_never_renders() {
        let mut view = view(10);
        let sink = RecordingSink::default();
        view.attach(sink.clone());
        view.set_filter(FilterPatch {
            role: Some(Some(Role::Client)),
            ..Default::default()
        });
        view.detach();
        assert!(view.debouncer.deadline().is_none());
        view.ingest(&batch(vec![frame("client", "tx", 1)]));
        assert!(!view.tick().unwrap());
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn filter_updates_are_debounced() {
        let mut view = view(10);
        for text in ["4", "45", "450"] {
            view.set_filter(FilterPatch {
                ioa: Some(text.into()),
                ..Default::default()
            });
            advance(Duration::from_millis(100)).await;
        }
        let update = view.take_filter_update().await;
        assert_eq!(update.ioa.as_deref(), Some("450"));
        assert!(view.debouncer.deadline().is_none());

        view.set_filter(FilterPatch {
            freeze: Some(true),
            ..Default::default()
        });
        assert!(view.debouncer.deadline().is_none());
        assert!(timeout(Duration::from_secs(1), view.take_filter_update()).await.is_err());
    }

    #[test]
    fn filters_stay_local_when_not_mirrored() {
        let mut view = StreamView::new(ViewOptions {
            send_filters: false,
            ..Default::default()
        });
        view.set_filter(FilterPatch {
            role: Some(Some(Role::Server)),
            ..Default::default()
        });
        assert!(view.debouncer.deadline().is_none());
    }

    #[test]
    fn counts_reconnects_not_the_first_connect() {
        let mut view = view(10);
        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ] {
            view.on_connection(state);
        }
        assert_eq!(view.stats().reconnects, 1);
        assert_eq!(view.connection(), ConnectionState::Connected);
    }

    #[test]
    fn clear_empties_and_resets_selection() {
        let mut view = view(10);
        view.ingest(&batch(vec![frame("client", "tx", 1), frame("client", "tx", 2)]));
        view.select_next();
        assert_eq!(view.selected_frame().and_then(|f| f.asdu.type_id), Some(2));
        view.clear();
        assert!(view.is_empty());
        assert!(view.selected_frame().is_none());
    }

    #[test]
    fn selection_is_clamped_to_visible_frames() {
        let mut view = view(10);
        view.ingest(&batch(vec![frame("client", "tx", 1), frame("client", "tx", 2)]));
        for _ in 0..5 {
            view.select_next();
        }
        assert_eq!(view.selected_frame().and_then(|f| f.asdu.type_id), Some(1));
        view.toggle_inspector();
        assert!(view.view_frame().inspector);

        view.select_previous();
        view.select_previous();
        assert!(view.selected_frame().is_none());
        assert!(!view.view_frame().inspector);
    }

    #[test]
    fn socket_stats_fold_into_decode_errors() {
        let mut view = view(10);
        view.sync_socket_stats(SocketStats {
            decode_errors: 2,
            rejected_entries: 3,
            ..Default::default()
        });
        view.record_queue_drops(4);
        view.record_queue_drops(0);
        let stats = view.stats();
        assert_eq!(stats.decode_errors, 5);
        assert_eq!(stats.queue_dropped, 4);
    }

    #[tokio::test]
    async fn forwarder_counts_overflow_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let dropped = Arc::new(AtomicU64::new(0));
        let forward = forwarder(tx, dropped.clone());

        let first = Arc::new(batch(vec![frame("client", "tx", 1)]));
        let second = Arc::new(batch(vec![frame("client", "tx", 2), frame("client", "tx", 3)]));
        forward(&first).unwrap();
        forward(&second).unwrap();

        assert_eq!(dropped.load(Ordering::Relaxed), 2);
        let received = rx.recv().await.unwrap();
        assert!(Arc::ptr_eq(&received, &first));

        drop(rx);
        assert!(forward(&first).is_ok());
    }
}
