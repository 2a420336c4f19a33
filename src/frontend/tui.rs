use std::io;
use std::sync::Arc;

use anyhow::Result;
use crossterm::{
    event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use futures_util::StreamExt;
use ratatui::{
    Frame, Terminal,
    backend::{Backend, CrosstermBackend},
    layout::{Constraint, Direction as Axis, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table, TableState, Wrap},
};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::context::StreamContext;
use crate::filter::{FilterPatch, FilterState};
use crate::protocol::{Direction, FrameEvent, OutboundMessage, Role};
use crate::transport::ConnectionState;
use crate::view::{FrameFeed, Prompt, RenderSink, StreamView, ViewFrame};

use super::{Frontend, QUEUE_DEPTH, apci_label, format_time, ioa_label, opt_num};

/// Interactive full-screen viewer.
pub struct TuiFrontend;

#[async_trait::async_trait]
impl Frontend for TuiFrontend {
    async fn run(self: Box<Self>, ctx: Arc<StreamContext>) -> Result<()> {
        let mut view = StreamView::new(ctx.config().view_options());
        let mut feed = FrameFeed::subscribe(ctx.client(), QUEUE_DEPTH);
        let mut state_rx = ctx.client().watch_state();
        view.on_connection(*state_rx.borrow_and_update());

        let guard = TerminalGuard::enter()?;
        let terminal = Terminal::new(CrosstermBackend::new(io::stdout()))?;
        view.attach(TerminalSink {
            terminal,
            url: ctx.client().url().to_string(),
        });

        let result = event_loop(&ctx, &mut view, &mut feed, &mut state_rx).await;
        view.detach();
        drop(guard);
        let stats = view.stats();
        info!(
            "Viewer closed while {}: {} frames received, {} buffered, {} dropped",
            view.connection(),
            stats.total_frames(),
            view.len(),
            stats.freeze_dropped + stats.queue_dropped
        );
        result
    }
}

// ── Terminal ──

/// Raw mode and the alternate screen, undone on drop on every exit path.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = disable_raw_mode() {
            warn!("Failed to leave raw mode: {e}");
        }
        if let Err(e) = execute!(io::stdout(), LeaveAlternateScreen, crossterm::cursor::Show) {
            warn!("Failed to leave alternate screen: {e}");
        }
    }
}

struct TerminalSink<B: Backend> {
    terminal: Terminal<B>,
    url: String,
}

impl<B: Backend + Send> RenderSink for TerminalSink<B> {
    fn render(&mut self, view: &ViewFrame) -> Result<()> {
        self.terminal.draw(|frame| draw(frame, view, &self.url))?;
        Ok(())
    }
}

// ── Event loop ──

async fn event_loop(
    ctx: &StreamContext,
    view: &mut StreamView,
    feed: &mut FrameFeed,
    state_rx: &mut tokio::sync::watch::Receiver<ConnectionState>,
) -> Result<()> {
    let client = ctx.client();
    let mut events = EventStream::new();
    let mut ticker = tokio::time::interval(ctx.config().refresh_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut input = InputState::default();

    loop {
        tokio::select! {
            batch = feed.recv() => {
                let Some(batch) = batch else { break };
                view.ingest(&batch);
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                view.on_connection(*state_rx.borrow_and_update());
            }
            _ = ticker.tick() => {
                view.sync_socket_stats(client.stats());
                view.record_queue_drops(feed.take_dropped());
                view.tick()?;
            }
            update = view.take_filter_update() => {
                if !client.send(OutboundMessage::Filters(update)) {
                    debug!("Filter update held until the stream reconnects");
                }
            }
            maybe_event = events.next() => match maybe_event {
                Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                    if handle_key(view, &mut input, key) == Action::Quit {
                        break;
                    }
                }
                Some(Ok(Event::Resize(..))) => view.mark_dirty(),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }
    }
    Ok(())
}

// ── Input ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextField {
    Type,
    Cause,
    Ioa,
    Search,
}

impl TextField {
    fn label(self) -> &'static str {
        match self {
            Self::Type => "type",
            Self::Cause => "cause",
            Self::Ioa => "ioa",
            Self::Search => "search",
        }
    }

    fn current(self, filter: &FilterState) -> String {
        let value = match self {
            Self::Type => &filter.type_id,
            Self::Cause => &filter.cause,
            Self::Ioa => &filter.ioa,
            Self::Search => &filter.free_text,
        };
        value.clone().unwrap_or_default()
    }

    fn patch(self, text: String) -> FilterPatch {
        let mut patch = FilterPatch::default();
        match self {
            Self::Type => patch.type_id = Some(text),
            Self::Cause => patch.cause = Some(text),
            Self::Ioa => patch.ioa = Some(text),
            Self::Search => patch.free_text = Some(text),
        }
        patch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Editing {
    field: TextField,
    text: String,
    /// Restored on Esc.
    original: String,
}

#[derive(Debug, Default)]
struct InputState {
    editing: Option<Editing>,
}

#[derive(Debug, PartialEq, Eq)]
enum Action {
    Continue,
    Quit,
}

fn handle_key(view: &mut StreamView, input: &mut InputState, key: KeyEvent) -> Action {
    if key.modifiers.contains(KeyModifiers::CONTROL) && key.code == KeyCode::Char('c') {
        return Action::Quit;
    }
    if let Some(mut editing) = input.editing.take() {
        match key.code {
            KeyCode::Enter => {
                view.set_prompt(None);
                return Action::Continue;
            }
            KeyCode::Esc => {
                view.set_filter(editing.field.patch(editing.original));
                view.set_prompt(None);
                return Action::Continue;
            }
            KeyCode::Backspace => {
                editing.text.pop();
            }
            KeyCode::Char(c) => editing.text.push(c),
            _ => {}
        }
        // Filters apply as you type
        view.set_filter(editing.field.patch(editing.text.clone()));
        view.set_prompt(Some(Prompt {
            label: editing.field.label(),
            input: editing.text.clone(),
        }));
        input.editing = Some(editing);
        return Action::Continue;
    }

    let filter = view.filter().clone();
    match key.code {
        KeyCode::Char('q') | KeyCode::Esc => return Action::Quit,
        KeyCode::Char('r') => {
            view.set_filter(FilterPatch {
                role: Some(cycle(filter.role, &Role::ALL)),
                ..Default::default()
            });
        }
        KeyCode::Char('d') => {
            view.set_filter(FilterPatch {
                direction: Some(cycle(filter.direction, &Direction::ALL)),
                ..Default::default()
            });
        }
        KeyCode::Char('t') => start_editing(view, input, TextField::Type),
        KeyCode::Char('c') => start_editing(view, input, TextField::Cause),
        KeyCode::Char('i') => start_editing(view, input, TextField::Ioa),
        KeyCode::Char('/') => start_editing(view, input, TextField::Search),
        KeyCode::Char('f') => {
            view.set_filter(FilterPatch {
                freeze: Some(!filter.freeze),
                ..Default::default()
            });
        }
        KeyCode::Char('x') if !view.is_empty() => view.clear(),
        KeyCode::Up => view.select_previous(),
        KeyCode::Down => view.select_next(),
        KeyCode::Enter => view.toggle_inspector(),
        _ => {}
    }
    Action::Continue
}

fn start_editing(view: &mut StreamView, input: &mut InputState, field: TextField) {
    let original = field.current(view.filter());
    view.set_prompt(Some(Prompt {
        label: field.label(),
        input: original.clone(),
    }));
    input.editing = Some(Editing {
        field,
        text: original.clone(),
        original,
    });
}

/// any → first → … → last → any
fn cycle<T: Copy + PartialEq>(current: Option<T>, all: &[T]) -> Option<T> {
    match current {
        None => all.first().copied(),
        Some(value) => all
            .iter()
            .position(|v| *v == value)
            .and_then(|i| all.get(i + 1))
            .copied(),
    }
}

// ── Rendering ──

const MUTED: Color = Color::DarkGray;
const ACCENT: Color = Color::Cyan;

fn draw(frame: &mut Frame, view: &ViewFrame, url: &str) {
    let layout = Layout::default()
        .direction(Axis::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Length(3),
            Constraint::Min(0),
            Constraint::Length(1),
        ])
        .split(frame.area());

    frame.render_widget(render_header(view, url), layout[0]);
    frame.render_widget(render_filter_bar(view), layout[1]);

    match view.selected_frame().filter(|_| view.inspector) {
        Some(selected) => {
            let body = Layout::default()
                .direction(Axis::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(layout[2]);
            render_frames(frame, view, body[0]);
            frame.render_widget(render_inspector(selected), body[1]);
        }
        None => render_frames(frame, view, layout[2]),
    }

    frame.render_widget(render_hints(view), layout[3]);
}

fn connection_style(state: ConnectionState) -> Style {
    let color = match state {
        ConnectionState::Connected => Color::Green,
        ConnectionState::Idle | ConnectionState::Connecting => Color::Yellow,
        ConnectionState::Disconnected => Color::Red,
        ConnectionState::Closed => MUTED,
    };
    Style::default().fg(color).add_modifier(Modifier::BOLD)
}

fn render_header<'a>(view: &ViewFrame, url: &'a str) -> Paragraph<'a> {
    let stats = &view.stats;
    let mut spans = vec![
        Span::styled(
            format!("● {}", view.connection.label().to_uppercase()),
            connection_style(view.connection),
        ),
        Span::raw("  "),
        Span::styled(url, Style::default().fg(MUTED)),
        Span::raw(format!(
            "  {}/{} buffered  {} received",
            view.buffered,
            view.capacity,
            stats.total_frames()
        )),
    ];
    for role in Role::ALL {
        spans.push(Span::raw(format!(
            "  {role} tx {} rx {}",
            stats.frames(role, Direction::Tx),
            stats.frames(role, Direction::Rx)
        )));
    }
    if stats.decode_errors > 0 {
        spans.push(Span::styled(
            format!("  decode errors {}", stats.decode_errors),
            Style::default().fg(Color::Red),
        ));
    }
    if stats.freeze_dropped + stats.queue_dropped > 0 {
        spans.push(Span::styled(
            format!(
                "  dropped {} frozen / {} queue",
                stats.freeze_dropped, stats.queue_dropped
            ),
            Style::default().fg(Color::Yellow),
        ));
    }
    if stats.reconnects > 0 {
        spans.push(Span::raw(format!("  reconnects {}", stats.reconnects)));
    }
    Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" framescope ")
            .border_style(Style::default().fg(ACCENT)),
    )
}

fn render_filter_bar(view: &ViewFrame) -> Paragraph<'static> {
    let filter = &view.filter;
    let mut spans = Vec::new();
    let mut field = |label: &'static str, value: Option<String>| {
        let editing = view.prompt.as_ref().filter(|p| p.label == label);
        let (text, style) = match editing {
            Some(prompt) => (
                format!("{}▏", prompt.input),
                Style::default().fg(Color::Black).bg(Color::Yellow),
            ),
            None => {
                let invalid = view.invalid_fields.contains(&label);
                let style = if invalid {
                    Style::default().fg(Color::Red).add_modifier(Modifier::BOLD)
                } else if value.is_some() {
                    Style::default().fg(ACCENT)
                } else {
                    Style::default().fg(MUTED)
                };
                (value.unwrap_or_else(|| "any".to_string()), style)
            }
        };
        spans.push(Span::raw(format!("{label}: ")));
        spans.push(Span::styled(text, style));
        spans.push(Span::raw("  "));
    };
    field("role", filter.role.map(|r| r.to_string()));
    field("dir", filter.direction.map(|d| d.to_string()));
    field("type", filter.type_id.clone());
    field("cause", filter.cause.clone());
    field("ioa", filter.ioa.clone());
    field("search", filter.free_text.clone());
    if filter.freeze {
        spans.push(Span::styled(
            "FROZEN",
            Style::default().fg(Color::Black).bg(Color::LightBlue),
        ));
    }
    Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL).title(" filter "))
}

fn role_style(frame: &FrameEvent) -> Style {
    match frame.role {
        Role::Client => Style::default().fg(Color::LightGreen),
        Role::Server => Style::default().fg(Color::LightMagenta),
    }
}

fn render_frames(f: &mut Frame, view: &ViewFrame, area: Rect) {
    let rows: Vec<Row> = view
        .frames
        .iter()
        .map(|frame| {
            Row::new(vec![
                Cell::from(format_time(frame)),
                Cell::from(Span::styled(
                    format!(
                        "{} {}",
                        frame.role.as_str().to_uppercase(),
                        frame.direction.as_str().to_uppercase()
                    ),
                    role_style(frame),
                )),
                Cell::from(apci_label(frame)),
                Cell::from(opt_num(frame.asdu.type_id)),
                Cell::from(opt_num(frame.asdu.cause)),
                Cell::from(opt_num(frame.asdu.ca)),
                Cell::from(ioa_label(frame)),
            ])
        })
        .collect();

    let widths = [
        Constraint::Length(12),
        Constraint::Length(9),
        Constraint::Length(12),
        Constraint::Length(4),
        Constraint::Length(4),
        Constraint::Length(6),
        Constraint::Min(8),
    ];
    let title = format!(" frames {} of {} ", view.frames.len(), view.buffered);
    let table = Table::new(rows, widths)
        .header(
            Row::new(vec!["TIME", "ROLE DIR", "APCI", "TI", "COT", "CA", "IOA"])
                .style(Style::default().add_modifier(Modifier::BOLD)),
        )
        .block(Block::default().borders(Borders::ALL).title(title))
        .row_highlight_style(Style::default().bg(Color::Rgb(40, 48, 72)));

    let mut state = TableState::default().with_selected(view.selected);
    f.render_stateful_widget(table, area, &mut state);
}

fn render_inspector(frame: &FrameEvent) -> Paragraph<'static> {
    let mut lines: Vec<Line> = Vec::new();
    let pretty = serde_json::to_string_pretty(frame.document())
        .unwrap_or_else(|_| frame.document().to_string());
    lines.extend(pretty.lines().map(|l| Line::from(l.to_string())));
    if let Some(raw) = &frame.raw_hex {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            "raw",
            Style::default().add_modifier(Modifier::BOLD),
        )));
        lines.extend(
            hex_rows(raw)
                .into_iter()
                .map(|row| Line::from(Span::styled(row, Style::default().fg(ACCENT)))),
        );
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title(" inspector "))
        .wrap(Wrap { trim: false })
}

/// Raw bytes as offset-prefixed rows of 16. Input that isn't hex is shown
/// as-is.
fn hex_rows(raw: &str) -> Vec<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    let Ok(bytes) = hex::decode(&compact) else {
        return vec![raw.to_string()];
    };
    bytes
        .chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let grouped: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            format!("{:04x}  {}", i * 16, grouped.join(" "))
        })
        .collect()
}

fn render_hints(view: &ViewFrame) -> Paragraph<'static> {
    let hint = if view.prompt.is_some() {
        "type to filter  Enter keep  Esc revert"
    } else {
        "q quit  r role  d dir  t type  c cause  i ioa  / search  f freeze  x clear  ↑↓ select  Enter inspect"
    };
    Paragraph::new(Span::styled(hint, Style::default().fg(MUTED)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::frame;
    use crate::transport::FrameBatch;
    use crate::view::ViewOptions;
    use ratatui::backend::TestBackend;
    use serde_json::json;

    fn press(view: &mut StreamView, input: &mut InputState, code: KeyCode) -> Action {
        handle_key(view, input, KeyEvent::new(code, KeyModifiers::NONE))
    }

    fn type_text(view: &mut StreamView, input: &mut InputState, text: &str) {
        for c in text.chars() {
            press(view, input, KeyCode::Char(c));
        }
    }

    fn loaded_view() -> StreamView {
        let mut view = StreamView::new(ViewOptions::default());
        view.ingest(&FrameBatch {
            frames: vec![
                Arc::new(frame("client", "tx", 45)),
                Arc::new(frame("client", "rx", 1)),
                Arc::new(frame("server", "tx", 1)),
            ],
            history: false,
        });
        view
    }

    fn screen_text(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn role_and_direction_keys_cycle_through_any() {
        let mut view = loaded_view();
        let mut input = InputState::default();
        press(&mut view, &mut input, KeyCode::Char('r'));
        assert_eq!(view.filter().role, Some(Role::Client));
        press(&mut view, &mut input, KeyCode::Char('r'));
        assert_eq!(view.filter().role, Some(Role::Server));
        press(&mut view, &mut input, KeyCode::Char('r'));
        assert_eq!(view.filter().role, None);

        press(&mut view, &mut input, KeyCode::Char('d'));
        press(&mut view, &mut input, KeyCode::Char('d'));
        assert_eq!(view.filter().direction, Some(Direction::Rx));
        assert_eq!(view.visible_frames().len(), 1);
    }

    #[test]
    fn editing_applies_live_and_esc_reverts() {
        let mut view = loaded_view();
        let mut input = InputState::default();

        press(&mut view, &mut input, KeyCode::Char('t'));
        type_text(&mut view, &mut input, "45");
        assert_eq!(view.filter().type_id.as_deref(), Some("45"));
        assert_eq!(view.visible_frames().len(), 1);
        assert_eq!(view.view_frame().prompt.map(|p| p.input), Some("45".to_string()));
        press(&mut view, &mut input, KeyCode::Enter);
        assert!(input.editing.is_none());
        assert!(view.view_frame().prompt.is_none());

        press(&mut view, &mut input, KeyCode::Char('t'));
        press(&mut view, &mut input, KeyCode::Backspace);
        press(&mut view, &mut input, KeyCode::Backspace);
        assert_eq!(view.filter().type_id, None);
        press(&mut view, &mut input, KeyCode::Esc);
        assert_eq!(view.filter().type_id.as_deref(), Some("45"));
    }

    #[test]
    fn letters_in_edit_mode_are_text_not_commands() {
        let mut view = loaded_view();
        let mut input = InputState::default();
        press(&mut view, &mut input, KeyCode::Char('/'));
        assert_eq!(press(&mut view, &mut input, KeyCode::Char('q')), Action::Continue);
        type_text(&mut view, &mut input, "xf");
        assert_eq!(view.filter().free_text.as_deref(), Some("qxf"));
        assert!(!view.filter().freeze);
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn freeze_clear_and_quit_keys() {
        let mut view = loaded_view();
        let mut input = InputState::default();
        press(&mut view, &mut input, KeyCode::Char('f'));
        assert!(view.filter().freeze);
        press(&mut view, &mut input, KeyCode::Char('x'));
        assert!(view.is_empty());
        assert_eq!(press(&mut view, &mut input, KeyCode::Char('q')), Action::Quit);
        assert_eq!(
            handle_key(
                &mut view,
                &mut input,
                KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)
            ),
            Action::Quit
        );
    }

    #[test]
    fn selection_and_inspector_keys() {
        let mut view = loaded_view();
        let mut input = InputState::default();
        press(&mut view, &mut input, KeyCode::Down);
        press(&mut view, &mut input, KeyCode::Down);
        press(&mut view, &mut input, KeyCode::Enter);
        let shown = view.view_frame();
        assert!(shown.inspector);
        assert_eq!(shown.selected_frame().map(|f| f.direction), Some(Direction::Rx));
    }

    #[test]
    fn cycle_wraps_to_none() {
        assert_eq!(cycle(None, &Role::ALL), Some(Role::Client));
        assert_eq!(cycle(Some(Role::Server), &Role::ALL), None);
    }

    #[test]
    fn hex_rows_group_sixteen_bytes() {
        let raw = "68 0e 02 00 02 00 2d 01 06 00 01 00 a1 0f 00 01 68 04";
        assert_eq!(
            hex_rows(raw),
            vec![
                "0000  68 0e 02 00 02 00 2d 01 06 00 01 00 a1 0f 00 01".to_string(),
                "0010  68 04".to_string(),
            ]
        );
        assert_eq!(hex_rows("680407000000"), vec!["0000  68 04 07 00 00 00"]);
        assert_eq!(hex_rows("not hex"), vec!["not hex"]);
    }

    #[test]
    fn draws_header_rows_and_inspector() {
        let mut view = loaded_view();
        view.on_connection(ConnectionState::Connected);
        view.ingest(&FrameBatch {
            frames: vec![Arc::new(
                FrameEvent::from_value(json!({
                    "role": "server", "dir": "rx", "ts": "2026-03-01T12:00:01Z",
                    "asdu": {"typeId": 36, "cause": 3, "ca": 1, "ioa": [7001, 7002]},
                    "raw": "68 04 43 00 00 00"
                }))
                .unwrap(),
            )],
            history: false,
        });
        view.select_next();
        view.toggle_inspector();

        let mut sink = TerminalSink {
            terminal: Terminal::new(TestBackend::new(160, 30)).unwrap(),
            url: "ws://gw/ws/live".to_string(),
        };
        sink.render(&view.view_frame()).unwrap();

        let text = screen_text(&sink.terminal);
        assert!(text.contains("CONNECTED"));
        assert!(text.contains("4/1000 buffered"));
        assert!(text.contains("SERVER RX"));
        assert!(text.contains("7001,7002"));
        assert!(text.contains("inspector"));
        assert!(text.contains("0000  68 04 43 00 00 00"));
    }

    #[test]
    fn invalid_numeric_filter_is_drawn_in_red() {
        let mut view = loaded_view();
        view.set_filter(FilterPatch {
            cause: Some("abc".into()),
            ..Default::default()
        });
        let mut terminal = Terminal::new(TestBackend::new(160, 20)).unwrap();
        let shown = view.view_frame();
        terminal.draw(|f| draw(f, &shown, "ws://gw/ws/live")).unwrap();

        let cells = terminal.backend().buffer().content();
        let at = cells
            .windows(3)
            .position(|w| w.iter().map(|c| c.symbol()).collect::<String>() == "abc")
            .unwrap();
        assert_eq!(cells[at].fg, Color::Red);
        assert!(screen_text(&terminal).contains("frames 0 of 3"));
    }
}
