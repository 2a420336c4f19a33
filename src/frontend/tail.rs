use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::context::StreamContext;
use crate::filter::{self, FilterState};
use crate::protocol::{FrameEvent, OutboundMessage};
use crate::transport::ConnectionState;
use crate::view::FrameFeed;

use super::{Frontend, QUEUE_DEPTH, apci_label, format_time, ioa_label, opt_num};

/// Prints matching frames to stdout as they arrive, one line each.
pub struct TailFrontend {
    pub filter: FilterState,
    /// Print the frame document as received instead of a summary line.
    pub json: bool,
    /// Exit after this many printed frames.
    pub limit: Option<usize>,
}

#[async_trait::async_trait]
impl Frontend for TailFrontend {
    async fn run(self: Box<Self>, ctx: Arc<StreamContext>) -> Result<()> {
        let mut out = std::io::stdout();
        let printed = self.pump(&ctx, &mut out).await?;
        info!("tail finished after {printed} frames");
        Ok(())
    }
}

impl TailFrontend {
    /// Stream matching frames into `out` until Ctrl-C, the limit, or the
    /// connection is closed. Returns how many frames were written.
    async fn pump<W: Write + Send>(&self, ctx: &StreamContext, out: &mut W) -> Result<usize> {
        let client = ctx.client();
        let mut feed = FrameFeed::subscribe(client, QUEUE_DEPTH);
        let mut state_rx = client.watch_state();
        // Report the current state on the first pass too
        state_rx.mark_changed();

        // Stored by the client and sent on every connect
        if ctx.config().stream.send_filters && !self.filter.is_pass_through() {
            client.send(OutboundMessage::Filters(self.filter.to_update()));
        }

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        let mut printed = 0usize;
        let mut history_seen = false;
        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    debug!("Interrupted");
                    break;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *state_rx.borrow_and_update();
                    eprintln!("-- {state}");
                    if state == ConnectionState::Closed {
                        break;
                    }
                }
                batch = feed.recv() => {
                    let Some(batch) = batch else { break };
                    // History repeats on every reconnect; only the first is new
                    if batch.history && std::mem::replace(&mut history_seen, true) {
                        continue;
                    }
                    for frame in batch.frames.iter().filter(|f| filter::matches(f, &self.filter)) {
                        if self.json {
                            writeln!(out, "{}", frame.document())?;
                        } else {
                            writeln!(out, "{}", format_line(frame))?;
                        }
                        printed += 1;
                        if self.limit.is_some_and(|limit| printed >= limit) {
                            out.flush()?;
                            return Ok(printed);
                        }
                    }
                    out.flush()?;
                    let dropped = feed.take_dropped();
                    if dropped > 0 {
                        eprintln!("-- {dropped} frames dropped, output too slow");
                    }
                }
            }
        }
        Ok(printed)
    }
}

/// `time ROLE DIR apci TI=.. COT=.. CA=.. IOA=.. [raw]`
pub fn format_line(frame: &FrameEvent) -> String {
    let mut line = format!(
        "{} {:<6} {:<2} {:<10} TI={} COT={} CA={} IOA={}",
        format_time(frame),
        frame.role.as_str().to_uppercase(),
        frame.direction.as_str().to_uppercase(),
        apci_label(frame),
        opt_num(frame.asdu.type_id),
        opt_num(frame.asdu.cause),
        opt_num(frame.asdu.ca),
        ioa_label(frame),
    );
    if let Some(raw) = &frame.raw_hex {
        line.push_str("  ");
        line.push_str(raw);
    }
    line
}
