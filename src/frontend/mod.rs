pub mod tail;
pub mod tui;

use std::sync::Arc;

use anyhow::Result;

use crate::context::StreamContext;
use crate::protocol::FrameEvent;

/// Per-view depth of the socket → view queue. A burst beyond this is dropped
/// and counted rather than stalling the socket task.
pub const QUEUE_DEPTH: usize = 256;

/// A frontend presents the live stream owned by a StreamContext.
#[async_trait::async_trait]
pub trait Frontend: Send + 'static {
    async fn run(self: Box<Self>, ctx: Arc<StreamContext>) -> Result<()>;
}

/// Local wall-clock time of a frame, falling back to the raw timestamp.
pub fn format_time(frame: &FrameEvent) -> String {
    match frame.received_at() {
        Some(at) => at
            .with_timezone(&chrono::Local)
            .format("%H:%M:%S%.3f")
            .to_string(),
        None if frame.timestamp.is_empty() => "-".to_string(),
        None => frame.timestamp.clone(),
    }
}

/// `I(3/7)`, `S`, `U` … or `-` when the frame carries no APCI summary.
pub fn apci_label(frame: &FrameEvent) -> String {
    match (frame.apci_type(), frame.apci_sequence()) {
        (Some(kind), Some((vs, vr))) => format!("{kind}({vs}/{vr})"),
        (Some(kind), None) => kind.to_string(),
        (None, _) => "-".to_string(),
    }
}

pub fn opt_num(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

pub fn ioa_label(frame: &FrameEvent) -> String {
    if frame.asdu.ioa.is_empty() {
        "-".to_string()
    } else {
        frame.asdu.ioa.joined().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::tests::frame;
    use serde_json::json;

    #[test]
    fn labels_for_a_full_frame() {
        let f = frame("client", "tx", 45);
        assert_eq!(apci_label(&f), "I(3/7)");
        assert_eq!(ioa_label(&f), "4001");
        assert_eq!(opt_num(f.asdu.type_id), "45");
        assert_eq!(format_time(&f).len(), "12:00:00.000".len());
    }

    #[test]
    fn labels_for_a_bare_frame() {
        let f = FrameEvent::from_value(json!({"role":"server","dir":"rx","ts":"yesterday"})).unwrap();
        assert_eq!(apci_label(&f), "-");
        assert_eq!(ioa_label(&f), "-");
        assert_eq!(opt_num(f.asdu.cause), "-");
        assert_eq!(format_time(&f), "yesterday");
    }
}
