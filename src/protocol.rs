use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

/// Message kinds that carry a sequence of frames instead of a single one.
const BATCH_KINDS: &[&str] = &["history", "frames", "batch"];
/// Keys searched (in order) for the frame array of a batch message.
const BATCH_KEYS: &[&str] = &["frames", "events", "items"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid frame: {0}")]
    Frame(serde_json::Error),
    #[error("unexpected message shape: {0}")]
    Shape(String),
}

#[derive(Debug, Error)]
#[error("unknown {field} `{value}`")]
pub struct UnknownVariant {
    field: &'static str,
    value: String,
}

/// Which side of the monitored link the frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Client, Role::Server];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            _ => Err(UnknownVariant {
                field: "role",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Tx,
    Rx,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Tx, Direction::Rx];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tx => "tx",
            Self::Rx => "rx",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tx" => Ok(Self::Tx),
            "rx" => Ok(Self::Rx),
            _ => Err(UnknownVariant {
                field: "direction",
                value: s.to_string(),
            }),
        }
    }
}

// ── Frame events (server → client) ──

/// Information object addresses carried by an ASDU. The wire shape is an
/// integer, null, or an array of integers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoaSet {
    values: Vec<i64>,
    joined: String,
}

impl IoaSet {
    fn new(values: Vec<i64>) -> Self {
        let joined = values
            .iter()
            .map(|ioa| ioa.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self { values, joined }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Comma-joined decimal addresses, the form IOA filters match against.
    /// Built once at decode time.
    pub fn joined(&self) -> &str {
        &self.joined
    }
}

impl<'de> Deserialize<'de> for IoaSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        let ioas = match value {
            Some(Value::Array(items)) => items.iter().filter_map(value_as_int).collect(),
            Some(ref single) => value_as_int(single).into_iter().collect(),
            None => Vec::new(),
        };
        Ok(Self::new(ioas))
    }
}

/// Application data summary. Every field is optional: a frame with a
/// missing type or cause simply never matches a filter on it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Asdu {
    #[serde(rename = "typeId", alias = "ti", default, deserialize_with = "lenient_int")]
    pub type_id: Option<i64>,
    #[serde(alias = "cot", default, deserialize_with = "lenient_int")]
    pub cause: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub ca: Option<i64>,
    #[serde(alias = "ioas", default)]
    pub ioa: IoaSet,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Deserialize)]
struct WireFrame {
    role: Role,
    #[serde(alias = "direction")]
    dir: Direction,
    #[serde(alias = "timestamp", default, deserialize_with = "lenient_string")]
    ts: String,
    #[serde(default)]
    apci: Value,
    #[serde(default)]
    asdu: Option<Asdu>,
    /// Older servers put the ASDU summary under `decoded`.
    #[serde(default)]
    decoded: Option<Asdu>,
    #[serde(alias = "rawHex", default, deserialize_with = "lenient_opt_string")]
    raw: Option<String>,
}

/// A single decoded protocol frame. Immutable once received and shared
/// between subscribers behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameEvent {
    pub timestamp: String,
    pub role: Role,
    pub direction: Direction,
    /// Control-field summary, passed through untouched.
    pub apci: Value,
    pub asdu: Asdu,
    pub raw_hex: Option<String>,
    document: Value,
    search_text: String,
}

impl FrameEvent {
    pub fn from_value(document: Value) -> Result<Self, DecodeError> {
        let wire = WireFrame::deserialize(&document).map_err(DecodeError::Frame)?;
        let search_text = document.to_string().to_lowercase();
        Ok(Self {
            timestamp: wire.ts,
            role: wire.role,
            direction: wire.dir,
            apci: wire.apci,
            asdu: wire.asdu.or(wire.decoded).unwrap_or_default(),
            raw_hex: wire.raw,
            document,
            search_text,
        })
    }

    /// The JSON object exactly as received.
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Lower-cased serialization of the whole event, computed once.
    pub fn search_text(&self) -> &str {
        &self.search_text
    }

    pub fn received_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// APCI frame format (`I`, `S` or `U`) when the server reports it.
    pub fn apci_type(&self) -> Option<&str> {
        self.apci.get("type").and_then(|v| v.as_str())
    }

    pub fn apci_sequence(&self) -> Option<(i64, i64)> {
        let vs = self.apci.get("vs").and_then(value_as_int)?;
        let vr = self.apci.get("vr").and_then(value_as_int)?;
        Some((vs, vr))
    }
}

/// What a single inbound message normalizes to.
#[derive(Debug)]
pub enum Inbound {
    /// One or more frames in arrival order. `rejected` counts batch entries
    /// that failed to decode and were skipped; `history` marks a reply to a
    /// history request.
    Frames {
        frames: Vec<FrameEvent>,
        rejected: usize,
        history: bool,
    },
    /// Any other tagged message (status, pong, ...).
    Control { kind: String },
}

/// Decode one WebSocket text message. Single frames and batches both come
/// out as `Inbound::Frames`.
pub fn decode_message(text: &str) -> Result<Inbound, DecodeError> {
    let value: Value = serde_json::from_str(text)?;
    match value {
        Value::Array(items) => Ok(decode_batch(items, false)),
        Value::Object(mut map) => {
            let kind = map
                .get("kind")
                .and_then(|k| k.as_str())
                .unwrap_or("frame")
                .to_string();
            if BATCH_KINDS.contains(&kind.as_str()) {
                let Some(Value::Array(items)) = BATCH_KEYS
                    .iter()
                    .find_map(|key| map.remove(*key).filter(Value::is_array))
                else {
                    return Err(DecodeError::Shape(format!(
                        "`{kind}` message without a frame array"
                    )));
                };
                return Ok(decode_batch(items, kind == "history"));
            }
            if kind == "frame" || kind.ends_with(".frame") {
                let frame = FrameEvent::from_value(Value::Object(map))?;
                return Ok(Inbound::Frames {
                    frames: vec![frame],
                    rejected: 0,
                    history: false,
                });
            }
            Ok(Inbound::Control { kind })
        }
        other => Err(DecodeError::Shape(format!(
            "expected object or array, got {}",
            json_type_name(&other)
        ))),
    }
}

fn decode_batch(items: Vec<Value>, history: bool) -> Inbound {
    let mut frames = Vec::with_capacity(items.len());
    let mut rejected = 0;
    for item in items {
        match FrameEvent::from_value(item) {
            Ok(frame) => frames.push(frame),
            Err(e) => {
                warn!("Skipping batch entry: {e}");
                rejected += 1;
            }
        }
    }
    Inbound::Frames {
        frames,
        rejected,
        history,
    }
}

// ── Outbound messages (client → server) ──

/// Flat mirror of the filter state, sent best-effort so the server may
/// pre-filter. Only non-empty fields are serialized.
/// Keys are the ones the stream server's `filters` handler reads:
/// `role direction ti cot ioa text`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FilterUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(rename = "ti", skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    #[serde(rename = "cot", skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ioa: Option<String>,
    #[serde(rename = "text", skip_serializing_if = "Option::is_none")]
    pub free_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundMessage {
    Filters(FilterUpdate),
    History { limit: usize },
}

impl OutboundMessage {
    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ── Lenient field helpers ──

fn value_as_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(value_as_int))
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

fn lenient_opt_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    })
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
