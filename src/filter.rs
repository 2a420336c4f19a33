use std::sync::Arc;

use crate::protocol::{Direction, FilterUpdate, FrameEvent, Role};

/// User-editable filter. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterState {
    pub role: Option<Role>,
    pub direction: Option<Direction>,
    /// Raw text input, parsed as an integer at match time.
    pub type_id: Option<String>,
    pub cause: Option<String>,
    /// Substring of the comma-joined IOA list.
    pub ioa: Option<String>,
    pub free_text: Option<String>,
    /// Drop new arrivals instead of appending them.
    pub freeze: bool,
}

/// Partial update. `None` leaves a field alone; for the text fields an
/// empty string clears it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterPatch {
    pub role: Option<Option<Role>>,
    pub direction: Option<Option<Direction>>,
    pub type_id: Option<String>,
    pub cause: Option<String>,
    pub ioa: Option<String>,
    pub free_text: Option<String>,
    pub freeze: Option<bool>,
}

impl FilterState {
    /// Apply a patch. Returns true if anything changed.
    pub fn apply(&mut self, patch: FilterPatch) -> bool {
        let before = self.clone();
        if let Some(role) = patch.role {
            self.role = role;
        }
        if let Some(direction) = patch.direction {
            self.direction = direction;
        }
        if let Some(type_id) = patch.type_id {
            self.type_id = non_blank(type_id);
        }
        if let Some(cause) = patch.cause {
            self.cause = non_blank(cause);
        }
        if let Some(ioa) = patch.ioa {
            self.ioa = non_blank(ioa);
        }
        if let Some(free_text) = patch.free_text {
            self.free_text = non_blank(free_text);
        }
        if let Some(freeze) = patch.freeze {
            self.freeze = freeze;
        }
        *self != before
    }

    /// True when no predicate is set (freeze does not filter).
    pub fn is_pass_through(&self) -> bool {
        self.role.is_none()
            && self.direction.is_none()
            && set(&self.type_id).is_none()
            && set(&self.cause).is_none()
            && set(&self.ioa).is_none()
            && set(&self.free_text).is_none()
    }

    /// Names of numeric fields whose input can never match.
    pub fn invalid_numeric_fields(&self) -> Vec<&'static str> {
        let mut invalid = Vec::new();
        if set(&self.type_id).is_some_and(|v| parse_numeric(v).is_none()) {
            invalid.push("type");
        }
        if set(&self.cause).is_some_and(|v| parse_numeric(v).is_none()) {
            invalid.push("cause");
        }
        invalid
    }

    /// The outbound mirror of this state.
    pub fn to_update(&self) -> FilterUpdate {
        FilterUpdate {
            role: self.role,
            direction: self.direction,
            type_id: set(&self.type_id).map(str::to_string),
            cause: set(&self.cause).map(str::to_string),
            ioa: set(&self.ioa).map(str::to_string),
            free_text: set(&self.free_text).map(str::to_string),
        }
    }
}

/// Does `event` pass every set predicate of `filter`?
pub fn matches(event: &FrameEvent, filter: &FilterState) -> bool {
    CompiledFilter::new(filter).matches(event)
}

/// Matching frames from `snapshot`, most recent first, at most `limit`.
pub fn visible(
    snapshot: &[Arc<FrameEvent>],
    filter: &FilterState,
    limit: usize,
) -> Vec<Arc<FrameEvent>> {
    let compiled = CompiledFilter::new(filter);
    snapshot
        .iter()
        .rev()
        .filter(|event| compiled.matches(event))
        .take(limit)
        .cloned()
        .collect()
}

/// Numeric and case-folded inputs resolved once per render pass.
struct CompiledFilter<'a> {
    role: Option<Role>,
    direction: Option<Direction>,
    type_id: NumericInput,
    cause: NumericInput,
    ioa: Option<&'a str>,
    free_text: Option<String>,
}

enum NumericInput {
    Unset,
    Value(i64),
    Invalid,
}

impl NumericInput {
    fn from_input(input: Option<&str>) -> Self {
        match input {
            None => Self::Unset,
            Some(raw) => parse_numeric(raw).map_or(Self::Invalid, Self::Value),
        }
    }

    fn matches(&self, field: Option<i64>) -> bool {
        match self {
            Self::Unset => true,
            Self::Value(wanted) => field == Some(*wanted),
            Self::Invalid => false,
        }
    }
}

impl<'a> CompiledFilter<'a> {
    fn new(filter: &'a FilterState) -> Self {
        Self {
            role: filter.role,
            direction: filter.direction,
            type_id: NumericInput::from_input(set(&filter.type_id)),
            cause: NumericInput::from_input(set(&filter.cause)),
            ioa: set(&filter.ioa),
            free_text: set(&filter.free_text).map(str::to_lowercase),
        }
    }

    fn matches(&self, event: &FrameEvent) -> bool {
        if self.role.is_some_and(|role| event.role != role) {
            return false;
        }
        if self.direction.is_some_and(|dir| event.direction != dir) {
            return false;
        }
        if !self.type_id.matches(event.asdu.type_id) {
            return false;
        }
        if !self.cause.matches(event.asdu.cause) {
            return false;
        }
        if let Some(needle) = self.ioa {
            if !event.asdu.ioa.joined().contains(needle) {
                return false;
            }
        }
        if let Some(needle) = &self.free_text {
            if !event.search_text().contains(needle.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Integers, or floats with no fractional part ("45.0").
fn parse_numeric(input: &str) -> Option<i64> {
    let trimmed = input.trim();
    trimmed.parse::<i64>().ok().or_else(|| {
        trimmed
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite() && f.fract() == 0.0)
            .map(|f| f as i64)
    })
}

/// A text field counts as set only when it holds something besides
/// whitespace.
fn set(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|v| !v.trim().is_empty())
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
