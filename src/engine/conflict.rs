use crate::limits::*;
use crate::model::*;

use super::availability::conflicts;
use super::EngineError;

pub fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Validate a requested window against range rules and the past-date policy.
/// Runs before any state is touched.
pub(crate) fn validate_window(start: Ms, end: Ms, day_start: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::invalid_range(start, end, "end must be after start"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    if start < day_start {
        return Err(EngineError::invalid_range(start, end, "window starts before the current day"));
    }
    Ok(span)
}

/// Caller must hold the resource's write lock for this check to mean anything.
pub(crate) fn check_no_conflict(rs: &ResourceState, span: &Span) -> Result<(), EngineError> {
    match conflicts(rs, span) {
        Some(existing) => Err(EngineError::Conflict(existing)),
        None => Ok(()),
    }
}
