use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// `end <= start`, or a window before the current local day.
    InvalidRange { start: Ms, end: Ms, reason: &'static str },
    /// Overlaps the given active reservation.
    Conflict(Ulid),
    NotFound(Ulid),
    /// Actor may not touch this reservation.
    Forbidden(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    Journal(String),
}

impl EngineError {
    pub(crate) fn invalid_range(start: Ms, end: Ms, reason: &'static str) -> Self {
        EngineError::InvalidRange { start, end, reason }
    }

    /// Expected, user-actionable outcomes as opposed to internal failures.
    pub fn is_user_error(&self) -> bool {
        !matches!(self, EngineError::Journal(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange { start, end, reason } => {
                write!(f, "invalid range [{start}, {end}): {reason}")
            }
            EngineError::Conflict(id) => write!(f, "conflict with reservation: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(id) => write!(f, "not allowed to modify reservation: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

