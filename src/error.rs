use std::time::Duration;

use crate::journal::JournalError;

/// Rejection of an administrator configuration write. Never raised at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    UnknownTimezone(String),
    InvalidHour(u32),
    UnknownJobKind(String),
    UnknownFrequency(String),
    InvalidRecipient(String),
    /// A report schedule with nobody to mail it to.
    MissingRecipients(&'static str),
    MissingTemplate,
    UnknownTemplate(String),
    LimitExceeded(&'static str),
    Journal(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::UnknownTimezone(tz) => write!(f, "unknown timezone: {tz}"),
            ConfigError::InvalidHour(h) => write!(f, "hour must be 0-23, got {h}"),
            ConfigError::UnknownJobKind(k) => write!(f, "unknown job kind: {k}"),
            ConfigError::UnknownFrequency(s) => write!(f, "unknown frequency: {s}"),
            ConfigError::InvalidRecipient(r) => write!(f, "invalid recipient address: {r}"),
            ConfigError::MissingRecipients(kind) => write!(f, "{kind} needs at least one recipient"),
            ConfigError::MissingTemplate => write!(f, "dynamic_report needs a template"),
            ConfigError::UnknownTemplate(t) => write!(f, "unknown report template: {t}"),
            ConfigError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            ConfigError::Journal(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<JournalError> for ConfigError {
    fn from(e: JournalError) -> Self {
        ConfigError::Journal(e.0)
    }
}

/// Failure of an external action during a dispatcher firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    Mail(String),
    Render(String),
    Upload { size: usize, error: String },
    Snapshot(String),
    TimedOut(Duration),
    /// The action's task panicked or was cancelled.
    Aborted(String),
    NotConfigured(&'static str),
}

impl std::fmt::Display for ActionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionError::Mail(e) => write!(f, "mail delivery failed: {e}"),
            ActionError::Render(e) => write!(f, "report rendering failed: {e}"),
            ActionError::Upload { size, error } => {
                write!(f, "backup upload of {size} bytes failed: {error}")
            }
            ActionError::Snapshot(e) => write!(f, "snapshot failed: {e}"),
            ActionError::TimedOut(d) => write!(f, "timed out after {}s", d.as_secs()),
            ActionError::Aborted(e) => write!(f, "action aborted: {e}"),
            ActionError::NotConfigured(what) => write!(f, "not configured: {what}"),
        }
    }
}

impl std::error::Error for ActionError {}
