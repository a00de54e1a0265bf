use crate::model::Ms;

pub const MAX_RESOURCES: usize = 100_000;
pub const MAX_RESERVATIONS_PER_RESOURCE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_LABEL_LEN: usize = 128;
pub const MAX_OWNER_LEN: usize = 256;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single reservation may not exceed 90 days.
pub const MAX_SPAN_DURATION_MS: Ms = 90 * 24 * 3_600_000;
/// Availability / report windows may not exceed ~1 year.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_RECIPIENTS: usize = 50;
pub const MAX_TEMPLATE_LEN: usize = 128;
pub const MAX_SETTING_VALUE_LEN: usize = 1024;
