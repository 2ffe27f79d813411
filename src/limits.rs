use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

pub const MAX_NOTES_LEN: usize = 4096;

/// Longest `submit_with_delay` deferral accepted (30 days).
pub const MAX_SUBMIT_DELAY_MS: Ms = 30 * 24 * 3_600_000;

pub const MAX_BOOKINGS_PER_PRACTITIONER: usize = 100_000;
