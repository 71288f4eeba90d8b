use crate::model::{DAY_MS, Ms};

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single reservation (time-off included).
pub const MAX_SPAN_DURATION_MS: Ms = 31 * DAY_MS;

pub const MAX_TUTORS: usize = 10_000;
pub const MAX_RECORDS_PER_TUTOR: usize = 100_000;
pub const MAX_GROUP_SIZE: u32 = 500;
pub const MAX_CREDITS_PER_PAYMENT: u32 = 1_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_TEXT_LEN: usize = 1_024;
pub const MAX_USER_ID_LEN: usize = 256;
pub const MAX_PAYMENT_ID_LEN: usize = 256;

/// |offset| for a tutor's calendar day, in minutes.
pub const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;
