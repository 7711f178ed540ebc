use crate::model::{HOUR_MS, Ms};

/// Owner response window for a submitted request.
pub const RESPONSE_WINDOW_MS: Ms = 48 * HOUR_MS;

pub const MAX_LISTINGS: usize = 1_000_000;
pub const MAX_BLOCKS_PER_LISTING: usize = 10_000;
pub const MAX_REQUESTS_PER_LISTING: usize = 10_000;

/// Longest bookable or blockable range, in days.
pub const MAX_RANGE_DAYS: i64 = 366;

pub const MAX_REASON_LEN: usize = 500;
pub const MAX_RESPONSE_LEN: usize = 2_000;
pub const MAX_GUEST_NAME_LEN: usize = 200;
pub const MAX_PHONE_LEN: usize = 32;
pub const MIN_CANCEL_TOKEN_LEN: usize = 16;
pub const MAX_CANCEL_TOKEN_LEN: usize = 128;

/// Upper bound on ids in a batch conflict query.
pub const MAX_IN_CLAUSE_IDS: usize = 500;

/// Fixed throttle window for submissions.
pub const SUBMIT_WINDOW_MS: Ms = HOUR_MS;
