use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

/// Range for a read. Any length is fine; sold listings conflict with all of it.
pub(crate) fn query_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    if end < start {
        return Err(EngineError::Validation("end date is before start date"));
    }
    Ok(DateRange::new(start, end))
}

/// Range for a booking or blackout, capped at `MAX_RANGE_DAYS`.
pub(crate) fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    let range = query_range(start, end)?;
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too long"));
    }
    Ok(range)
}

pub(crate) fn validate_text(
    text: &Option<String>,
    max_len: usize,
    what: &'static str,
) -> Result<(), EngineError> {
    match text {
        Some(t) if t.len() > max_len => Err(EngineError::LimitExceeded(what)),
        _ => Ok(()),
    }
}

/// Fails with `Conflict` if an unavailable block overlaps `range`.
pub(crate) fn check_no_conflict(ls: &ListingState, range: &DateRange) -> Result<(), EngineError> {
    match ls.blocking_conflict(range) {
        Some(block) => {
            metrics::counter!(crate::observability::CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(block.id))
        }
        None => Ok(()),
    }
}

/// Availability conflict for one listing: sold/rented listings conflict
/// with every range, rentable ones only where an unavailable block overlaps.
pub fn listing_conflict(ls: &ListingState, range: &DateRange) -> bool {
    let listing = &ls.listing;
    listing.status.is_unavailable()
        || (listing.listing_type.supports_rental() && ls.blocking_conflict(range).is_some())
}
