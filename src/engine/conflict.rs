use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// Check a requested stay and turn it into a `DateRange`.
pub(crate) fn validate_stay(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    use crate::limits::*;
    if end <= start {
        return Err(EngineError::InvalidDateRange { start, end });
    }
    if start < MIN_VALID_DATE || end > MAX_VALID_DATE {
        return Err(EngineError::LimitExceeded("date out of range"));
    }
    let stay = DateRange::new(start, end);
    if stay.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::LimitExceeded("stay too long"));
    }
    Ok(stay)
}

/// Bookings on the listing whose stay overlaps `stay`, restricted to
/// `statuses`, optionally skipping one booking.
pub fn find_overlapping<'a>(
    ls: &'a ListingState,
    stay: &DateRange,
    statuses: &[BookingStatus],
    exclude: Option<Ulid>,
) -> Vec<&'a Booking> {
    ls.overlapping(stay)
        .filter(|b| statuses.contains(&b.status))
        .filter(|b| Some(b.id) != exclude)
        .collect()
}

/// Pending bookings never block a new request; only confirmed ones do.
pub(crate) fn check_no_confirmed_overlap(
    ls: &ListingState,
    stay: &DateRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_overlapping(ls, stay, &[BookingStatus::Confirmed], exclude).first() {
        Some(existing) => Err(EngineError::Overlap(existing.id)),
        None => Ok(()),
    }
}

/// Pending bookings that lose to `winner` once it is confirmed.
/// Displaced bookings never become confirmed, so this does not cascade.
pub(crate) fn displaced_by(ls: &ListingState, winner: &Booking) -> Vec<Ulid> {
    find_overlapping(ls, &winner.stay, &[BookingStatus::Pending], Some(winner.id))
        .into_iter()
        .map(|b| b.id)
        .collect()
}
