use ulid::Ulid;

use crate::model::*;

/// Build the `LogAppended` event for an action on `booking`. The entry
/// carries its own copy of the listing and stay.
pub(super) fn log_event(
    booking: &Booking,
    actor_id: Option<Ulid>,
    action: LogAction,
    description: impl Into<String>,
    at: Ms,
) -> Event {
    Event::LogAppended {
        entry: BookingLog {
            id: Ulid::new(),
            booking_id: booking.id,
            listing_id: booking.listing_id,
            stay: booking.stay,
            actor_id,
            action,
            description: description.into(),
            at,
        },
    }
}

pub(super) fn created(booking: &Booking) -> String {
    format!(
        "Booking created for {} to {} ({} nights). Total: {} EUR",
        booking.stay.start,
        booking.stay.end,
        booking.stay.nights(),
        booking.price.total_price
    )
}

pub(super) fn confirmed(total: rust_decimal::Decimal) -> String {
    format!("Booking confirmed and payment recorded. Total: {total} EUR")
}

pub(super) fn displaced(winner: Ulid) -> String {
    format!("Booking cancelled: dates taken by confirmed booking {winner}")
}

pub(super) const CANCELLED_BY_HOST: &str = "Booking cancelled by host";
pub(super) const CANCELLED_BY_STAFF: &str = "Booking cancelled by staff";

pub(super) fn withdrawn(
    previous: BookingStatus,
    withheld: Option<rust_decimal::Decimal>,
) -> String {
    match withheld {
        Some(amount) => format!(
            "Booking withdrawn by renter ({previous}). Commission of {amount} EUR withheld"
        ),
        None => format!("Booking withdrawn by renter ({previous})"),
    }
}

pub(super) fn deleted_by_staff(previous: BookingStatus) -> String {
    format!("Booking deleted by staff ({previous})")
}
