use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::{BOOKINGS_CONFIRMED_TOTAL, BOOKINGS_DISPLACED_TOTAL};

use super::conflict::{check_no_confirmed_overlap, displaced_by, now_ms};
use super::pricing::compute_price;
use super::{audit, Engine, EngineError};

/// Immutable payment snapshot of `booking` at `price`, marked paid at `now`.
pub(super) fn build_payment(
    booking: &Booking,
    listing: &Listing,
    price: &PriceBreakdown,
    now: Ms,
) -> Payment {
    Payment {
        id: Ulid::new(),
        booking_id: booking.id,
        renter_id: booking.renter_id,
        host_id: listing.owner_id,
        listing_id: listing.id,
        base_rent: price.base_price,
        commission_rate: price.commission_rate,
        commission_amount: price.commission_amount,
        total_amount: price.total_price,
        is_paid: true,
        paid_at: Some(now),
        created_at: now,
    }
}

impl Engine {
    pub(super) fn ensure_unpaid(&self, booking_id: Ulid) -> Result<(), EngineError> {
        if self.payments.contains_key(&booking_id) {
            return Err(EngineError::AlreadyPaid(booking_id));
        }
        Ok(())
    }

    /// Record the payment for a pending booking, flip it to confirmed and
    /// cancel every overlapping pending booking, as one WAL transaction.
    /// The caller has already checked who may act.
    pub(super) async fn settle(
        &self,
        mut guard: OwnedRwLockWriteGuard<ListingState>,
        booking_id: Ulid,
        actor: Option<Ulid>,
    ) -> Result<ConfirmOutcome, EngineError> {
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        check_no_confirmed_overlap(&guard, &booking.stay, Some(booking_id))?;

        // Repriced from the listing as it is now, with the same table used at create.
        let listing = guard.listing.clone();
        let price = compute_price(
            &self.commission,
            listing.daily_price,
            booking.stay.start,
            booking.stay.end,
            &listing.city,
        )?;

        let now = now_ms();
        let payment = build_payment(&booking, &listing, &price, now);
        let displaced = displaced_by(&guard, &booking);

        let mut events = vec![
            Event::PaymentRecorded {
                payment: payment.clone(),
            },
            Event::BookingConfirmed {
                id: booking_id,
                listing_id: listing.id,
                price,
                at: now,
            },
            audit::log_event(
                &booking,
                actor,
                LogAction::Update,
                audit::confirmed(price.total_price),
                now,
            ),
        ];
        for loser_id in &displaced {
            if let Some(loser) = guard.booking(*loser_id) {
                events.push(Event::BookingCancelled {
                    id: loser.id,
                    listing_id: listing.id,
                    at: now,
                });
                events.push(audit::log_event(
                    loser,
                    actor,
                    LogAction::Cancel,
                    audit::displaced(booking_id),
                    now,
                ));
            }
        }

        self.commit(&mut guard, events).await?;

        let mut notifications = Vec::with_capacity(displaced.len() + 1);
        for loser_id in &displaced {
            if let Some(loser) = guard.booking(*loser_id) {
                notifications.push(Notification::render(
                    NotificationKind::RenterDeclined,
                    loser,
                    &guard.listing,
                ));
            }
        }
        let confirmed = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let notice =
            Notification::render(NotificationKind::RenterConfirmed, &confirmed, &guard.listing);
        let advisory = Some(notice.text.clone());
        notifications.push(notice);
        drop(guard);

        metrics::counter!(BOOKINGS_CONFIRMED_TOTAL).increment(1);
        metrics::counter!(BOOKINGS_DISPLACED_TOTAL).increment(displaced.len() as u64);
        info!(
            booking = %booking_id,
            listing = %listing.id,
            total = %payment.total_amount,
            displaced = displaced.len(),
            "booking confirmed"
        );
        self.notify_all(notifications);

        Ok(ConfirmOutcome {
            booking: confirmed,
            payment,
            displaced,
            advisory,
        })
    }

    /// Payment recorder entry point for system callers. No actor check.
    pub async fn record_payment(&self, booking_id: Ulid) -> Result<ConfirmOutcome, EngineError> {
        let guard = self.resolve_booking_write(&booking_id).await?;
        self.ensure_unpaid(booking_id)?;
        let status = guard
            .booking(booking_id)
            .map(|b| b.status)
            .ok_or(EngineError::NotFound(booking_id))?;
        if status != BookingStatus::Pending {
            return Err(EngineError::InvalidState {
                id: booking_id,
                status,
            });
        }
        self.settle(guard, booking_id, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn payment_mirrors_price() {
        let listing = Listing {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            daily_price: Some(dec!(120)),
            city: "Hamburg".into(),
            is_active: true,
        };
        let price = PriceBreakdown {
            base_price: dec!(360),
            commission_rate: dec!(0.20),
            commission_amount: dec!(72),
            total_price: dec!(432),
        };
        let booking = Booking {
            id: Ulid::new(),
            renter_id: Ulid::new(),
            listing_id: listing.id,
            stay: DateRange::new(
                "2025-06-01".parse().unwrap(),
                "2025-06-04".parse().unwrap(),
            ),
            status: BookingStatus::Pending,
            price,
            message: None,
            created_at: 1,
            updated_at: 1,
        };

        let p = build_payment(&booking, &listing, &price, 42);
        assert_eq!(p.booking_id, booking.id);
        assert_eq!(p.renter_id, booking.renter_id);
        assert_eq!(p.host_id, listing.owner_id);
        assert_eq!(p.base_rent, dec!(360));
        assert_eq!(p.commission_amount, dec!(72));
        assert_eq!(p.total_amount, dec!(432));
        assert!(p.is_paid);
        assert_eq!(p.paid_at, Some(42));
    }
}
