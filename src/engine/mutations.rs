use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};
use crate::observability::{
    BOOKINGS_CANCELLED_TOTAL, BOOKINGS_CREATED_TOTAL, BOOKINGS_DELETED_TOTAL,
};

use super::conflict::{check_no_confirmed_overlap, now_ms, today, validate_stay};
use super::pricing::compute_price;
use super::{audit, Engine, EngineError, WalCommand};

/// Days of notice a renter must give to withdraw from a confirmed booking.
pub const WITHDRAW_NOTICE_DAYS: i64 = 3;

const COMPACT_ATTEMPTS: u64 = 5;

/// Owner of the listing, or staff.
fn may_manage(user: &UserInfo, listing: &Listing) -> bool {
    user.is_staff || listing.owner_id == user.id
}

impl Engine {
    // ── Collaborator sync ────────────────────────────────────

    fn authorize_sync(&self, actor: Ulid) -> Result<(), EngineError> {
        if actor == SYSTEM_ACTOR || self.user(actor).is_staff {
            Ok(())
        } else {
            Err(EngineError::Forbidden("only staff or the system can sync users and listings"))
        }
    }

    /// `upsert_user` on behalf of a session actor.
    pub async fn sync_user(&self, actor: Ulid, user: UserInfo) -> Result<(), EngineError> {
        self.authorize_sync(actor)?;
        self.upsert_user(user).await
    }

    /// `upsert_listing` on behalf of a session actor.
    pub async fn sync_listing(&self, actor: Ulid, listing: Listing) -> Result<(), EngineError> {
        self.authorize_sync(actor)?;
        self.upsert_listing(listing).await
    }

    pub async fn upsert_user(&self, user: UserInfo) -> Result<(), EngineError> {
        if !self.users.contains_key(&user.id) && self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        self.commit_global(vec![Event::UserSynced { user }]).await
    }

    pub async fn upsert_listing(&self, listing: Listing) -> Result<(), EngineError> {
        if listing.city.len() > MAX_CITY_LEN {
            return Err(EngineError::LimitExceeded("city name too long"));
        }
        if listing.daily_price.is_some_and(|p| p > MAX_DAILY_PRICE) {
            return Err(EngineError::LimitExceeded("daily price too large"));
        }
        let id = listing.id;

        if let Some(ls) = self.get_listing_state(&id) {
            let mut guard = ls.write().await;
            return self.commit(&mut guard, vec![Event::ListingSynced { listing }]).await;
        }

        if self.listings.len() >= MAX_LISTINGS {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        // Publish the new state already locked, so nobody books against it
        // before its ListingSynced is durable.
        let fresh = Arc::new(RwLock::new(ListingState::new(listing.clone())));
        let fresh_guard = fresh.clone().write_owned().await;
        let (mut guard, created) = match self.listings.entry(id) {
            Entry::Vacant(v) => {
                v.insert(fresh);
                (fresh_guard, true)
            }
            Entry::Occupied(o) => {
                let existing = o.get().clone();
                drop(o);
                drop(fresh_guard);
                (existing.write_owned().await, false)
            }
        };
        let result = self.commit(&mut guard, vec![Event::ListingSynced { listing }]).await;
        if result.is_err() && created {
            self.listings.remove(&id);
        }
        result
    }

    // ── Booking state machine ────────────────────────────────

    pub async fn create_booking(
        &self,
        actor: Ulid,
        req: NewBooking,
    ) -> Result<BookingOutcome, EngineError> {
        if let Some(ref m) = req.message
            && m.len() > MAX_MESSAGE_LEN
        {
            return Err(EngineError::LimitExceeded("message too long"));
        }
        let stay = validate_stay(req.start_date, req.end_date)?;

        let ls = self
            .get_listing_state(&req.listing_id)
            .ok_or(EngineError::NotFound(req.listing_id))?;
        let mut guard = ls.write().await;
        if !guard.listing.is_active {
            return Err(EngineError::NotFound(req.listing_id));
        }
        if guard.listing.owner_id == actor {
            return Err(EngineError::Forbidden("hosts cannot book their own listing"));
        }
        if self.booking_to_listing.contains_key(&req.id) {
            return Err(EngineError::AlreadyExists(req.id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many bookings on listing"));
        }

        let price = compute_price(
            &self.commission,
            guard.listing.daily_price,
            stay.start,
            stay.end,
            &guard.listing.city,
        )?;
        check_no_confirmed_overlap(&guard, &stay, None)?;

        let now = now_ms();
        let booking = Booking {
            id: req.id,
            renter_id: actor,
            listing_id: req.listing_id,
            stay,
            status: BookingStatus::Pending,
            price,
            message: req.message,
            created_at: now,
            updated_at: now,
        };
        let events = vec![
            Event::BookingCreated {
                booking: booking.clone(),
            },
            audit::log_event(
                &booking,
                Some(actor),
                LogAction::Create,
                audit::created(&booking),
                now,
            ),
        ];
        self.commit(&mut guard, events).await?;

        let to_host =
            Notification::render(NotificationKind::HostNewBooking, &booking, &guard.listing);
        let to_renter =
            Notification::render(NotificationKind::RenterRequested, &booking, &guard.listing);
        drop(guard);

        metrics::counter!(BOOKINGS_CREATED_TOTAL).increment(1);
        info!(
            booking = %booking.id,
            listing = %booking.listing_id,
            total = %booking.price.total_price,
            "booking created"
        );
        let advisory = Some(to_host.text.clone());
        self.notify_all(vec![to_host, to_renter]);

        Ok(BookingOutcome { booking, advisory })
    }

    pub async fn confirm_booking(
        &self,
        actor: Ulid,
        booking_id: Ulid,
    ) -> Result<ConfirmOutcome, EngineError> {
        let guard = self.resolve_booking_write(&booking_id).await?;
        if !may_manage(&self.user(actor), &guard.listing) {
            return Err(EngineError::Forbidden(
                "only the listing owner or staff can confirm a booking",
            ));
        }
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
        self.ensure_unpaid(booking_id)?;
        self.settle(guard, booking_id, Some(actor)).await
    }

    /// Host or staff cancellation. The row is kept with status `cancelled`.
    pub async fn cancel_booking(
        &self,
        actor: Ulid,
        booking_id: Ulid,
    ) -> Result<BookingOutcome, EngineError> {
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let user = self.user(actor);
        if !may_manage(&user, &guard.listing) {
            return Err(EngineError::Forbidden(
                "only the listing owner or staff can cancel a booking",
            ));
        }
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::AlreadyCancelled(booking_id));
        }

        let description = if guard.listing.owner_id == actor {
            audit::CANCELLED_BY_HOST
        } else {
            audit::CANCELLED_BY_STAFF
        };
        let now = now_ms();
        let events = vec![
            Event::BookingCancelled {
                id: booking_id,
                listing_id: booking.listing_id,
                at: now,
            },
            audit::log_event(&booking, Some(actor), LogAction::Cancel, description, now),
        ];
        self.commit(&mut guard, events).await?;

        let cancelled = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        let notice =
            Notification::render(NotificationKind::RenterDeclined, &cancelled, &guard.listing);
        drop(guard);

        metrics::counter!(BOOKINGS_CANCELLED_TOTAL).increment(1);
        info!(booking = %booking_id, previous = %booking.status, "booking cancelled");
        let advisory = Some(notice.text.clone());
        self.notify.send(notice);

        Ok(BookingOutcome {
            booking: cancelled,
            advisory,
        })
    }

    pub async fn destroy_booking(
        &self,
        actor: Ulid,
        booking_id: Ulid,
    ) -> Result<DestroyOutcome, EngineError> {
        self.destroy_booking_on(actor, booking_id, today()).await
    }

    /// Delete a booking row. A renter may withdraw a pending or cancelled
    /// booking freely, and a confirmed one up to `WITHDRAW_NOTICE_DAYS`
    /// before check-in at the cost of the commission. Staff may delete
    /// anything. Nothing is logged unless the delete happens.
    pub async fn destroy_booking_on(
        &self,
        actor: Ulid,
        booking_id: Ulid,
        today: NaiveDate,
    ) -> Result<DestroyOutcome, EngineError> {
        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        let (withheld, description) = if booking.renter_id == actor {
            let withheld = match booking.status {
                BookingStatus::Pending | BookingStatus::Cancelled => None,
                BookingStatus::Confirmed => {
                    let days_before = (booking.stay.start - today).num_days();
                    if days_before < WITHDRAW_NOTICE_DAYS {
                        return Err(EngineError::Forbidden(
                            "bookings can only be cancelled at least 3 days in advance",
                        ));
                    }
                    Some(booking.price.commission_amount)
                }
            };
            (withheld, audit::withdrawn(booking.status, withheld))
        } else if self.user(actor).is_staff {
            (None, audit::deleted_by_staff(booking.status))
        } else {
            return Err(EngineError::Forbidden(
                "only the renter or staff can delete a booking",
            ));
        };

        let now = now_ms();
        let events = vec![
            Event::BookingDeleted {
                id: booking_id,
                listing_id: booking.listing_id,
            },
            audit::log_event(&booking, Some(actor), LogAction::Cancel, description, now),
        ];
        self.commit(&mut guard, events).await?;
        drop(guard);

        metrics::counter!(BOOKINGS_DELETED_TOTAL).increment(1);
        info!(
            booking = %booking_id,
            previous = %booking.status,
            withheld = ?withheld,
            "booking deleted"
        );
        Ok(DestroyOutcome {
            booking_id,
            withheld_commission: withheld,
        })
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Current state as WAL records: users, then each listing with its live
    /// bookings, then payments and the audit log. `None` if a listing is
    /// mid-mutation.
    fn snapshot_records(&self) -> Option<Vec<Vec<Event>>> {
        let mut records = Vec::new();

        let users: Vec<Event> = self
            .users
            .iter()
            .map(|u| Event::UserSynced { user: *u.value() })
            .collect();
        if !users.is_empty() {
            records.push(users);
        }

        for ls in self.listing_states() {
            let guard = ls.try_read().ok()?;
            let mut record = Vec::with_capacity(guard.bookings.len() + 1);
            record.push(Event::ListingSynced {
                listing: guard.listing.clone(),
            });
            record.extend(guard.bookings.iter().map(|b| Event::BookingCreated {
                booking: b.clone(),
            }));
            records.push(record);
        }

        let payments: Vec<Event> = self
            .payments
            .iter()
            .map(|p| Event::PaymentRecorded {
                payment: p.value().clone(),
            })
            .collect();
        if !payments.is_empty() {
            records.push(payments);
        }

        let mut entries: Vec<BookingLog> = self
            .logs
            .iter()
            .flat_map(|e| e.value().clone())
            .collect();
        entries.sort_by_key(|e| e.at);
        if !entries.is_empty() {
            records.push(
                entries
                    .into_iter()
                    .map(|entry| Event::LogAppended { entry })
                    .collect(),
            );
        }

        Some(records)
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Returns `false` if listings stayed busy and nothing was done.
    pub async fn compact_wal(&self) -> Result<bool, EngineError> {
        for attempt in 1..=COMPACT_ATTEMPTS {
            let gate = self.commit_gate.write().await;
            if let Some(records) = self.snapshot_records() {
                let (tx, rx) = oneshot::channel();
                self.wal_tx
                    .send(WalCommand::Compact {
                        records,
                        response: tx,
                    })
                    .await
                    .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
                let result = rx
                    .await
                    .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                    .map_err(|e| EngineError::WalError(e.to_string()));
                drop(gate);
                return result.map(|()| true);
            }
            drop(gate);
            tokio::time::sleep(Duration::from_millis(5 * attempt)).await;
        }
        debug!("compaction skipped, listings busy");
        Ok(false)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
