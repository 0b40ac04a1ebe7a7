use std::collections::HashMap;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::model::*;

use super::conflict::validate_stay;
use super::pricing::normalize_city;
use super::{find_overlapping, Engine, EngineError};

fn newest_first(bookings: &mut [Booking]) {
    bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

impl Engine {
    /// Visible to the renter, the listing owner and staff.
    pub async fn get_booking(&self, actor: Ulid, booking_id: Ulid) -> Result<Booking, EngineError> {
        let guard = self.resolve_booking_read(&booking_id).await?;
        let booking = guard
            .booking(booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.renter_id != actor
            && guard.listing.owner_id != actor
            && !self.user(actor).is_staff
        {
            return Err(EngineError::Forbidden("not a party to this booking"));
        }
        Ok(booking)
    }

    /// Staff see every booking; everyone else sees what they rent or host.
    pub async fn list_bookings(&self, actor: Ulid, filter: BookingFilter) -> Vec<Booking> {
        let is_staff = self.user(actor).is_staff;
        let mut out = Vec::new();
        for ls in self.listing_states() {
            let guard = ls.read().await;
            let hosts = guard.listing.owner_id == actor;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| is_staff || hosts || b.renter_id == actor)
                    .filter(|b| filter.matches(b))
                    .cloned(),
            );
        }
        newest_first(&mut out);
        out
    }

    /// Bookings the actor made as a renter.
    pub async fn list_my_bookings(&self, actor: Ulid, filter: BookingFilter) -> Vec<Booking> {
        let mut out = Vec::new();
        for ls in self.listing_states() {
            let guard = ls.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.renter_id == actor && filter.matches(b))
                    .cloned(),
            );
        }
        newest_first(&mut out);
        out
    }

    pub async fn find_overlapping_bookings(
        &self,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        statuses: &[BookingStatus],
        exclude: Option<Ulid>,
    ) -> Result<Vec<Booking>, EngineError> {
        let stay = validate_stay(start, end)?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        Ok(find_overlapping(&guard, &stay, statuses, exclude)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn payment_for(&self, booking_id: Ulid) -> Option<Payment> {
        self.payments.get(&booking_id).map(|p| p.value().clone())
    }

    pub fn my_payments(&self, actor: Ulid) -> Vec<Payment> {
        let mut out: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.renter_id == actor)
            .map(|p| p.value().clone())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Staff only. Entries survive deletion of the booking they describe.
    pub fn audit_trail(
        &self,
        actor: Ulid,
        booking_id: Ulid,
    ) -> Result<Vec<BookingLog>, EngineError> {
        if !self.user(actor).is_staff {
            return Err(EngineError::Forbidden("only staff can read the audit log"));
        }
        let mut entries = self
            .logs
            .get(&booking_id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(booking_id))?;
        // Stable: entries committed in the same millisecond keep commit order.
        entries.sort_by_key(|e| e.at);
        Ok(entries)
    }

    /// Confirmed bookings across the host's listings. Earnings are base rent.
    pub async fn host_stats(&self, actor: Ulid) -> Result<HostStats, EngineError> {
        if !self.user(actor).is_host {
            return Err(EngineError::Forbidden("only hosts can access host statistics"));
        }
        let mut stats = HostStats {
            host_id: actor,
            total_listings: 0,
            total_bookings: 0,
            total_nights: 0,
            total_earnings: Decimal::ZERO,
        };
        for ls in self.listing_states() {
            let guard = ls.read().await;
            if guard.listing.owner_id != actor {
                continue;
            }
            stats.total_listings += 1;
            for b in guard
                .bookings
                .iter()
                .filter(|b| b.status == BookingStatus::Confirmed)
            {
                stats.total_bookings += 1;
                stats.total_nights += b.stay.nights();
                stats.total_earnings += b.price.base_price;
            }
        }
        Ok(stats)
    }

    /// Confirmed bookings the actor made. Spending includes commission.
    pub async fn renter_stats(&self, actor: Ulid) -> Result<RenterStats, EngineError> {
        if self.user(actor).is_host {
            return Err(EngineError::Forbidden("only renters can access renter statistics"));
        }
        let mut stats = RenterStats {
            renter_id: actor,
            total_bookings: 0,
            total_nights: 0,
            total_spent: Decimal::ZERO,
        };
        for ls in self.listing_states() {
            let guard = ls.read().await;
            for b in guard
                .bookings
                .iter()
                .filter(|b| b.renter_id == actor && b.status == BookingStatus::Confirmed)
            {
                stats.total_bookings += 1;
                stats.total_nights += b.stay.nights();
                stats.total_spent += b.price.total_price;
            }
        }
        Ok(stats)
    }

    /// Staff only. Commission over paid payments, grouped by the listing's
    /// current city (case-insensitive), largest total first.
    pub async fn commission_stats(&self, actor: Ulid) -> Result<CommissionStats, EngineError> {
        if !self.user(actor).is_staff {
            return Err(EngineError::Forbidden("only staff can access commission statistics"));
        }
        let paid: Vec<Payment> = self
            .payments
            .iter()
            .filter(|p| p.is_paid)
            .map(|p| p.value().clone())
            .collect();

        let mut by_city: HashMap<String, CityCommission> = HashMap::new();
        let mut total_commission = Decimal::ZERO;
        for p in paid {
            let city = match self.get_listing_state(&p.listing_id) {
                Some(ls) => ls.read().await.listing.city.clone(),
                None => String::from("unknown"),
            };
            let city = city.trim().to_string();
            total_commission += p.commission_amount;
            let entry = by_city
                .entry(normalize_city(&city))
                .or_insert_with(|| CityCommission {
                    city: city.clone(),
                    payments: 0,
                    total_commission: Decimal::ZERO,
                });
            // Spellings of one city share a row; the label is the smallest.
            if city < entry.city {
                entry.city = city;
            }
            entry.payments += 1;
            entry.total_commission += p.commission_amount;
        }

        let mut by_city: Vec<CityCommission> = by_city.into_values().collect();
        by_city.sort_by(|a, b| {
            b.total_commission
                .cmp(&a.total_commission)
                .then_with(|| a.city.cmp(&b.city))
        });
        Ok(CommissionStats {
            total_commission,
            by_city,
        })
    }
}
