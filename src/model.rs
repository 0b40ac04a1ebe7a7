use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp that isn't a stay date.
pub type Ms = i64;

/// Half-open stay `[start, end)`. `end` is the checkout day and is not occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateRange start must be before end");
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// True if the night starting on `day` is part of the stay.
    pub fn contains_night(&self, day: NaiveDate) -> bool {
        self.start <= day && day < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The derived money fields of a booking. Always produced together by the
/// pricing engine; `total_price == base_price + commission_amount`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    #[serde(with = "rust_decimal::serde::str")]
    pub base_price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub renter_id: Ulid,
    pub listing_id: Ulid,
    pub stay: DateRange,
    pub status: BookingStatus,
    pub price: PriceBreakdown,
    pub message: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

/// Immutable snapshot taken when a booking is confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub renter_id: Ulid,
    pub host_id: Ulid,
    pub listing_id: Ulid,
    #[serde(with = "rust_decimal::serde::str")]
    pub base_rent: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission_rate: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission_amount: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub total_amount: Decimal,
    pub is_paid: bool,
    pub paid_at: Option<Ms>,
    pub created_at: Ms,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogAction {
    Create,
    Update,
    Cancel,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Create => "create",
            LogAction::Update => "update",
            LogAction::Cancel => "cancel",
        }
    }
}

/// Audit entry. Keeps its own copy of the listing and stay so it still reads
/// correctly after the booking row is deleted. `actor_id` is a weak reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingLog {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub listing_id: Ulid,
    pub stay: DateRange,
    pub actor_id: Option<Ulid>,
    pub action: LogAction,
    pub description: String,
    pub at: Ms,
}

/// Identity the user and listing subsystems act as when syncing snapshots.
pub const SYSTEM_ACTOR: Ulid = Ulid::nil();

/// Role flags owned by the user subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: Ulid,
    pub is_staff: bool,
    pub is_host: bool,
}

/// Read-only snapshot of a listing owned by the listing subsystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Ulid,
    pub owner_id: Ulid,
    #[serde(with = "rust_decimal::serde::str_option")]
    pub daily_price: Option<Decimal>,
    pub city: String,
    pub is_active: bool,
}

#[derive(Debug, Clone)]
pub struct ListingState {
    pub listing: Listing,
    /// Every booking on the listing (any status), sorted by `stay.start`.
    pub bookings: Vec<Booking>,
}

impl ListingState {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by stay.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.stay.start, |b| b.stay.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings whose stay overlaps `query`, any status.
    /// Uses binary search to skip bookings starting on or after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Booking> {
        let right_bound = self
            .bookings
            .partition_point(|b| b.stay.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.stay.end > query.start)
    }
}

/// The event types, flat, no nesting. One WAL record holds a `Vec<Event>`
/// committed as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserSynced {
        user: UserInfo,
    },
    ListingSynced {
        listing: Listing,
    },
    BookingCreated {
        booking: Booking,
    },
    PaymentRecorded {
        payment: Payment,
    },
    BookingConfirmed {
        id: Ulid,
        listing_id: Ulid,
        price: PriceBreakdown,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        listing_id: Ulid,
        at: Ms,
    },
    BookingDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
    LogAppended {
        entry: BookingLog,
    },
}

// ── Requests, outcomes and query results ─────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingOutcome {
    pub booking: Booking,
    /// Text of the notification the transition produced, if any.
    pub advisory: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmOutcome {
    pub booking: Booking,
    pub payment: Payment,
    /// Pending bookings cancelled because they overlapped the confirmed one.
    pub displaced: Vec<Ulid>,
    pub advisory: Option<String>,
}

/// A successful destroy. `withheld_commission` is set when a renter withdrew
/// from a confirmed booking and forfeits the platform commission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestroyOutcome {
    pub booking_id: Ulid,
    pub withheld_commission: Option<Decimal>,
}

impl DestroyOutcome {
    pub fn advisory(&self) -> Option<String> {
        self.withheld_commission.map(|amount| {
            format!("Booking cancelled. Commission of {amount} EUR is withheld.")
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub status: Option<BookingStatus>,
    pub start_date: Option<NaiveDate>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        self.status.is_none_or(|s| booking.status == s)
            && self.start_date.is_none_or(|d| booking.stay.start == d)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStats {
    pub host_id: Ulid,
    pub total_listings: usize,
    pub total_bookings: usize,
    pub total_nights: i64,
    pub total_earnings: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenterStats {
    pub renter_id: Ulid,
    pub total_bookings: usize,
    pub total_nights: i64,
    pub total_spent: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityCommission {
    pub city: String,
    pub payments: usize,
    pub total_commission: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionStats {
    pub total_commission: Decimal,
    /// Largest total first.
    pub by_city: Vec<CityCommission>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn listing() -> Listing {
        Listing {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            daily_price: Some(dec!(100)),
            city: "Berlin".into(),
            is_active: true,
        }
    }

    fn booking(ls: &Listing, start: &str, end: &str) -> Booking {
        Booking {
            id: Ulid::new(),
            renter_id: Ulid::new(),
            listing_id: ls.id,
            stay: DateRange::new(d(start), d(end)),
            status: BookingStatus::Pending,
            price: PriceBreakdown {
                base_price: dec!(100),
                commission_rate: dec!(0.25),
                commission_amount: dec!(25),
                total_price: dec!(125),
            },
            message: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn date_range_basics() {
        let r = DateRange::new(d("2025-06-01"), d("2025-06-05"));
        assert_eq!(r.nights(), 4);
        assert!(r.contains_night(d("2025-06-01")));
        assert!(r.contains_night(d("2025-06-04")));
        assert!(!r.contains_night(d("2025-06-05"))); // checkout day
    }

    #[test]
    fn date_range_overlap() {
        let a = DateRange::new(d("2025-06-01"), d("2025-06-05"));
        let b = DateRange::new(d("2025-06-03"), d("2025-06-08"));
        let c = DateRange::new(d("2025-06-05"), d("2025-06-10"));
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c)); // checkout == check-in
        assert!(!c.overlaps(&a));
    }

    #[test]
    fn date_range_contained_overlaps() {
        let outer = DateRange::new(d("2025-06-01"), d("2025-06-30"));
        let inner = DateRange::new(d("2025-06-10"), d("2025-06-11"));
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn status_parse() {
        assert_eq!(BookingStatus::parse("Pending"), Some(BookingStatus::Pending));
        assert_eq!(BookingStatus::parse(" confirmed "), Some(BookingStatus::Confirmed));
        assert_eq!(BookingStatus::parse("canceled"), Some(BookingStatus::Cancelled));
        assert_eq!(BookingStatus::parse("paid"), None);
        assert_eq!(BookingStatus::Cancelled.to_string(), "cancelled");
    }

    #[test]
    fn bookings_stay_sorted() {
        let l = listing();
        let mut ls = ListingState::new(l.clone());
        ls.insert_booking(booking(&l, "2025-06-10", "2025-06-12"));
        ls.insert_booking(booking(&l, "2025-06-01", "2025-06-03"));
        ls.insert_booking(booking(&l, "2025-06-05", "2025-06-07"));
        let starts: Vec<_> = ls.bookings.iter().map(|b| b.stay.start).collect();
        assert_eq!(starts, vec![d("2025-06-01"), d("2025-06-05"), d("2025-06-10")]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let l = listing();
        let mut ls = ListingState::new(l.clone());
        let a = booking(&l, "2025-06-01", "2025-06-03");
        let b = booking(&l, "2025-06-05", "2025-06-07");
        let c = booking(&l, "2025-06-10", "2025-06-12");
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        ls.insert_booking(a);
        ls.insert_booking(b);
        ls.insert_booking(c);
        assert_eq!(ls.remove_booking(b_id).map(|b| b.id), Some(b_id));
        assert_eq!(ls.bookings.len(), 2);
        assert_eq!(ls.bookings[0].id, a_id);
        assert_eq!(ls.bookings[1].id, c_id);
        assert!(ls.remove_booking(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let l = listing();
        let mut ls = ListingState::new(l.clone());
        ls.insert_booking(booking(&l, "2025-05-01", "2025-05-03"));
        let hit = booking(&l, "2025-06-02", "2025-06-06");
        let hit_id = hit.id;
        ls.insert_booking(hit);
        ls.insert_booking(booking(&l, "2025-07-01", "2025-07-03"));

        let query = DateRange::new(d("2025-06-04"), d("2025-06-10"));
        let hits: Vec<_> = ls.overlapping(&query).map(|b| b.id).collect();
        assert_eq!(hits, vec![hit_id]);
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let l = listing();
        let mut ls = ListingState::new(l.clone());
        ls.insert_booking(booking(&l, "2025-06-01", "2025-06-05"));
        ls.insert_booking(booking(&l, "2025-06-10", "2025-06-12"));
        let query = DateRange::new(d("2025-06-05"), d("2025-06-10"));
        assert_eq!(ls.overlapping(&query).count(), 0);
    }

    #[test]
    fn overlapping_long_stay_spanning_query() {
        let l = listing();
        let mut ls = ListingState::new(l.clone());
        ls.insert_booking(booking(&l, "2025-01-01", "2025-12-31"));
        let query = DateRange::new(d("2025-06-01"), d("2025-06-02"));
        assert_eq!(ls.overlapping(&query).count(), 1);
    }

    #[test]
    fn filter_matches() {
        let l = listing();
        let b = booking(&l, "2025-06-01", "2025-06-05");
        assert!(BookingFilter::default().matches(&b));
        let pending = BookingFilter {
            status: Some(BookingStatus::Pending),
            start_date: None,
        };
        assert!(pending.matches(&b));
        let wrong_day = BookingFilter {
            status: None,
            start_date: Some(d("2025-06-02")),
        };
        assert!(!wrong_day.matches(&b));
    }

    #[test]
    fn destroy_advisory_mentions_amount() {
        let out = DestroyOutcome {
            booking_id: Ulid::new(),
            withheld_commission: Some(dec!(37.50)),
        };
        assert_eq!(
            out.advisory().unwrap(),
            "Booking cancelled. Commission of 37.50 EUR is withheld."
        );
        let free = DestroyOutcome {
            booking_id: Ulid::new(),
            withheld_commission: None,
        };
        assert!(free.advisory().is_none());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let l = listing();
        let events = vec![
            Event::ListingSynced { listing: l.clone() },
            Event::BookingCreated {
                booking: booking(&l, "2025-06-01", "2025-06-05"),
            },
        ];
        let bytes = bincode::serialize(&events).unwrap();
        let decoded: Vec<Event> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(events, decoded);
    }
}
