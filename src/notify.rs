use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::{Booking, Listing};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    HostNewBooking,
    RenterRequested,
    RenterConfirmed,
    RenterDeclined,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::HostNewBooking => "host_new_booking",
            NotificationKind::RenterRequested => "renter_requested",
            NotificationKind::RenterConfirmed => "renter_confirmed",
            NotificationKind::RenterDeclined => "renter_declined",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub recipient: Ulid,
    pub kind: NotificationKind,
    pub booking_id: Ulid,
    pub text: String,
}

impl Notification {
    /// Build the notification for `booking`. The recipient follows from the kind.
    pub fn render(kind: NotificationKind, booking: &Booking, listing: &Listing) -> Self {
        let start = booking.stay.start.format("%d %b %Y");
        let end = booking.stay.end.format("%d %b %Y");
        let (recipient, text) = match kind {
            NotificationKind::HostNewBooking => (
                listing.owner_id,
                format!(
                    "New booking for listing {} in {}\nDates: {start} – {end}\nBooked by: {}\nTotal: {} EUR\nMessage from renter: {}",
                    listing.id,
                    listing.city,
                    booking.renter_id,
                    booking.price.total_price,
                    booking.message.as_deref().unwrap_or("–"),
                ),
            ),
            NotificationKind::RenterRequested => (
                booking.renter_id,
                format!(
                    "Your booking request for listing {} in {} from {start} to {end} was sent to the host.\nTotal: {} EUR",
                    listing.id, listing.city, booking.price.total_price,
                ),
            ),
            NotificationKind::RenterConfirmed => (
                booking.renter_id,
                format!(
                    "Your booking is confirmed for listing {} in {}\nDates: {start} – {end}\nHost: {}\nPaid: {} EUR",
                    listing.id, listing.city, listing.owner_id, booking.price.total_price,
                ),
            ),
            NotificationKind::RenterDeclined => (
                booking.renter_id,
                format!(
                    "We appreciate your interest in listing {} in {} from {start} to {end}.\nUnfortunately these dates are no longer available.\nWe hope you'll find another great place soon!",
                    listing.id, listing.city,
                ),
            ),
        };
        Self {
            recipient,
            kind,
            booking_id: booking.id,
            text,
        }
    }
}

/// Fire-and-forget fan-out of booking notifications: one channel per
/// recipient plus a firehose that the delivery task drains.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    firehose: broadcast::Sender<Notification>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            firehose: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one recipient's notifications. Creates the channel if needed.
    pub fn subscribe(&self, recipient: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(recipient)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every notification.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notification> {
        self.firehose.subscribe()
    }

    /// Never blocks and never fails; undeliverable notifications are logged.
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = self.channels.get(&notification.recipient) {
            let _ = sender.send(notification.clone());
        }
        if self.firehose.send(notification).is_err() {
            debug!("no notification consumer attached");
        }
    }
}

/// Delivery task: drains the firehose and emits each notification to the log.
pub async fn run_dispatcher(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(n) => {
                info!(
                    target: "stayflow::notifications",
                    recipient = %n.recipient,
                    kind = n.kind.as_str(),
                    booking = %n.booking_id,
                    "{}",
                    n.text
                );
            }
            Err(RecvError::Lagged(missed)) => {
                warn!("notification dispatcher lagged, {missed} notifications dropped");
                metrics::counter!(crate::observability::NOTIFICATIONS_DROPPED_TOTAL)
                    .increment(missed);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use rust_decimal_macros::dec;

    fn fixture() -> (Booking, Listing) {
        let listing = Listing {
            id: Ulid::new(),
            owner_id: Ulid::new(),
            daily_price: Some(dec!(100)),
            city: "Berlin".into(),
            is_active: true,
        };
        let booking = Booking {
            id: Ulid::new(),
            renter_id: Ulid::new(),
            listing_id: listing.id,
            stay: DateRange::new(
                "2025-06-01".parse().unwrap(),
                "2025-06-05".parse().unwrap(),
            ),
            status: BookingStatus::Pending,
            price: PriceBreakdown {
                base_price: dec!(400),
                commission_rate: dec!(0.25),
                commission_amount: dec!(100),
                total_price: dec!(500),
            },
            message: Some("Late arrival".into()),
            created_at: 0,
            updated_at: 0,
        };
        (booking, listing)
    }

    #[test]
    fn render_routes_to_the_right_recipient() {
        let (booking, listing) = fixture();
        let host = Notification::render(NotificationKind::HostNewBooking, &booking, &listing);
        assert_eq!(host.recipient, listing.owner_id);
        assert!(host.text.contains("01 Jun 2025"));
        assert!(host.text.contains("Late arrival"));
        assert!(host.text.contains("500"));

        let confirmed = Notification::render(NotificationKind::RenterConfirmed, &booking, &listing);
        assert_eq!(confirmed.recipient, booking.renter_id);
        assert_eq!(confirmed.booking_id, booking.id);

        let declined = Notification::render(NotificationKind::RenterDeclined, &booking, &listing);
        assert_eq!(declined.recipient, booking.renter_id);
        assert!(declined.text.contains("no longer available"));
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let (booking, listing) = fixture();
        let mut rx = hub.subscribe(booking.renter_id);
        let mut all = hub.subscribe_all();

        let n = Notification::render(NotificationKind::RenterConfirmed, &booking, &listing);
        hub.send(n.clone());

        assert_eq!(rx.recv().await.unwrap(), n);
        assert_eq!(all.recv().await.unwrap(), n);
    }

    #[tokio::test]
    async fn other_recipients_do_not_receive() {
        let hub = NotifyHub::new();
        let (booking, listing) = fixture();
        let mut host_rx = hub.subscribe(listing.owner_id);

        hub.send(Notification::render(
            NotificationKind::RenterDeclined,
            &booking,
            &listing,
        ));

        assert!(host_rx.try_recv().is_err());
    }

    #[test]
    fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let (booking, listing) = fixture();
        hub.send(Notification::render(
            NotificationKind::HostNewBooking,
            &booking,
            &listing,
        ));
    }
}
