mod audit;
mod conflict;
mod error;
mod mutations;
mod payment;
pub mod pricing;
mod queries;

pub use conflict::find_overlapping;
pub use error::EngineError;
pub use pricing::{compute_price, CommissionTable};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        records: Vec<Vec<Event>>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                flush_and_respond(&mut wal, &mut batch);
                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { records, response } => {
            let result = Wal::write_compact_file(wal.path(), &records)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

pub struct Engine {
    pub(super) listings: DashMap<Ulid, SharedListingState>,
    pub(super) users: DashMap<Ulid, UserInfo>,
    /// Reverse lookup: booking id → listing id.
    pub(super) booking_to_listing: DashMap<Ulid, Ulid>,
    /// Keyed by booking id (one payment per booking).
    pub(super) payments: DashMap<Ulid, Payment>,
    /// Audit entries by booking id. Outlive the booking.
    pub(super) logs: DashMap<Ulid, Vec<BookingLog>>,
    pub(super) commission: CommissionTable,
    /// Commits hold this shared; compaction holds it exclusively so no
    /// transaction lands between the snapshot and the file swap.
    pub(super) commit_gate: RwLock<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

/// Apply a listing-scoped event to a ListingState (no locking; caller holds the lock).
fn apply_to_listing(ls: &mut ListingState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ListingSynced { listing } => {
            ls.listing = listing.clone();
        }
        Event::BookingCreated { booking } => {
            index.insert(booking.id, booking.listing_id);
            ls.insert_booking(booking.clone());
        }
        Event::BookingConfirmed { id, price, at, .. } => {
            if let Some(b) = ls.booking_mut(*id) {
                b.status = BookingStatus::Confirmed;
                b.price = *price;
                b.updated_at = *at;
            }
        }
        Event::BookingCancelled { id, at, .. } => {
            if let Some(b) = ls.booking_mut(*id) {
                b.status = BookingStatus::Cancelled;
                b.updated_at = *at;
            }
        }
        Event::BookingDeleted { id, .. } => {
            ls.remove_booking(*id);
            index.remove(id);
        }
        // Global events are applied at the DashMap level, not here
        Event::UserSynced { .. } | Event::PaymentRecorded { .. } | Event::LogAppended { .. } => {}
    }
}

/// Extract the listing id from a listing-scoped event.
fn event_listing_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ListingSynced { listing } => Some(listing.id),
        Event::BookingCreated { booking } => Some(booking.listing_id),
        Event::BookingConfirmed { listing_id, .. }
        | Event::BookingCancelled { listing_id, .. }
        | Event::BookingDeleted { listing_id, .. } => Some(*listing_id),
        Event::UserSynced { .. } | Event::PaymentRecorded { .. } | Event::LogAppended { .. } => {
            None
        }
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        commission: CommissionTable,
    ) -> io::Result<Self> {
        let records = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            listings: DashMap::new(),
            users: DashMap::new(),
            booking_to_listing: DashMap::new(),
            payments: DashMap::new(),
            logs: DashMap::new(),
            commission,
            commit_gate: RwLock::new(()),
            wal_tx,
            notify,
        };

        // We're the sole owner of these Arcs during replay, so try_write always
        // succeeds instantly. Never use blocking_write here: this runs inside
        // an async context.
        for event in records.iter().flatten() {
            engine.apply_global(event);
            let Some(listing_id) = event_listing_id(event) else {
                continue;
            };
            if let Event::ListingSynced { listing } = event
                && !engine.listings.contains_key(&listing_id)
            {
                engine.listings.insert(
                    listing_id,
                    Arc::new(RwLock::new(ListingState::new(listing.clone()))),
                );
                continue;
            }
            if let Some(entry) = engine.listings.get(&listing_id) {
                let ls_arc = entry.clone();
                drop(entry);
                let Ok(mut guard) = ls_arc.try_write() else {
                    continue;
                };
                apply_to_listing(&mut guard, event, &engine.booking_to_listing);
            }
        }

        tracing::info!(
            listings = engine.listings.len(),
            bookings = engine.booking_to_listing.len(),
            records = records.len(),
            "state rebuilt from WAL"
        );
        Ok(engine)
    }

    pub fn commission_table(&self) -> &CommissionTable {
        &self.commission
    }

    fn apply_global(&self, event: &Event) {
        match event {
            Event::UserSynced { user } => {
                self.users.insert(user.id, *user);
            }
            Event::PaymentRecorded { payment } => {
                self.payments.insert(payment.booking_id, payment.clone());
            }
            Event::LogAppended { entry } => {
                self.logs.entry(entry.booking_id).or_default().push(entry.clone());
            }
            // A payment lives and dies with its booking.
            Event::BookingDeleted { id, .. } => {
                self.payments.remove(id);
            }
            _ => {}
        }
    }

    /// Write one transaction to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, events: &[Event]) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events: events.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append a transaction, then apply every event. The caller holds the
    /// listing's write lock across its checks and this call.
    pub(super) async fn commit(
        &self,
        ls: &mut ListingState,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&events).await?;
        for event in &events {
            self.apply_global(event);
            apply_to_listing(ls, event, &self.booking_to_listing);
        }
        Ok(())
    }

    /// Commit a transaction that touches no listing.
    pub(super) async fn commit_global(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(&events).await?;
        for event in &events {
            self.apply_global(event);
        }
        Ok(())
    }

    /// Fire-and-forget: notifications never fail the transition that produced them.
    pub(super) fn notify_all(&self, notifications: Vec<Notification>) {
        for n in notifications {
            self.notify.send(n);
        }
    }

    pub fn get_listing_state(&self, id: &Ulid) -> Option<SharedListingState> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn get_listing_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_listing.get(booking_id).map(|e| *e.value())
    }

    /// Unknown users have no staff or host rights.
    pub fn user(&self, id: Ulid) -> UserInfo {
        self.users.get(&id).map(|u| *u.value()).unwrap_or(UserInfo {
            id,
            is_staff: false,
            is_host: false,
        })
    }

    /// Lookup booking → listing, get listing, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ListingState>, EngineError> {
        let listing_id = self
            .get_listing_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.write_owned().await;
        // Deleted between lookup and lock.
        if guard.booking(*booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }

    /// Lookup booking → listing, acquire read lock.
    pub(super) async fn resolve_booking_read(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<ListingState>, EngineError> {
        let listing_id = self
            .get_listing_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ls = self
            .get_listing_state(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read_owned().await;
        if guard.booking(*booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok(guard)
    }

    /// Every listing's shared state, cloned out of the map so no DashMap
    /// shard lock is held across an await.
    pub(super) fn listing_states(&self) -> Vec<SharedListingState> {
        self.listings.iter().map(|e| e.value().clone()).collect()
    }
}
