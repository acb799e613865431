mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;

pub use availability::{availability, clamp_available, peak_usage};
pub use error::EngineError;
pub use lifecycle::{next_status, Transition};

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::io;
use std::ops::DerefMut;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::numbers::{BookingNumberSource, RandomBookingNumbers};
use crate::policy::AccessPolicy;
use crate::wal::Wal;

use conflict::today;

pub type SharedItemState = Arc<RwLock<ItemState>>;
pub type SharedBooking = Arc<RwLock<Booking>>;

/// Item write guards for one operation. A BTreeMap, so acquisition and iteration
/// both run in ascending item id order.
type ItemGuards = BTreeMap<Ulid, OwnedRwLockWriteGuard<ItemState>>;

// ── Group-commit WAL channel ─────────────────────────────

type AppendResponse = oneshot::Sender<io::Result<()>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: AppendResponse,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued, then
/// fsyncs once for the whole batch. A compaction request ends the batch early.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            deferred = Some(other);
                            break;
                        }
                    }
                }
                commit_batch(&mut wal, batch);
                if let Some(WalCommand::Compact { events, response }) = deferred {
                    compact(&mut wal, &events, response);
                }
            }
            WalCommand::Compact { events, response } => compact(&mut wal, &events, response),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<(Event, AppendResponse)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak into the
    // next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn compact(wal: &mut Wal, events: &[Event], response: oneshot::Sender<io::Result<()>>) {
    let replaced = wal.records_since_compact();
    let result = Wal::write_compact_file(wal.path(), events).and_then(|()| wal.swap_compact_file());
    match &result {
        Ok(()) => tracing::debug!(replaced, written = events.len(), "WAL swapped"),
        Err(e) => tracing::error!(error = %e, "WAL compaction failed"),
    }
    let _ = response.send(result);
}

// ── Engine ───────────────────────────────────────────────

/// Tunables for an engine instance. See [`crate::config::EngineConfig`] for the
/// environment-driven defaults.
#[derive(Clone)]
pub struct EngineOptions {
    /// Max wait for any booking or item lock.
    pub lock_timeout: Duration,
    /// Booking-number draws before giving up with a conflict.
    pub booking_number_attempts: u32,
    pub booking_prefix: String,
    pub numbers: Arc<dyn BookingNumberSource>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            booking_number_attempts: DEFAULT_BOOKING_NUMBER_ATTEMPTS,
            booking_prefix: DEFAULT_BOOKING_PREFIX.to_string(),
            numbers: Arc::new(RandomBookingNumbers),
        }
    }
}

pub struct Engine {
    items: DashMap<Ulid, SharedItemState>,
    bookings: DashMap<Ulid, SharedBooking>,
    /// booking number → booking id. Inserting here is how a number is reserved.
    booking_numbers: DashMap<String, Ulid>,
    /// owner id → booking ids in creation order.
    owners: DashMap<Ulid, Vec<Ulid>>,
    /// Mutations hold this shared; compaction takes it exclusively so its snapshot
    /// never races an in-flight commit.
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
    policy: Arc<dyn AccessPolicy>,
    options: EngineOptions,
}

/// Apply a booking event to the booking and the ledgers of its items (no locking;
/// caller holds every guard). For `BookingCreated`, `booking` is the new aggregate.
fn apply_to_aggregate<G: DerefMut<Target = ItemState>>(
    booking: &mut Booking,
    items: &mut BTreeMap<Ulid, G>,
    event: &Event,
) {
    match event {
        Event::BookingCreated { .. } => {
            for li in &booking.line_items {
                if let Some(item) = items.get_mut(&li.item_id) {
                    item.insert_claim(li.claim());
                }
            }
        }
        Event::LineItemsReplaced {
            booking_id,
            line_items,
            stock,
            at,
        } => {
            for item in items.values_mut() {
                item.remove_claims(*booking_id);
            }
            for li in line_items {
                if let Some(item) = items.get_mut(&li.item_id) {
                    item.insert_claim(li.claim());
                }
            }
            booking.line_items = line_items.clone();
            booking.updated_at = *at;
            apply_stock(items, stock);
        }
        Event::StatusChanged {
            booking_id,
            status,
            stock,
            at,
        } => {
            booking.status = *status;
            for li in &mut booking.line_items {
                li.status = *status;
            }
            for item in items.values_mut() {
                item.set_claim_status(*booking_id, *status);
            }
            booking.updated_at = *at;
            apply_stock(items, stock);
        }
        Event::PickupConfirmed { at, .. } => {
            booking.picked_up = true;
            booking.updated_at = *at;
        }
        Event::ItemsReturned { stock, at, .. } => {
            booking.returned = true;
            booking.updated_at = *at;
            apply_stock(items, stock);
        }
        // Item events are applied at the item level, not here
        Event::ItemCreated { .. } | Event::ItemCapacitySet { .. } => {}
    }
}

fn apply_stock<G: DerefMut<Target = ItemState>>(items: &mut BTreeMap<Ulid, G>, stock: &[StockLevel]) {
    for level in stock {
        if let Some(item) = items.get_mut(&level.item_id) {
            item.available_quantity = level.available_quantity;
        }
    }
}

fn replay_contended(what: &str) -> io::Error {
    io::Error::other(format!("replay: {what} lock contended"))
}

impl Engine {
    pub fn new(wal_path: PathBuf, policy: Arc<dyn AccessPolicy>) -> io::Result<Self> {
        Self::with_options(wal_path, policy, EngineOptions::default())
    }

    pub fn with_options(
        wal_path: PathBuf,
        policy: Arc<dyn AccessPolicy>,
        options: EngineOptions,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            items: DashMap::new(),
            bookings: DashMap::new(),
            booking_numbers: DashMap::new(),
            owners: DashMap::new(),
            gate: RwLock::new(()),
            wal_tx,
            policy,
            options,
        };

        // We're the sole owner of every Arc during replay, so try_write always
        // succeeds. Never block here: this may run inside an async context.
        for event in &events {
            engine.replay(event)?;
        }
        tracing::info!(
            events = events.len(),
            items = engine.items.len(),
            bookings = engine.bookings.len(),
            "engine state replayed"
        );

        Ok(engine)
    }

    fn replay(&self, event: &Event) -> io::Result<()> {
        match event {
            Event::ItemCreated {
                id,
                location_id,
                name,
                total_quantity,
            } => {
                let item = ItemState::new(*id, *location_id, name.clone(), *total_quantity);
                self.items.insert(*id, Arc::new(RwLock::new(item)));
            }
            Event::ItemCapacitySet {
                id,
                total_quantity,
                available_quantity,
            } => {
                if let Some(item) = self.item_handle(id) {
                    let mut guard = item.try_write().map_err(|_| replay_contended("item"))?;
                    guard.total_quantity = *total_quantity;
                    guard.available_quantity = *available_quantity;
                }
            }
            Event::BookingCreated { booking } => {
                let mut booking = booking.clone();
                let mut items = self.try_lock_items(booking.item_ids())?;
                apply_to_aggregate(&mut booking, &mut items, event);
                drop(items);
                self.index_booking(booking);
            }
            other => {
                let Some(shared) = other.booking_id().and_then(|id| self.booking_handle(&id)) else {
                    return Ok(());
                };
                let mut booking = shared.try_write_owned().map_err(|_| replay_contended("booking"))?;
                let mut ids = booking.item_ids();
                if let Event::LineItemsReplaced { line_items, .. } = other {
                    ids.extend(line_items.iter().map(|l| l.item_id));
                }
                let mut items = self.try_lock_items(ids)?;
                apply_to_aggregate(&mut booking, &mut items, other);
            }
        }
        Ok(())
    }

    fn try_lock_items(&self, ids: impl IntoIterator<Item = Ulid>) -> io::Result<ItemGuards> {
        let mut guards = BTreeMap::new();
        for id in ids.into_iter().collect::<BTreeSet<_>>() {
            if let Some(item) = self.item_handle(&id) {
                let guard = item.try_write_owned().map_err(|_| replay_contended("item"))?;
                guards.insert(id, guard);
            }
        }
        Ok(guards)
    }

    fn index_booking(&self, booking: Booking) {
        self.booking_numbers
            .insert(booking.booking_number.clone(), booking.id);
        self.owners.entry(booking.owner_id).or_default().push(booking.id);
        self.bookings.insert(booking.id, Arc::new(RwLock::new(booking)));
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))
    }

    /// WAL-append, then apply while the caller still holds every guard. If the append
    /// fails nothing in memory changes.
    async fn commit(
        &self,
        booking: &mut Booking,
        items: &mut ItemGuards,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_aggregate(booking, items, event);
        Ok(())
    }

    fn item_handle(&self, id: &Ulid) -> Option<SharedItemState> {
        self.items.get(id).map(|e| e.value().clone())
    }

    fn booking_handle(&self, id: &Ulid) -> Option<SharedBooking> {
        self.bookings.get(id).map(|e| e.value().clone())
    }

    pub fn booking_id_for_number(&self, number: &str) -> Option<Ulid> {
        self.booking_numbers.get(number).map(|e| *e.value())
    }

    /// Run one mutation under the shared gate and record its outcome.
    async fn run<T>(
        &self,
        operation: &'static str,
        work: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let started = Instant::now();
        let result = match self.timed(self.gate.read(), || "engine gate".to_string()).await {
            Ok(_gate) => work.await,
            Err(e) => Err(e),
        };
        crate::observability::record_operation(operation, &result, started);
        result
    }

    // ── Locking ──────────────────────────────────────────

    async fn timed<T>(&self, fut: impl Future<Output = T>, what: impl FnOnce() -> String) -> Result<T, EngineError> {
        tokio::time::timeout(self.options.lock_timeout, fut)
            .await
            .map_err(|_| {
                metrics::counter!(crate::observability::LOCK_TIMEOUTS_TOTAL).increment(1);
                EngineError::Conflict(format!("timed out waiting for {}", what()))
            })
    }

    /// Lookup booking, acquire its write lock. Always taken before any item lock.
    async fn lock_booking(&self, id: Ulid) -> Result<OwnedRwLockWriteGuard<Booking>, EngineError> {
        let shared = self.booking_handle(&id).ok_or(EngineError::NotFound(id))?;
        self.timed(shared.write_owned(), || format!("booking {id}")).await
    }

    /// Acquire item write locks in ascending id order. A handle that left the map while
    /// we waited (an item whose registration failed) counts as missing.
    async fn lock_items(&self, ids: impl IntoIterator<Item = Ulid>) -> Result<ItemGuards, EngineError> {
        let mut guards = BTreeMap::new();
        for id in ids.into_iter().collect::<BTreeSet<_>>() {
            let shared = self.item_handle(&id).ok_or(EngineError::NotFound(id))?;
            let guard = self.timed(shared.clone().write_owned(), || format!("item {id}")).await?;
            if !self.item_handle(&id).is_some_and(|current| Arc::ptr_eq(&current, &shared)) {
                return Err(EngineError::NotFound(id));
            }
            guards.insert(id, guard);
        }
        Ok(guards)
    }

    // ── Booking numbers ──────────────────────────────────

    /// Draw candidates until one is free, reserving it for `booking_id`.
    fn reserve_booking_number(&self, booking_id: Ulid) -> Result<String, EngineError> {
        let date = today();
        for attempt in 1..=self.options.booking_number_attempts {
            let candidate = self.options.numbers.generate(&self.options.booking_prefix, date);
            match self.booking_numbers.entry(candidate) {
                Entry::Vacant(slot) => {
                    let number = slot.key().clone();
                    slot.insert(booking_id);
                    return Ok(number);
                }
                Entry::Occupied(taken) => {
                    tracing::debug!(number = %taken.key(), attempt, "booking number collision");
                    metrics::counter!(crate::observability::BOOKING_NUMBER_RETRIES_TOTAL).increment(1);
                }
            }
        }
        Err(EngineError::Conflict(format!(
            "no unique booking number after {} attempts",
            self.options.booking_number_attempts
        )))
    }

    fn release_booking_number(&self, number: &str) {
        self.booking_numbers.remove(number);
    }
}
