mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use availability::{compute_occupied, max_allowed_duration, slot_table, snapshot};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One or more events that succeed or fail together.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
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
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    'outer: for (events, _) in batch {
        for event in events {
            if let Err(e) = wal.append_buffered(event) {
                append_err = Some(e);
                break 'outer;
            }
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { events, response } => {
            let batch = vec![(events, response)];
            let result = flush_batch(wal, &batch);
            respond_batch(batch, &result);
        }
    }
}

/// The reservation engine for one venue.
///
/// Each resource's catalog entry and booking records sit behind their own
/// `RwLock`. Writers hold the write lock across check, WAL append and apply,
/// which serializes conflicting mutations per resource.
pub struct Engine {
    pub state: DashMap<Ulid, SharedResourceState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → resource id
    pub(super) booking_index: DashMap<Ulid, Ulid>,
    /// Serializes resource create/delete against compaction.
    pub(super) catalog_lock: Mutex<()>,
}

/// Apply an event directly to a ResourceState (no locking, caller holds the lock).
fn apply_to_resource(rs: &mut ResourceState, event: &Event, booking_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::BookingCreated { booking } => {
            booking_index.insert(booking.id, booking.resource_id);
            rs.insert_booking(booking.clone());
        }
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.status = *status;
            }
        }
        Event::PaymentStatusChanged { id, payment_status, .. } => {
            if let Some(b) = rs.booking_mut(*id) {
                b.payment_status = *payment_status;
            }
        }
        Event::BookingDeleted { id, .. } => {
            rs.remove_booking(*id);
            booking_index.remove(id);
        }
        Event::ResourceUpdated { config } => {
            rs.config = config.clone();
        }
        // ResourceCreated/Deleted are handled at the DashMap level, not here
        Event::ResourceCreated { .. } | Event::ResourceDeleted { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            booking_index: DashMap::new(),
            catalog_lock: Mutex::new(()),
        };

        // Replay events. We're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never use blocking_write here because this may run
        // inside an async context (lazy tenant creation).
        for event in &events {
            match event {
                Event::ResourceCreated { config } => {
                    let rs = ResourceState::new(config.clone());
                    engine.state.insert(config.id, Arc::new(RwLock::new(rs)));
                }
                Event::ResourceDeleted { id } => {
                    if let Some((_, rs)) = engine.state.remove(id)
                        && let Ok(guard) = rs.try_read()
                    {
                        for b in &guard.bookings {
                            engine.booking_index.remove(&b.id);
                        }
                    }
                }
                other => {
                    if let Some(rs_arc) = engine.get_resource(&other.resource_id())
                        && let Ok(mut guard) = rs_arc.try_write()
                    {
                        apply_to_resource(&mut guard, other, &engine.booking_index);
                    }
                }
            }
        }

        tracing::debug!(
            events = events.len(),
            resources = engine.state.len(),
            bookings = engine.booking_index.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    /// Write events to the WAL via the background group-commit writer.
    /// All events in one call land in the same flush.
    pub(super) async fn wal_append_all(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append_all(vec![event.clone()]).await
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_index.get(booking_id).map(|e| *e.value())
    }

    /// WAL-append + apply + notify in one call.
    pub(super) async fn persist_and_apply(
        &self,
        resource_id: Ulid,
        rs: &mut ResourceState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_resource(rs, event, &self.booking_index);
        self.notify.send(resource_id, event);
        Ok(())
    }

    /// Write-lock a resource that is still in the catalog once the lock is held.
    ///
    /// `delete_resource` removes the entry while holding this same lock, so a writer
    /// that queued behind it would otherwise commit into a detached state.
    pub(super) async fn write_live_resource(
        &self,
        id: &Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ResourceState>, EngineError> {
        let rs = self.get_resource(id).ok_or(EngineError::NotFound(*id))?;
        let guard = rs.clone().write_owned().await;
        let live = self
            .state
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &rs));
        if !live {
            return Err(EngineError::NotFound(*id));
        }
        Ok(guard)
    }

    /// Lookup booking → resource, get resource, acquire write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<ResourceState>), EngineError> {
        let resource_id = self
            .get_resource_for_booking(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        let guard = self.write_live_resource(&resource_id).await?;
        // Deleted while we waited for the lock.
        if guard.booking(*booking_id).is_none() {
            return Err(EngineError::NotFound(*booking_id));
        }
        Ok((resource_id, guard))
    }
}
