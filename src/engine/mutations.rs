use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{RwLock, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_batch_disjoint, check_no_conflict, now_ms, prepare_booking, validate_config};
use super::{Engine, EngineError, SharedResourceState, WalCommand, apply_to_resource};

impl Engine {
    // ── Catalog (admin tooling) ──────────────────────────────

    pub async fn create_resource(&self, config: ResourceConfig) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        if self.state.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::invalid("too many resources"));
        }
        validate_config(&config)?;
        if self.state.contains_key(&config.id) {
            return Err(EngineError::invalid(format!("resource {} already exists", config.id)));
        }

        let id = config.id;
        let event = Event::ResourceCreated { config: config.clone() };
        self.wal_append(&event).await?;
        self.state.insert(id, Arc::new(RwLock::new(ResourceState::new(config))));
        self.notify.send(id, &event);
        info!(resource_id = %id, "resource created");
        Ok(())
    }

    /// Edit a resource's configuration. Existing bookings keep their frozen price.
    pub async fn update_resource(&self, id: Ulid, patch: ResourcePatch) -> Result<ResourceConfig, EngineError> {
        let mut guard = self.write_live_resource(&id).await?;

        let mut config = guard.config.clone();
        patch.apply(&mut config);
        validate_config(&config)?;

        let active: Vec<&Booking> = guard.bookings.iter().filter(|b| b.blocks_units()).collect();
        if !active.is_empty() {
            if config.is_seat_level() != guard.config.is_seat_level() {
                return Err(EngineError::invalid(
                    "cannot switch between seat-level and whole-resource while bookings are active",
                ));
            }
            if let Some(missing) = active
                .iter()
                .flat_map(|b| b.sub_unit_ids.iter())
                .find(|u| !config.has_sub_unit(u))
            {
                return Err(EngineError::invalid(format!(
                    "sub-unit {missing} is held by an active booking"
                )));
            }
        }

        let event = Event::ResourceUpdated { config: config.clone() };
        self.persist_and_apply(id, &mut guard, &event).await?;
        info!(resource_id = %id, "resource updated");
        Ok(config)
    }

    pub async fn delete_resource(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.write().await;
        if guard.has_active_bookings() {
            return Err(EngineError::invalid(format!(
                "resource {id} still has active bookings"
            )));
        }

        let event = Event::ResourceDeleted { id };
        self.wal_append(&event).await?;
        for b in &guard.bookings {
            self.booking_index.remove(&b.id);
        }
        self.state.remove(&id);
        drop(guard);
        self.notify.send(id, &event);
        self.notify.remove(&id);
        info!(resource_id = %id, "resource deleted");
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Validate, re-check occupancy and persist under the resource's write lock,
    /// so of two overlapping requests for the same unit exactly one commits.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let resource_id = req.resource_id;
        if self.get_resource(&resource_id).is_none() {
            return Err(EngineError::NotFound(resource_id));
        }
        let claim = IdClaim::take(&self.booking_index, [(req.id, resource_id)])?;

        let mut guard = self.write_live_resource(&resource_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_RESOURCE {
            return Err(EngineError::invalid("too many bookings on resource"));
        }
        let booking = prepare_booking(&guard.config, req, now_ms())?;
        if let Err(e) = check_no_conflict(&guard, &booking) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        let event = Event::BookingCreated { booking: booking.clone() };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        claim.commit();
        info!(
            booking_id = %booking.id,
            resource_id = %resource_id,
            date = %booking.date,
            start = %format_clock(booking.start),
            duration = booking.duration,
            status = %booking.status,
            "booking created"
        );
        Ok(booking)
    }

    /// Atomically create several bookings. All-or-nothing: if any request is
    /// invalid or conflicts (with stored bookings or with another request in the
    /// batch), none are committed. Requests may span different resources.
    pub async fn create_bookings(&self, requests: Vec<BookingRequest>) -> Result<Vec<Booking>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::invalid("batch too large"));
        }
        let claim = IdClaim::take(&self.booking_index, requests.iter().map(|r| (r.id, r.resource_id)))?;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut resource_ids: Vec<Ulid> = requests.iter().map(|r| r.resource_id).collect();
        resource_ids.sort();
        resource_ids.dedup();

        let mut guards = Vec::with_capacity(resource_ids.len());
        let mut rs_map = HashMap::new();
        for rid in &resource_ids {
            let guard = self.write_live_resource(rid).await?;
            if guard.bookings.len() + requests.len() > MAX_BOOKINGS_PER_RESOURCE {
                return Err(EngineError::invalid("too many bookings on resource"));
            }
            rs_map.insert(*rid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate everything against current state + intra-batch.
        let now = now_ms();
        let mut bookings = Vec::with_capacity(requests.len());
        for req in requests {
            let guard = &guards[rs_map[&req.resource_id]];
            let booking = prepare_booking(&guard.config, req, now)?;
            if let Err(e) = check_no_conflict(guard, &booking) {
                metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                return Err(e);
            }
            bookings.push(booking);
        }
        if let Err(e) = check_batch_disjoint(&bookings) {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(e);
        }

        // Phase 2: one WAL flush for the whole batch, then apply.
        let events: Vec<Event> = bookings
            .iter()
            .map(|b| Event::BookingCreated { booking: b.clone() })
            .collect();
        self.wal_append_all(events.clone()).await?;
        for event in &events {
            let resource_id = event.resource_id();
            let guard = &mut guards[rs_map[&resource_id]];
            apply_to_resource(guard, event, &self.booking_index);
            self.notify.send(resource_id, event);
        }
        claim.commit();
        info!(count = bookings.len(), "bookings created in batch");
        Ok(bookings)
    }

    /// Move a booking along the status machine. Terminal states reject everything.
    pub async fn transition_status(&self, id: Ulid, to: BookingStatus) -> Result<Booking, EngineError> {
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let from = guard.booking(id).ok_or(EngineError::NotFound(id))?.status;
        if !from.can_transition_to(to) {
            return Err(EngineError::InvalidTransition { from, to });
        }

        let event = Event::BookingStatusChanged { id, resource_id, status: to };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        info!(booking_id = %id, %from, %to, "booking status changed");
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Change payment status. Never touches the booking status, and is allowed
    /// in every booking status. Setting the current value is a no-op.
    pub async fn transition_payment(&self, id: Ulid, to: PaymentStatus) -> Result<Booking, EngineError> {
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let current = guard.booking(id).ok_or(EngineError::NotFound(id))?;
        if current.payment_status == to {
            return Ok(current.clone());
        }
        let from = current.payment_status;

        let event = Event::PaymentStatusChanged { id, resource_id, payment_status: to };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        info!(booking_id = %id, %from, %to, "payment status changed");
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Staff hard delete. Bypasses the status machine; the record is gone, not cancelled.
    pub async fn delete_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let (resource_id, mut guard) = self.resolve_booking_write(&id).await?;
        let removed = guard.booking(id).cloned().ok_or(EngineError::NotFound(id))?;

        let event = Event::BookingDeleted { id, resource_id };
        self.persist_and_apply(resource_id, &mut guard, &event).await?;
        warn!(
            target: "audit",
            booking_id = %id,
            resource_id = %resource_id,
            status = %removed.status,
            payment_status = %removed.payment_status,
            date = %removed.date,
            "booking hard-deleted"
        );
        Ok(removed)
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    ///
    /// The catalog lock and read locks on every resource are held until the swap
    /// completes, so no write can land in the old log after its state was captured.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        let mut arcs: Vec<(Ulid, SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        arcs.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(arcs.len());
        let mut events = Vec::new();
        for (_, rs) in arcs {
            let guard = rs.read_owned().await;
            events.push(Event::ResourceCreated { config: guard.config.clone() });
            for b in &guard.bookings {
                events.push(Event::BookingCreated { booking: b.clone() });
            }
            guards.push(guard);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
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

/// Booking ids reserved in the index ahead of commit, so two concurrent creates
/// with the same client-supplied id cannot both land. Released on drop unless
/// committed.
struct IdClaim<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    ids: Vec<Ulid>,
    committed: bool,
}

impl<'a> IdClaim<'a> {
    fn take(
        index: &'a DashMap<Ulid, Ulid>,
        bookings: impl IntoIterator<Item = (Ulid, Ulid)>,
    ) -> Result<Self, EngineError> {
        let mut claim = IdClaim { index, ids: Vec::new(), committed: false };
        for (id, resource_id) in bookings {
            let taken = match index.entry(id) {
                Entry::Occupied(_) => true,
                Entry::Vacant(slot) => {
                    slot.insert(resource_id);
                    false
                }
            };
            if taken {
                return Err(EngineError::invalid(format!("booking {id} already exists")));
            }
            claim.ids.push(id);
        }
        Ok(claim)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        if !self.committed {
            for id in &self.ids {
                self.index.remove(id);
            }
        }
    }
}
