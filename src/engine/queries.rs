use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability;
use super::conflict::price_request;
use super::{Engine, EngineError, SharedResourceState};

impl Engine {
    pub async fn get_resource_config(&self, id: Ulid) -> Result<ResourceConfig, EngineError> {
        let rs = self.get_resource(&id).ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.config.clone())
    }

    /// All resource configurations, ordered by id.
    pub async fn list_resources(&self) -> Vec<ResourceConfig> {
        let mut configs = Vec::with_capacity(self.state.len());
        for rs in self.sorted_resources(None) {
            configs.push(rs.read().await.config.clone());
        }
        configs
    }

    /// Units held for `[start, start + duration)` on `date`, counting each
    /// existing booking's trailing buffer. Pure read; safe to poll.
    pub async fn compute_occupied(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        start: Minute,
        duration: u32,
    ) -> Result<BTreeSet<String>, EngineError> {
        let span = query_span(start, duration)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(availability::compute_occupied(&guard, date, &span))
    }

    pub async fn max_allowed_duration(&self, resource_id: Ulid, start: Minute) -> Result<u32, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(availability::max_allowed_duration(&guard.config, start))
    }

    /// Occupied set plus the duration clamp, read under one lock.
    pub async fn availability(
        &self,
        resource_id: Ulid,
        date: NaiveDate,
        start: Minute,
        duration: u32,
    ) -> Result<AvailabilitySnapshot, EngineError> {
        query_span(start, duration)?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(availability::snapshot(&guard, date, start, duration))
    }

    /// Offered start slots on `date` with free-unit counts.
    pub async fn slots(&self, resource_id: Ulid, date: NaiveDate, duration: u32) -> Result<Vec<SlotInfo>, EngineError> {
        if duration == 0 {
            return Err(EngineError::invalid("duration must be at least 1 hour"));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(availability::slot_table(&guard, date, duration))
    }

    /// Price a request against the current catalog without reserving anything.
    /// Occupancy and customer details are not checked.
    pub async fn quote(&self, req: &BookingRequest) -> Result<Decimal, EngineError> {
        let rs = self
            .get_resource(&req.resource_id)
            .ok_or(EngineError::NotFound(req.resource_id))?;
        let guard = rs.read().await;
        price_request(&guard.config, &mut req.clone())
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let resource_id = self
            .get_resource_for_booking(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        guard.booking(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Bookings matching `filter`, ordered chronologically or newest first.
    ///
    /// Read locks on every involved resource are taken in id order and held
    /// together, so the result is one consistent snapshot.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Result<Vec<Booking>, EngineError> {
        let needle = match filter.search.as_deref().map(str::trim) {
            Some(s) if s.len() > MAX_SEARCH_LEN => {
                return Err(EngineError::invalid("search text too long"));
            }
            Some(s) if !s.is_empty() => Some(s.to_lowercase()),
            _ => None,
        };
        if let Some(rid) = filter.resource_id
            && !self.state.contains_key(&rid)
        {
            return Err(EngineError::NotFound(rid));
        }

        let mut guards = Vec::new();
        for rs in self.sorted_resources(filter.resource_id) {
            guards.push(rs.read_owned().await);
        }

        let mut out: Vec<Booking> = guards
            .iter()
            .flat_map(|g| g.bookings.iter())
            .filter(|b| filter.status.is_none_or(|s| b.status == s))
            .filter(|b| filter.date.is_none_or(|d| b.date == d))
            .filter(|b| needle.as_deref().is_none_or(|n| b.customer.matches(n)))
            .cloned()
            .collect();
        drop(guards);

        out.sort_by(|a, b| booking_order(a, b, filter.order));
        Ok(out)
    }

    /// Resource handles sorted by id; optionally just one.
    fn sorted_resources(&self, only: Option<Ulid>) -> Vec<SharedResourceState> {
        let mut arcs: Vec<(Ulid, SharedResourceState)> = self
            .state
            .iter()
            .filter(|e| only.is_none_or(|id| *e.key() == id))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        arcs.sort_by_key(|(id, _)| *id);
        arcs.into_iter().map(|(_, rs)| rs).collect()
    }
}

fn query_span(start: Minute, duration: u32) -> Result<Span, EngineError> {
    if duration == 0 {
        return Err(EngineError::invalid("duration must be at least 1 hour"));
    }
    if !(0..MINUTES_PER_DAY).contains(&start) {
        return Err(EngineError::invalid(format!("start {start} is not a time of day")));
    }
    if duration > MAX_DURATION_HOURS {
        return Err(EngineError::invalid("duration too long"));
    }
    Ok(Span::from_hours(start, duration))
}

fn booking_order(a: &Booking, b: &Booking, order: SortOrder) -> Ordering {
    let key = |x: &Booking| (x.date, x.start);
    match order {
        SortOrder::Chronological => key(a).cmp(&key(b)).then(a.id.cmp(&b.id)),
        SortOrder::NewestFirst => key(b).cmp(&key(a)).then(b.id.cmp(&a.id)),
    }
}
