use std::collections::BTreeSet;

use chrono::NaiveDate;

use crate::model::*;

// ── Availability Algorithm ────────────────────────────────────────

/// Units held by a non-cancelled booking on `date` whose buffered span
/// `[start, end + buffer)` overlaps `query`.
///
/// Only the existing booking's trailing buffer counts here; the candidate is
/// compared by its plain span. Whole-resource bookings report `ALL`.
pub fn compute_occupied(resource: &ResourceState, date: NaiveDate, query: &Span) -> BTreeSet<String> {
    let mut occupied = BTreeSet::new();
    for booking in resource.overlapping(date, query) {
        if !booking.blocks_units() {
            continue;
        }
        if booking.occupied_span().overlaps(query) {
            occupied.extend(booking.units().into_iter().map(str::to_string));
        }
    }
    occupied
}

/// `min(max_duration, max(1, close_hour - start_hour))`.
///
/// Advisory for clients; the commit path re-checks it.
pub fn max_allowed_duration(config: &ResourceConfig, start: Minute) -> u32 {
    let close_hour = config.close / 60;
    let start_hour = start / 60;
    let until_close = (close_hour - start_hour).max(1) as u32;
    config.max_duration.min(until_close)
}

/// Occupancy of every unit of the resource for one candidate window.
pub fn snapshot(resource: &ResourceState, date: NaiveDate, start: Minute, duration: u32) -> AvailabilitySnapshot {
    let span = Span::from_hours(start, duration);
    AvailabilitySnapshot {
        resource_id: resource.id(),
        date,
        span,
        units: resource.config.unit_ids(),
        occupied: compute_occupied(resource, date, &span),
        max_duration: max_allowed_duration(&resource.config, start),
    }
}

/// Every offered start slot on `date`, with the requested duration clamped to
/// what the slot allows, and how many units are free for it.
pub fn slot_table(resource: &ResourceState, date: NaiveDate, duration: u32) -> Vec<SlotInfo> {
    let total_units = resource.config.unit_ids().len();
    resource
        .config
        .offered_slots()
        .into_iter()
        .map(|start| {
            let max_duration = max_allowed_duration(&resource.config, start);
            let span = Span::from_hours(start, duration.clamp(1, max_duration.max(1)));
            let occupied = compute_occupied(resource, date, &span);
            SlotInfo {
                start,
                max_duration,
                free_units: total_units.saturating_sub(occupied.len()),
            }
        })
        .collect()
}
