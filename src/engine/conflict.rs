use std::collections::HashSet;

use rust_decimal::Decimal;

use crate::limits::*;
use crate::model::*;

use super::availability::{compute_occupied, max_allowed_duration};
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or_default()
}

pub(crate) fn validate_config(config: &ResourceConfig) -> Result<(), EngineError> {
    if let Some(ref n) = config.name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::invalid("resource name too long"));
    }
    if let Some(ref r) = config.room
        && r.len() > MAX_NAME_LEN
    {
        return Err(EngineError::invalid("room reference too long"));
    }
    if config.open < 0 || config.close > MINUTES_PER_DAY || config.open >= config.close {
        return Err(EngineError::invalid(format!(
            "operating hours {}-{} are not a valid range",
            format_clock(config.open),
            format_clock(config.close)
        )));
    }
    if config.granularity <= 0 {
        return Err(EngineError::invalid("slot granularity must be positive"));
    }
    if config.max_duration == 0 || config.max_duration > MAX_DURATION_HOURS {
        return Err(EngineError::invalid(format!(
            "max duration must be between 1 and {MAX_DURATION_HOURS} hours"
        )));
    }
    if config.price_per_unit_hour.is_sign_negative() {
        return Err(EngineError::invalid("price must not be negative"));
    }
    if config.sub_units.len() > MAX_SUB_UNITS {
        return Err(EngineError::invalid("too many sub-units"));
    }
    let mut seen = HashSet::new();
    for unit in &config.sub_units {
        if unit.is_empty() || unit.len() > MAX_SUB_UNIT_ID_LEN {
            return Err(EngineError::invalid(format!("bad sub-unit id: {unit:?}")));
        }
        if unit == WHOLE_RESOURCE_UNIT {
            return Err(EngineError::invalid(format!("sub-unit id {WHOLE_RESOURCE_UNIT} is reserved")));
        }
        if !seen.insert(unit.as_str()) {
            return Err(EngineError::invalid(format!("duplicate sub-unit id: {unit}")));
        }
    }
    if let Some(ref slots) = config.slots {
        if slots.is_empty() || slots.len() > MAX_EXPLICIT_SLOTS {
            return Err(EngineError::invalid(format!(
                "explicit slot list must have 1 to {MAX_EXPLICIT_SLOTS} entries"
            )));
        }
        if let Some(bad) = slots.iter().find(|s| **s < config.open || **s >= config.close) {
            return Err(EngineError::invalid(format!(
                "slot {} is outside operating hours",
                format_clock(*bad)
            )));
        }
    }
    Ok(())
}

fn validate_customer(customer: &Customer) -> Result<(), EngineError> {
    if customer.name.trim().is_empty() {
        return Err(EngineError::invalid("customer name is required"));
    }
    let email = customer.email.as_deref().map(str::trim).unwrap_or_default();
    let phone = customer.phone.as_deref().map(str::trim).unwrap_or_default();
    if email.is_empty() && phone.is_empty() {
        return Err(EngineError::invalid("customer email or phone is required"));
    }
    if customer.name.len() > MAX_CUSTOMER_FIELD_LEN
        || email.len() > MAX_CUSTOMER_FIELD_LEN
        || phone.len() > MAX_CUSTOMER_FIELD_LEN
    {
        return Err(EngineError::invalid("customer field too long"));
    }
    Ok(())
}

/// Check the window and sub-units of a request against the catalog and price it.
/// Strips an explicit `ALL` from whole-resource requests.
pub(crate) fn price_request(config: &ResourceConfig, req: &mut BookingRequest) -> Result<Decimal, EngineError> {
    if req.duration == 0 {
        return Err(EngineError::invalid("duration must be at least 1 hour"));
    }
    if req.start < config.open || req.start >= config.close {
        return Err(EngineError::invalid(format!(
            "start {} is outside operating hours {}-{}",
            format_clock(req.start),
            format_clock(config.open),
            format_clock(config.close)
        )));
    }
    if !config.is_offered_start(req.start) {
        return Err(EngineError::invalid(format!(
            "start {} is not an offered slot",
            format_clock(req.start)
        )));
    }
    let max = max_allowed_duration(config, req.start);
    if req.duration > max {
        return Err(EngineError::invalid(format!(
            "duration {}h exceeds max {max}h at {}",
            req.duration,
            format_clock(req.start)
        )));
    }
    // Hour-based max duration can still overshoot close from a half-hour start.
    if req.span().end > config.close {
        return Err(EngineError::invalid(format!(
            "booking {}-{} runs past closing time {}",
            format_clock(req.start),
            format_clock(req.span().end),
            format_clock(config.close)
        )));
    }

    if config.is_seat_level() {
        if req.sub_unit_ids.is_empty() {
            return Err(EngineError::invalid("at least one sub-unit is required"));
        }
        if req.sub_unit_ids.len() > MAX_SUB_UNITS {
            return Err(EngineError::invalid("too many sub-units"));
        }
        let mut seen = HashSet::new();
        for unit in &req.sub_unit_ids {
            if !config.has_sub_unit(unit) {
                return Err(EngineError::invalid(format!("unknown sub-unit: {unit}")));
            }
            if !seen.insert(unit.as_str()) {
                return Err(EngineError::invalid(format!("sub-unit listed twice: {unit}")));
            }
        }
    } else {
        // Whole-resource bookings may name the pseudo-unit explicitly.
        req.sub_unit_ids.retain(|u| u != WHOLE_RESOURCE_UNIT);
        if !req.sub_unit_ids.is_empty() {
            return Err(EngineError::invalid("resource has no sub-units"));
        }
    }

    Ok(price(config, req.sub_unit_ids.len().max(1), req.duration))
}

/// Validate a request against the catalog and build the record it would commit.
/// Pricing and initial statuses are decided here and frozen on the booking.
pub(crate) fn prepare_booking(
    config: &ResourceConfig,
    mut req: BookingRequest,
    now: Ms,
) -> Result<Booking, EngineError> {
    let total_price = price_request(config, &mut req)?;
    validate_customer(&req.customer)?;

    let status = match req.status {
        None | Some(BookingStatus::Pending) => BookingStatus::Pending,
        Some(BookingStatus::Confirmed) => BookingStatus::Confirmed,
        Some(other) => {
            return Err(EngineError::invalid(format!(
                "initial status must be pending or confirmed, got {other}"
            )));
        }
    };

    let (status, payment_status) = if total_price.is_zero() {
        (BookingStatus::Confirmed, PaymentStatus::Completed)
    } else {
        (status, PaymentStatus::Pending)
    };

    Ok(Booking {
        id: req.id,
        resource_id: config.id,
        sub_unit_ids: req.sub_unit_ids,
        date: req.date,
        start: req.start,
        duration: req.duration,
        total_price,
        customer: req.customer,
        status,
        payment_status,
        created_at: now,
    })
}

/// `units * price_per_unit_hour * hours`.
pub(crate) fn price(config: &ResourceConfig, units: usize, hours: u32) -> Decimal {
    config.price_per_unit_hour * Decimal::from(units as u64) * Decimal::from(hours)
}

/// Commit-time occupancy check.
///
/// The candidate's own trailing buffer is included, so two bookings on a shared
/// unit always satisfy `a.end + buffer <= b.start || b.end + buffer <= a.start`.
pub(crate) fn check_no_conflict(rs: &ResourceState, booking: &Booking) -> Result<(), EngineError> {
    let occupied = compute_occupied(rs, booking.date, &booking.occupied_span());
    let clashes: Vec<String> = booking
        .units()
        .into_iter()
        .filter(|u| occupied.contains(*u))
        .map(str::to_string)
        .collect();
    if clashes.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict { units: clashes })
    }
}

/// Bookings committed together must not collide with each other either.
pub(crate) fn check_batch_disjoint(batch: &[Booking]) -> Result<(), EngineError> {
    for (i, a) in batch.iter().enumerate() {
        for b in &batch[i + 1..] {
            if a.resource_id != b.resource_id || a.date != b.date {
                continue;
            }
            let collide = a.occupied_span().overlaps(&b.span()) || b.occupied_span().overlaps(&a.span());
            if !collide {
                continue;
            }
            let b_units = b.units();
            let shared: Vec<String> = a
                .units()
                .into_iter()
                .filter(|u| b_units.contains(u))
                .map(str::to_string)
                .collect();
            if !shared.is_empty() {
                return Err(EngineError::Conflict { units: shared });
            }
        }
    }
    Ok(())
}
