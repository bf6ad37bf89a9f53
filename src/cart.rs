//! Caller-owned pending selection ("cart") and its atomic checkout.
//!
//! The engine never stores a selection. Callers stage items here, ask for a
//! quote as often as they like, and commit everything in one `checkout`.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::limits::MAX_BATCH_SIZE;
use crate::model::*;

/// One staged booking, not yet reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartItem {
    pub resource_id: Ulid,
    pub sub_unit_ids: Vec<String>,
    pub date: NaiveDate,
    pub start: Minute,
    pub duration: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingSelection {
    pub customer: Customer,
    lines: Vec<(Ulid, CartItem)>,
}

impl PendingSelection {
    pub fn new(customer: Customer) -> Self {
        Self {
            customer,
            lines: Vec::new(),
        }
    }

    /// Stage an item and return its line id.
    pub fn add(&mut self, item: CartItem) -> Result<Ulid, EngineError> {
        if self.lines.len() >= MAX_BATCH_SIZE {
            return Err(EngineError::Validation(format!(
                "selection is limited to {MAX_BATCH_SIZE} items"
            )));
        }
        let line_id = Ulid::new();
        self.lines.push((line_id, item));
        Ok(line_id)
    }

    pub fn remove(&mut self, line_id: Ulid) -> Option<CartItem> {
        let pos = self.lines.iter().position(|(id, _)| *id == line_id)?;
        Some(self.lines.remove(pos).1)
    }

    pub fn items(&self) -> impl Iterator<Item = (Ulid, &CartItem)> {
        self.lines.iter().map(|(id, item)| (*id, item))
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    fn requests(&self) -> Vec<BookingRequest> {
        self.lines
            .iter()
            .map(|(_, item)| BookingRequest {
                id: Ulid::new(),
                resource_id: item.resource_id,
                sub_unit_ids: item.sub_unit_ids.clone(),
                date: item.date,
                start: item.start,
                duration: item.duration,
                customer: self.customer.clone(),
                status: None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteLine {
    pub line_id: Ulid,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quote {
    pub lines: Vec<QuoteLine>,
    pub total: Decimal,
}

/// Price every staged item against the current catalog. Reserves nothing.
pub async fn quote(engine: &Engine, selection: &PendingSelection) -> Result<Quote, EngineError> {
    let mut lines = Vec::with_capacity(selection.len());
    for ((line_id, _), req) in selection.lines.iter().zip(selection.requests()) {
        lines.push(QuoteLine {
            line_id: *line_id,
            price: engine.quote(&req).await?,
        });
    }
    let total = lines.iter().map(|l| l.price).sum();
    Ok(Quote { lines, total })
}

/// Book every staged item or none of them. The selection is emptied only on success.
pub async fn checkout(engine: &Engine, selection: &mut PendingSelection) -> Result<Vec<Booking>, EngineError> {
    if selection.is_empty() {
        return Err(EngineError::Validation("selection is empty".into()));
    }
    let bookings = engine.create_bookings(selection.requests()).await?;
    tracing::info!(count = bookings.len(), customer = %selection.customer.name, "checkout completed");
    selection.clear();
    Ok(bookings)
}
