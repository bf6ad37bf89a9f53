use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Timelike};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{CLEANUP_BUFFER_MIN, MINUTES_PER_DAY, WHOLE_RESOURCE_UNIT};

/// Unix milliseconds. Only used for record timestamps.
pub type Ms = i64;

/// Minutes since midnight. The only time-of-day type.
pub type Minute = i32;

/// Parse `HH:MM` into minutes since midnight. `24:00` is accepted as end of day.
pub fn parse_clock(s: &str) -> Option<Minute> {
    let s = s.trim();
    if s == "24:00" {
        return Some(MINUTES_PER_DAY);
    }
    let t = NaiveTime::parse_from_str(s, "%H:%M").ok()?;
    Some((t.hour() * 60 + t.minute()) as Minute)
}

pub fn format_clock(m: Minute) -> String {
    format!("{:02}:{:02}", m / 60, m % 60)
}

/// Half-open interval `[start, end)` within a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `[start, start + hours)`.
    pub fn from_hours(start: Minute, hours: u32) -> Self {
        Self::new(start, start + hours as Minute * 60)
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Same start, end pushed out by `minutes`.
    pub fn extended(&self, minutes: Minute) -> Span {
        Span::new(self.start, self.end + minutes)
    }
}

/// A span on one resource and one calendar date. Different dates never overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
}

impl Window {
    pub fn overlaps(&self, other: &Window) -> bool {
        self.resource_id == other.resource_id
            && self.date == other.date
            && self.span.overlaps(&other.span)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

/// Configuration of a bookable resource. Read-only to the reservation path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub id: Ulid,
    pub name: Option<String>,
    /// Room reference for room-level resources.
    pub room: Option<String>,
    pub open: Minute,
    pub close: Minute,
    /// Spacing of generated start slots, in minutes.
    pub granularity: Minute,
    /// Explicit start slots; overrides generation from open/close.
    pub slots: Option<Vec<Minute>>,
    /// Max booking length in hours.
    pub max_duration: u32,
    pub price_per_unit_hour: Decimal,
    /// Individually bookable seats. Empty for whole-resource booking.
    pub sub_units: Vec<String>,
}

impl ResourceConfig {
    pub fn is_seat_level(&self) -> bool {
        !self.sub_units.is_empty()
    }

    /// Every unit occupancy is tracked for: the seats, or the single `ALL` pseudo-unit.
    pub fn unit_ids(&self) -> Vec<String> {
        if self.is_seat_level() {
            self.sub_units.clone()
        } else {
            vec![WHOLE_RESOURCE_UNIT.to_string()]
        }
    }

    pub fn has_sub_unit(&self, id: &str) -> bool {
        self.sub_units.iter().any(|u| u == id)
    }

    /// Start times offered to customers, ascending.
    pub fn offered_slots(&self) -> Vec<Minute> {
        if let Some(slots) = &self.slots {
            let mut slots = slots.clone();
            slots.sort_unstable();
            slots.dedup();
            return slots;
        }
        if self.granularity <= 0 {
            return Vec::new();
        }
        (self.open..self.close)
            .step_by(self.granularity as usize)
            .collect()
    }

    pub fn is_offered_start(&self, start: Minute) -> bool {
        match &self.slots {
            Some(slots) => slots.contains(&start),
            None => {
                self.granularity > 0
                    && start >= self.open
                    && start < self.close
                    && (start - self.open) % self.granularity == 0
            }
        }
    }
}

/// Partial edit of a [`ResourceConfig`]. `None` leaves a field unchanged;
/// nullable fields use `Some(None)` to clear.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourcePatch {
    pub name: Option<Option<String>>,
    pub room: Option<Option<String>>,
    pub open: Option<Minute>,
    pub close: Option<Minute>,
    pub granularity: Option<Minute>,
    pub slots: Option<Option<Vec<Minute>>>,
    pub max_duration: Option<u32>,
    pub price_per_unit_hour: Option<Decimal>,
    pub sub_units: Option<Vec<String>>,
}

impl ResourcePatch {
    pub fn is_empty(&self) -> bool {
        *self == ResourcePatch::default()
    }

    pub fn apply(&self, config: &mut ResourceConfig) {
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(room) = &self.room {
            config.room = room.clone();
        }
        if let Some(open) = self.open {
            config.open = open;
        }
        if let Some(close) = self.close {
            config.close = close;
        }
        if let Some(granularity) = self.granularity {
            config.granularity = granularity;
        }
        if let Some(slots) = &self.slots {
            config.slots = slots.clone();
        }
        if let Some(max_duration) = self.max_duration {
            config.max_duration = max_duration;
        }
        if let Some(price) = self.price_per_unit_hour {
            config.price_per_unit_hour = price;
        }
        if let Some(sub_units) = &self.sub_units {
            config.sub_units = sub_units.clone();
        }
    }
}

// ── Booking ──────────────────────────────────────────────────────

/// Contact snapshot frozen on the booking at creation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl Customer {
    /// Case-insensitive substring match over name, email and phone.
    /// `needle` must already be lowercase.
    pub fn matches(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(needle)
            || self
                .email
                .as_deref()
                .is_some_and(|e| e.to_lowercase().contains(needle))
            || self.phone.as_deref().is_some_and(|p| p.contains(needle))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// The status transition table. Anything not listed is rejected.
    pub fn can_transition_to(&self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

/// Money collection. Independent of [`BookingStatus`].
///
/// Unlike the booking status there is no transition table: besides
/// `pending <-> completed` and `-> failed`, a `failed` payment may go back to
/// `pending` or straight to `completed` when the charge is retried. Changes are
/// permitted on completed or cancelled bookings too (refund bookkeeping), so
/// `Engine::transition_payment` only ever fails with `NotFound` or `Storage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(PaymentStatus::Pending),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(format!("unknown payment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub resource_id: Ulid,
    /// Seat ids for seat-level bookings; empty for whole-resource bookings.
    pub sub_unit_ids: Vec<String>,
    pub date: NaiveDate,
    pub start: Minute,
    /// Whole hours.
    pub duration: u32,
    /// Frozen at creation.
    pub total_price: Decimal,
    pub customer: Customer,
    pub status: BookingStatus,
    pub payment_status: PaymentStatus,
    pub created_at: Ms,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_hours(self.start, self.duration)
    }

    pub fn end(&self) -> Minute {
        self.span().end
    }

    /// The span including the trailing cleanup buffer.
    pub fn occupied_span(&self) -> Span {
        self.span().extended(CLEANUP_BUFFER_MIN)
    }

    pub fn window(&self) -> Window {
        Window {
            resource_id: self.resource_id,
            date: self.date,
            span: self.span(),
        }
    }

    /// Units this booking occupies; `ALL` for whole-resource bookings.
    pub fn units(&self) -> Vec<&str> {
        if self.sub_unit_ids.is_empty() {
            vec![WHOLE_RESOURCE_UNIT]
        } else {
            self.sub_unit_ids.iter().map(String::as_str).collect()
        }
    }

    /// Cancelled bookings no longer hold their units.
    pub fn blocks_units(&self) -> bool {
        self.status != BookingStatus::Cancelled
    }
}

/// What a caller asks `create_booking` for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub sub_unit_ids: Vec<String>,
    pub date: NaiveDate,
    pub start: Minute,
    pub duration: u32,
    pub customer: Customer,
    /// Requested initial status; only `pending` or `confirmed` are accepted.
    pub status: Option<BookingStatus>,
}

impl BookingRequest {
    pub fn span(&self) -> Span {
        Span::from_hours(self.start, self.duration)
    }
}

// ── Per-resource state ───────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub config: ResourceConfig,
    /// All booking records (any status), sorted by `(date, start)`.
    pub bookings: Vec<Booking>,
}

impl ResourceState {
    pub fn new(config: ResourceConfig) -> Self {
        Self {
            config,
            bookings: Vec::new(),
        }
    }

    pub fn id(&self) -> Ulid {
        self.config.id
    }

    /// Insert booking maintaining sort order by `(date, start)`.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = (booking.date, booking.start);
        let pos = self
            .bookings
            .partition_point(|b| (b.date, b.start) <= key);
        self.bookings.insert(pos, booking);
    }

    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn has_active_bookings(&self) -> bool {
        self.bookings.iter().any(Booking::blocks_units)
    }

    /// Bookings on `date` whose buffered span overlaps `query`, any status.
    /// Binary search bounds the scan to that date and to starts before `query.end`.
    pub fn overlapping(&self, date: NaiveDate, query: &Span) -> impl Iterator<Item = &Booking> {
        let lo = self.bookings.partition_point(|b| b.date < date);
        let hi = self
            .bookings
            .partition_point(|b| (b.date, b.start) < (date, query.end));
        let query = *query;
        self.bookings[lo..hi.max(lo)]
            .iter()
            .filter(move |b| b.occupied_span().end > query.start)
    }
}

/// The event types, flat with no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        config: ResourceConfig,
    },
    ResourceUpdated {
        config: ResourceConfig,
    },
    ResourceDeleted {
        id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        status: BookingStatus,
    },
    PaymentStatusChanged {
        id: Ulid,
        resource_id: Ulid,
        payment_status: PaymentStatus,
    },
    BookingDeleted {
        id: Ulid,
        resource_id: Ulid,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { config } | Event::ResourceUpdated { config } => config.id,
            Event::ResourceDeleted { id } => *id,
            Event::BookingCreated { booking } => booking.resource_id,
            Event::BookingStatusChanged { resource_id, .. }
            | Event::PaymentStatusChanged { resource_id, .. }
            | Event::BookingDeleted { resource_id, .. } => *resource_id,
        }
    }
}

// ── Query types ──────────────────────────────────────────────────

/// Occupancy of one resource for one candidate window. Recomputed per query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilitySnapshot {
    pub resource_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    /// Every unit of the resource, in catalog order.
    pub units: Vec<String>,
    pub occupied: BTreeSet<String>,
    /// Advisory clamp for the candidate start.
    pub max_duration: u32,
}

impl AvailabilitySnapshot {
    pub fn free_units(&self) -> impl Iterator<Item = &String> {
        self.units.iter().filter(|u| !self.occupied.contains(*u))
    }
}

/// One offered start time and how many units are still free there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub start: Minute,
    pub max_duration: u32,
    pub free_units: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Date ascending, then start ascending.
    #[default]
    Chronological,
    /// Date descending, then start descending.
    NewestFirst,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub resource_id: Option<Ulid>,
    pub status: Option<BookingStatus>,
    pub date: Option<NaiveDate>,
    /// Free text over customer fields.
    pub search: Option<String>,
    pub order: SortOrder,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn config(sub_units: &[&str]) -> ResourceConfig {
        ResourceConfig {
            id: Ulid::new(),
            name: None,
            room: None,
            open: 14 * 60,
            close: 23 * 60,
            granularity: 60,
            slots: None,
            max_duration: 8,
            price_per_unit_hour: dec!(10),
            sub_units: sub_units.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn booking(resource_id: Ulid, day: &str, start: Minute, hours: u32) -> Booking {
        Booking {
            id: Ulid::new(),
            resource_id,
            sub_unit_ids: vec![],
            date: date(day),
            start,
            duration: hours,
            total_price: Decimal::ZERO,
            customer: Customer::default(),
            status: BookingStatus::Pending,
            payment_status: PaymentStatus::Pending,
            created_at: 0,
        }
    }

    #[test]
    fn clock_parsing() {
        assert_eq!(parse_clock("14:00"), Some(840));
        assert_eq!(parse_clock("09:30"), Some(570));
        assert_eq!(parse_clock("24:00"), Some(1440));
        assert_eq!(parse_clock("25:00"), None);
        assert_eq!(parse_clock("noon"), None);
        assert_eq!(format_clock(1205), "20:05");
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
        assert!(a.extended(5).overlaps(&c));
        assert_eq!(Span::from_hours(18 * 60, 2), Span::new(1080, 1200));
    }

    #[test]
    fn window_overlap_requires_same_date_and_resource() {
        let rid = Ulid::new();
        let a = Window { resource_id: rid, date: date("2025-06-01"), span: Span::new(60, 120) };
        let same_day = Window { span: Span::new(90, 150), ..a };
        let next_day = Window { date: date("2025-06-02"), ..same_day };
        let other_resource = Window { resource_id: Ulid::new(), ..same_day };
        assert!(a.overlaps(&same_day));
        assert!(!a.overlaps(&next_day));
        assert!(!a.overlaps(&other_resource));
    }

    #[test]
    fn status_transition_table() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Pending));
        for terminal in [Completed, Cancelled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Confirmed, Completed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn status_parsing() {
        assert_eq!("Confirmed".parse::<BookingStatus>(), Ok(BookingStatus::Confirmed));
        assert_eq!("canceled".parse::<BookingStatus>(), Ok(BookingStatus::Cancelled));
        assert!("done".parse::<BookingStatus>().is_err());
        assert_eq!("failed".parse::<PaymentStatus>(), Ok(PaymentStatus::Failed));
        assert!("refunded".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn generated_slots() {
        let cfg = config(&[]);
        let slots = cfg.offered_slots();
        assert_eq!(slots.first(), Some(&(14 * 60)));
        assert_eq!(slots.last(), Some(&(22 * 60)));
        assert_eq!(slots.len(), 9);
        assert!(cfg.is_offered_start(18 * 60));
        assert!(!cfg.is_offered_start(18 * 60 + 30));
        assert!(!cfg.is_offered_start(23 * 60));
    }

    #[test]
    fn explicit_slots_override_generation() {
        let mut cfg = config(&[]);
        cfg.slots = Some(vec![20 * 60, 15 * 60 + 30, 20 * 60]);
        assert_eq!(cfg.offered_slots(), vec![930, 1200]);
        assert!(cfg.is_offered_start(930));
        assert!(!cfg.is_offered_start(14 * 60));
    }

    #[test]
    fn whole_resource_uses_all_unit() {
        let cfg = config(&[]);
        assert_eq!(cfg.unit_ids(), vec!["ALL".to_string()]);
        let b = booking(cfg.id, "2025-06-01", 840, 1);
        assert_eq!(b.units(), vec!["ALL"]);

        let seats = config(&["C1", "C2"]);
        assert!(seats.is_seat_level());
        assert!(seats.has_sub_unit("C2"));
        assert!(!seats.has_sub_unit("ALL"));
    }

    #[test]
    fn bookings_kept_sorted() {
        let mut rs = ResourceState::new(config(&[]));
        let rid = rs.id();
        rs.insert_booking(booking(rid, "2025-06-02", 900, 1));
        rs.insert_booking(booking(rid, "2025-06-01", 1200, 1));
        rs.insert_booking(booking(rid, "2025-06-01", 900, 1));
        let keys: Vec<_> = rs.bookings.iter().map(|b| (b.date, b.start)).collect();
        assert_eq!(
            keys,
            vec![
                (date("2025-06-01"), 900),
                (date("2025-06-01"), 1200),
                (date("2025-06-02"), 900),
            ]
        );
    }

    #[test]
    fn overlapping_includes_buffer_and_skips_other_dates() {
        let mut rs = ResourceState::new(config(&[]));
        let rid = rs.id();
        // 18:00-20:00, buffered through 20:05
        rs.insert_booking(booking(rid, "2025-06-01", 18 * 60, 2));
        rs.insert_booking(booking(rid, "2025-06-02", 18 * 60, 2));

        let day = date("2025-06-01");
        assert_eq!(rs.overlapping(day, &Span::new(20 * 60, 21 * 60)).count(), 1);
        assert_eq!(rs.overlapping(day, &Span::new(20 * 60 + 5, 21 * 60)).count(), 0);
        assert_eq!(rs.overlapping(day, &Span::new(17 * 60, 18 * 60)).count(), 0);
        assert_eq!(rs.overlapping(date("2025-06-03"), &Span::new(0, 1440)).count(), 0);
    }

    #[test]
    fn remove_booking_returns_record() {
        let mut rs = ResourceState::new(config(&[]));
        let b = booking(rs.id(), "2025-06-01", 900, 1);
        let id = b.id;
        rs.insert_booking(b);
        assert!(rs.remove_booking(Ulid::new()).is_none());
        assert_eq!(rs.remove_booking(id).map(|b| b.id), Some(id));
        assert!(rs.bookings.is_empty());
    }

    #[test]
    fn customer_search() {
        let c = Customer {
            name: "Alice Kim".into(),
            email: Some("Alice@Example.com".into()),
            phone: Some("555-0101".into()),
        };
        assert!(c.matches("kim"));
        assert!(c.matches("example.com"));
        assert!(c.matches("0101"));
        assert!(!c.matches("bob"));
    }

    #[test]
    fn event_survives_wal_encoding() {
        let cfg = config(&["C1"]);
        let mut b = booking(cfg.id, "2025-06-01", 18 * 60, 2);
        b.total_price = dec!(20.50);
        let event = Event::BookingCreated { booking: b };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
