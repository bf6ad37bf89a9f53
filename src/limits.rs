use crate::model::Minute;

/// Minutes every booking keeps its sub-units occupied after it ends.
pub const CLEANUP_BUFFER_MIN: Minute = 5;

/// Pseudo sub-unit used for whole-resource bookings.
pub const WHOLE_RESOURCE_UNIT: &str = "ALL";

pub const MINUTES_PER_DAY: Minute = 24 * 60;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_RESOURCES_PER_TENANT: usize = 10_000;
pub const MAX_BOOKINGS_PER_RESOURCE: usize = 100_000;
pub const MAX_SUB_UNITS: usize = 512;
pub const MAX_EXPLICIT_SLOTS: usize = 288;
pub const MAX_DURATION_HOURS: u32 = 24;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_SUB_UNIT_ID_LEN: usize = 64;
pub const MAX_CUSTOMER_FIELD_LEN: usize = 256;
pub const MAX_SEARCH_LEN: usize = 256;

/// Max items committed by one cart checkout / multi-row INSERT.
pub const MAX_BATCH_SIZE: usize = 100;
