//! Hard caps applied at the engine and tenant boundaries.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1_024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_DEVICE_TYPES_PER_TENANT: usize = 10_000;
pub const MAX_DEVICES_PER_TENANT: usize = 100_000;
pub const MAX_RESERVATIONS_PER_DEVICE: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// One year.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;

/// Thirty days of simulated run time.
pub const MAX_SIMULATION_TIME_SECS: i64 = 30 * 24 * 3_600;
