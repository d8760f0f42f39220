//! Hard per-tenant limits. Everything the wire can grow is bounded here.

use crate::model::Ms;

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_CATEGORIES_PER_TENANT: usize = 10_000;
pub const MAX_ASSETS_PER_TENANT: usize = 1_000_000;
pub const MAX_REQUESTS_PER_TENANT: usize = 5_000_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CODE_LEN: usize = 128;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_REASON_LEN: usize = 1024;

/// Active (BORROWED/IN_USE/OVERDUE) rows per asset unit. Released rows are not counted.
pub const MAX_INTERVALS_PER_ASSET: usize = 50_000;

/// Category lines on a single request.
pub const MAX_CATEGORY_LINES: usize = 64;
/// Units requested per category line.
pub const MAX_QUANTITY_PER_LINE: u32 = 10_000;
/// Units bound by a single allocation call.
pub const MAX_ALLOCATION_UNITS: usize = 10_000;

pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 9999-12-31T23:59:59.999Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;
/// Ten years.
pub const MAX_SPAN_DURATION_MS: Ms = 10 * 366 * 24 * 3_600_000;
