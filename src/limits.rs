use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// Longest single appointment: 12 hours.
pub const MAX_DURATION_MINUTES: u32 = 12 * 60;

/// Widest conflict/queue query: 31 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 31 * 24 * 3_600_000;

pub const MAX_WORKERS_PER_ASSIGNMENT: usize = 16;
pub const MAX_SERVICES_PER_BOOKING: usize = 32;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_REFERENCE_LEN: usize = 128;
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024;

/// Longest request line accepted on the wire.
pub const MAX_LINE_LEN: usize = 128 * 1024;
