/// Hard caps on sizes accepted from clients. Exceeding one yields
/// `EngineError::LimitExceeded`.

pub const MAX_FACILITIES: usize = 10_000;
pub const MAX_FACILITY_NAME_LEN: usize = 255;

pub const MAX_BOOKINGS_PER_FACILITY: usize = 200_000;
pub const MAX_COLOR_LEN: usize = 32;
pub const MAX_REQUESTER_NAME_LEN: usize = 255;
pub const MAX_REQUESTER_PHONE_LEN: usize = 20;
pub const MAX_ACTIVITY_LEN: usize = 4096;
pub const MAX_OWNER_LEN: usize = 255;

/// Upper bound on occurrences produced by one recurring request.
pub const MAX_SERIES_LEN: usize = 1000;
pub const MAX_RECURRENCE_INTERVAL: u32 = 366;
