//! Hard limits enforced before any lock is taken.

/// Max line items in a single booking.
pub const MAX_LINE_ITEMS_PER_BOOKING: usize = 100;

/// Max quantity a single line item may request.
pub const MAX_QUANTITY_PER_LINE: u32 = 1_000_000;

/// Max days a single line item may span.
pub const MAX_RANGE_DAYS: i64 = 732;

/// Max length of an item name.
pub const MAX_NAME_LEN: usize = 256;

/// Max bookings returned per listing page.
pub const MAX_PAGE_SIZE: usize = 200;

/// Max length of a free-text search term.
pub const MAX_SEARCH_LEN: usize = 128;

/// Default wait for a booking or item lock before failing with a retriable conflict.
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;

/// Default number of booking-number draws before giving up.
pub const DEFAULT_BOOKING_NUMBER_ATTEMPTS: u32 = 5;

pub const DEFAULT_BOOKING_PREFIX: &str = "BK";
