use chrono::NaiveDate;
use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed request, rejected before any store access.
    InvalidInput(&'static str),
    InvalidRange {
        start: NaiveDate,
        end: NaiveDate,
    },
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// Actor is unauthenticated or lacks the required role.
    Unauthorized(&'static str),
    /// Actor does not own the booking, or its current status forbids the operation.
    Forbidden(String),
    InsufficientAvailability {
        item_id: Ulid,
        requested: u32,
        available: u32,
    },
    /// Lost a race (lock timeout, booking-number collisions). Safe to retry.
    Conflict(String),
    /// The durable write failed; nothing was applied. Safe to retry.
    StorageFailure(String),
}

impl EngineError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, EngineError::Conflict(_) | EngineError::StorageFailure(_))
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::InvalidRange { .. } => "invalid_range",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InsufficientAvailability { .. } => "insufficient_availability",
            EngineError::Conflict(_) => "conflict",
            EngineError::StorageFailure(_) => "storage_failure",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidRange { start, end } => {
                write!(f, "invalid date range: {start} is after {end}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InsufficientAvailability {
                item_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient availability for item {item_id}: requested {requested}, available {available}"
            ),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::StorageFailure(e) => write!(f, "storage failure: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
