use std::collections::BTreeMap;
use std::ops::Deref;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::availability;
use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn today() -> NaiveDate {
    chrono::Utc::now().date_naive()
}

/// A requested line after shape validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Line {
    pub item_id: Ulid,
    pub quantity: u32,
    pub range: DateRange,
}

impl From<&LineItem> for Line {
    fn from(li: &LineItem) -> Self {
        Self {
            item_id: li.item_id,
            quantity: li.quantity,
            range: li.range,
        }
    }
}

pub(crate) fn validate_range(start: NaiveDate, end: NaiveDate) -> Result<DateRange, EngineError> {
    if start > end {
        return Err(EngineError::InvalidRange { start, end });
    }
    let range = DateRange::new(start, end);
    if (end - start).num_days() > MAX_RANGE_DAYS {
        return Err(EngineError::InvalidInput("date range too wide"));
    }
    Ok(range)
}

/// Shape checks on a create/update payload. Runs before any lock is taken.
pub(crate) fn validate_requests(requests: &[LineItemRequest]) -> Result<Vec<Line>, EngineError> {
    if requests.is_empty() {
        return Err(EngineError::InvalidInput("booking needs at least one line item"));
    }
    if requests.len() > MAX_LINE_ITEMS_PER_BOOKING {
        return Err(EngineError::InvalidInput("too many line items"));
    }
    requests
        .iter()
        .map(|r| {
            if r.quantity == 0 {
                return Err(EngineError::InvalidInput("quantity must be positive"));
            }
            if r.quantity > MAX_QUANTITY_PER_LINE {
                return Err(EngineError::InvalidInput("quantity too large"));
            }
            let range = validate_range(r.start_date, r.end_date)?;
            Ok(Line {
                item_id: r.item_id,
                quantity: r.quantity,
                range,
            })
        })
        .collect()
}

/// Check every line against the ledger of its (locked) item. Other lines of the same
/// request on the same item count as already booked when their ranges overlap.
/// Claims of `exclude` are ignored so a booking can be re-validated against everyone
/// else. The first line that does not fit fails the whole request.
pub(crate) fn check_capacity<G: Deref<Target = ItemState>>(
    items: &BTreeMap<Ulid, G>,
    lines: &[Line],
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    for (i, line) in lines.iter().enumerate() {
        let item = items
            .get(&line.item_id)
            .ok_or(EngineError::NotFound(line.item_id))?;

        let siblings: u64 = lines
            .iter()
            .enumerate()
            .filter(|(j, other)| {
                *j != i && other.item_id == line.item_id && other.range.overlaps(&line.range)
            })
            .map(|(_, other)| other.quantity as u64)
            .sum();
        let free = availability(item, &line.range, exclude).available_quantity;
        let available = (free as u64).saturating_sub(siblings) as u32;

        if line.quantity > available {
            metrics::counter!(crate::observability::AVAILABILITY_REJECTIONS_TOTAL).increment(1);
            return Err(EngineError::InsufficientAvailability {
                item_id: line.item_id,
                requested: line.quantity,
                available,
            });
        }
    }
    Ok(())
}
