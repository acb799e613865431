use chrono::{Days, NaiveDate};
use ulid::Ulid;

use crate::model::*;

// ── Availability ──────────────────────────────────────────────────

/// Free quantity of `item` over `range`: total capacity minus every active claim
/// intersecting the range. Claims of `exclude` are ignored.
pub fn availability(item: &ItemState, range: &DateRange, exclude: Option<Ulid>) -> Availability {
    let booked = item.sum_overlapping(range, BookingStatus::ACTIVE, exclude);
    if booked > item.total_quantity as u64
        && let Some(peak) = overbooked_peak(item, range, exclude)
    {
        tracing::warn!(item_id = %item.id, total = item.total_quantity, peak, "ledger claims exceed item capacity");
        metrics::counter!(crate::observability::CONSISTENCY_WARNINGS_TOTAL, "kind" => "overbooked")
            .increment(1);
    }
    Availability {
        item_id: item.id,
        range: *range,
        total_quantity: item.total_quantity,
        booked_quantity: booked,
        available_quantity: clamp_available(item.total_quantity, booked),
    }
}

/// `total - booked`, floored at zero.
pub fn clamp_available(total: u32, booked: u64) -> u32 {
    (total as u64).saturating_sub(booked) as u32
}

/// Single-day peak of the active claims touching `range`, when it exceeds capacity.
/// A range sum above capacity alone is not overbooking: claims on disjoint days add up
/// without ever sharing a day.
pub(crate) fn overbooked_peak(item: &ItemState, range: &DateRange, exclude: Option<Ulid>) -> Option<u64> {
    let (peak, _) = peak_usage(item.overlapping(range).filter(|c| Some(c.booking_id) != exclude));
    (peak > item.total_quantity as u64).then_some(peak)
}

/// Sweep-line over active claims: highest single-day usage and the first day it occurs.
/// Ranges are closed, so a claim stops counting the day after its end.
pub fn peak_usage<'a>(claims: impl IntoIterator<Item = &'a Claim>) -> (u64, Option<NaiveDate>) {
    let mut events: Vec<(NaiveDate, i64)> = Vec::new();
    for c in claims.into_iter().filter(|c| c.status.is_active()) {
        events.push((c.range.start, c.quantity as i64));
        // end + 1 day; NaiveDate::MAX has no successor, and nothing can start after it.
        if let Some(after) = c.range.end.checked_add_days(Days::new(1)) {
            events.push((after, -(c.quantity as i64)));
        }
    }
    // Releases before acquisitions on the same day.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current: i64 = 0;
    let mut peak: i64 = 0;
    let mut peak_day = None;
    for (day, delta) in events {
        current += delta;
        if current > peak {
            peak = current;
            peak_day = Some(day);
        }
    }
    (peak as u64, peak_day)
}
