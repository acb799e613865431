use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, for audit timestamps only. Reservations are day-granular.
pub type Ms = i64;

/// Closed interval `[start, end]` of calendar days. Both boundary days are included,
/// so a range ending on the day another starts overlaps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Days between start and end, never less than one.
    pub fn total_days(&self) -> i64 {
        (self.end - self.start).num_days().max(1)
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains_day(&self, day: NaiveDate) -> bool {
        self.start <= day && day <= self.end
    }
}

// ── Actors ───────────────────────────────────────────────────────

/// Closed set of roles an upstream authenticator can resolve an actor to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Unauthenticated caller.
    Guest,
    User,
    Admin,
    SuperAdmin,
}

impl Role {
    pub const AUTHENTICATED: &'static [Role] = &[Role::User, Role::Admin, Role::SuperAdmin];
    pub const ADMINISTRATIVE: &'static [Role] = &[Role::Admin, Role::SuperAdmin];
}

/// The identity on whose behalf an operation runs. Every engine call takes one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn user(id: Ulid) -> Self {
        Self::new(id, Role::User)
    }

    pub fn admin(id: Ulid) -> Self {
        Self::new(id, Role::Admin)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Rejected,
    CancelledByUser,
    CancelledByAdmin,
    Deleted,
}

impl BookingStatus {
    /// Statuses whose claims count toward overlap sums.
    pub const ACTIVE: &'static [BookingStatus] = &[BookingStatus::Pending, BookingStatus::Confirmed];

    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Rejected => "rejected",
            BookingStatus::CancelledByUser => "cancelled_by_user",
            BookingStatus::CancelledByAdmin => "cancelled_by_admin",
            BookingStatus::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested line as supplied by the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineItemRequest {
    pub item_id: Ulid,
    pub quantity: u32,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

impl LineItemRequest {
    pub fn new(item_id: Ulid, quantity: u32, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            item_id,
            quantity,
            start_date,
            end_date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub item_id: Ulid,
    /// Copied from the item when the line was inserted.
    pub location_id: Ulid,
    pub quantity: u32,
    pub range: DateRange,
    pub total_days: i64,
    pub status: BookingStatus,
}

impl LineItem {
    pub fn claim(&self) -> Claim {
        Claim {
            line_item_id: self.id,
            booking_id: self.booking_id,
            range: self.range,
            quantity: self.quantity,
            status: self.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub booking_number: String,
    pub owner_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub picked_up: bool,
    pub returned: bool,
    pub line_items: Vec<LineItem>,
}

impl Booking {
    /// Distinct item ids referenced by the line items, ascending.
    pub fn item_ids(&self) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = self.line_items.iter().map(|l| l.item_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// True while this booking's quantities are subtracted from the items' cached counts:
    /// from confirmation until the items are returned, or until a cancellation that
    /// happens before pickup.
    pub fn holds_stock(&self) -> bool {
        !self.returned && (self.status == BookingStatus::Confirmed || self.picked_up)
    }

    pub fn earliest_start(&self) -> Option<NaiveDate> {
        self.line_items.iter().map(|l| l.range.start).min()
    }
}

// ── Inventory + ledger ───────────────────────────────────────────

/// One line item's contribution to overlap accounting on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub line_item_id: Ulid,
    pub booking_id: Ulid,
    pub range: DateRange,
    pub quantity: u32,
    pub status: BookingStatus,
}

#[derive(Debug, Clone)]
pub struct ItemState {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: Option<String>,
    pub total_quantity: u32,
    /// Cached physical stock on hand. The ledger stays authoritative for reservations.
    pub available_quantity: u32,
    /// Every claim ever placed on this item, sorted by `range.start`. Terminal claims are
    /// kept for audit and skipped by status filters.
    pub claims: Vec<Claim>,
}

impl ItemState {
    pub fn new(id: Ulid, location_id: Ulid, name: Option<String>, total_quantity: u32) -> Self {
        Self {
            id,
            location_id,
            name,
            total_quantity,
            available_quantity: total_quantity,
            claims: Vec::new(),
        }
    }

    /// Insert claim maintaining sort order by range.start.
    pub fn insert_claim(&mut self, claim: Claim) {
        let pos = self
            .claims
            .partition_point(|c| c.range.start <= claim.range.start);
        self.claims.insert(pos, claim);
    }

    /// Remove every claim belonging to `booking_id`, returning them.
    pub fn remove_claims(&mut self, booking_id: Ulid) -> Vec<Claim> {
        let mut removed = Vec::new();
        self.claims.retain(|c| {
            if c.booking_id == booking_id {
                removed.push(c.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn set_claim_status(&mut self, booking_id: Ulid, status: BookingStatus) {
        for claim in self.claims.iter_mut().filter(|c| c.booking_id == booking_id) {
            claim.status = status;
        }
    }

    /// Claims whose range intersects the query, regardless of status.
    /// Binary search skips claims starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Claim> {
        let right_bound = self.claims.partition_point(|c| c.range.start <= query.end);
        self.claims[..right_bound]
            .iter()
            .filter(move |c| c.range.end >= query.start)
    }

    /// Sum of quantities over overlapping claims with a status in `statuses`.
    /// Claims of `exclude` are skipped, which lets a booking be re-validated
    /// against everyone but itself.
    pub fn sum_overlapping(
        &self,
        query: &DateRange,
        statuses: &[BookingStatus],
        exclude: Option<Ulid>,
    ) -> u64 {
        self.overlapping(query)
            .filter(|c| statuses.contains(&c.status))
            .filter(|c| Some(c.booking_id) != exclude)
            .map(|c| c.quantity as u64)
            .sum()
    }
}

/// Cached stock level written by an event, replayed verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub item_id: Ulid,
    pub available_quantity: u32,
}

/// One event per committed operation. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ItemCreated {
        id: Ulid,
        location_id: Ulid,
        name: Option<String>,
        total_quantity: u32,
    },
    ItemCapacitySet {
        id: Ulid,
        total_quantity: u32,
        available_quantity: u32,
    },
    BookingCreated {
        booking: Booking,
    },
    LineItemsReplaced {
        booking_id: Ulid,
        line_items: Vec<LineItem>,
        stock: Vec<StockLevel>,
        at: Ms,
    },
    StatusChanged {
        booking_id: Ulid,
        status: BookingStatus,
        stock: Vec<StockLevel>,
        at: Ms,
    },
    PickupConfirmed {
        booking_id: Ulid,
        at: Ms,
    },
    ItemsReturned {
        booking_id: Ulid,
        stock: Vec<StockLevel>,
        at: Ms,
    },
}

impl Event {
    pub fn booking_id(&self) -> Option<Ulid> {
        match self {
            Event::BookingCreated { booking } => Some(booking.id),
            Event::LineItemsReplaced { booking_id, .. }
            | Event::StatusChanged { booking_id, .. }
            | Event::PickupConfirmed { booking_id, .. }
            | Event::ItemsReturned { booking_id, .. } => Some(*booking_id),
            Event::ItemCreated { .. } | Event::ItemCapacitySet { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub id: Ulid,
    pub location_id: Ulid,
    pub name: Option<String>,
    pub total_quantity: u32,
    pub available_quantity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub item_id: Ulid,
    pub range: DateRange,
    pub total_quantity: u32,
    /// Quantity already claimed by pending/confirmed bookings over the range.
    pub booked_quantity: u64,
    pub available_quantity: u32,
}

/// Diagnostic view of one item's ledger and cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemAudit {
    pub item_id: Ulid,
    pub total_quantity: u32,
    pub cached_available: u32,
    /// What the cache should read given the bookings currently holding stock.
    pub expected_available: u32,
    /// Highest single-day sum of active claims, and the first day it occurs.
    pub peak_claimed: u64,
    pub peak_day: Option<NaiveDate>,
    pub active_claims: usize,
    pub retained_claims: usize,
}

impl ItemAudit {
    pub fn oversold(&self) -> bool {
        self.peak_claimed > self.total_quantity as u64
    }

    pub fn cache_drift(&self) -> bool {
        self.cached_available != self.expected_available
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    CreatedAt,
    BookingNumber,
    Status,
    StartDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Paging, ordering and filtering for booking listings. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingQuery {
    pub page: usize,
    pub per_page: usize,
    pub sort: SortField,
    pub order: SortOrder,
    pub status: Option<BookingStatus>,
    pub search: Option<String>,
}

impl Default for BookingQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            sort: SortField::default(),
            order: SortOrder::default(),
            status: None,
            search: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingPage {
    pub bookings: Vec<Booking>,
    /// Matching bookings before paging.
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
}
