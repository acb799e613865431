use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::availability::{availability, peak_usage};
use super::conflict::validate_range;
use super::lifecycle;
use super::{Engine, EngineError};

fn validate_query(query: &BookingQuery) -> Result<(), EngineError> {
    if query.page == 0 {
        return Err(EngineError::InvalidInput("page is 1-based"));
    }
    if query.per_page == 0 || query.per_page > MAX_PAGE_SIZE {
        return Err(EngineError::InvalidInput("per_page out of range"));
    }
    if query.search.as_ref().is_some_and(|s| s.len() > MAX_SEARCH_LEN) {
        return Err(EngineError::InvalidInput("search term too long"));
    }
    Ok(())
}

fn sort_bookings(bookings: &mut [Booking], field: SortField, order: SortOrder) {
    bookings.sort_by(|a, b| {
        let ord = match field {
            SortField::CreatedAt => a.created_at.cmp(&b.created_at),
            SortField::BookingNumber => a.booking_number.cmp(&b.booking_number),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
            SortField::StartDate => a.earliest_start().cmp(&b.earliest_start()),
        }
        .then(a.id.cmp(&b.id));
        match order {
            SortOrder::Asc => ord,
            SortOrder::Desc => ord.reverse(),
        }
    });
}

impl Engine {
    /// Free quantity of an item over `[start, end]`, with what is already booked.
    pub async fn check_availability(
        &self,
        item_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Availability, EngineError> {
        let range = validate_range(start, end)?;
        let item = self.item_handle(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = self.timed(item.read(), || format!("item {item_id}")).await?;
        Ok(availability(&guard, &range, None))
    }

    /// Ledger primitive: summed quantity of claims on `item_id` intersecting
    /// `[start, end]` whose status is in `statuses`.
    pub async fn sum_overlapping(
        &self,
        item_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
        statuses: &[BookingStatus],
    ) -> Result<u64, EngineError> {
        let range = validate_range(start, end)?;
        let item = self.item_handle(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = self.timed(item.read(), || format!("item {item_id}")).await?;
        Ok(guard.sum_overlapping(&range, statuses, None))
    }

    /// Every claim ever placed on the item, terminal ones included, by start date.
    pub async fn list_claims(&self, item_id: Ulid) -> Result<Vec<Claim>, EngineError> {
        let item = self.item_handle(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = self.timed(item.read(), || format!("item {item_id}")).await?;
        Ok(guard.claims.clone())
    }

    pub async fn get_item(&self, item_id: Ulid) -> Result<ItemInfo, EngineError> {
        let item = self.item_handle(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let guard = self.timed(item.read(), || format!("item {item_id}")).await?;
        Ok(ItemInfo {
            id: guard.id,
            location_id: guard.location_id,
            name: guard.name.clone(),
            total_quantity: guard.total_quantity,
            available_quantity: guard.available_quantity,
        })
    }

    pub async fn list_items(&self) -> Result<Vec<ItemInfo>, EngineError> {
        let mut ids: Vec<Ulid> = self.items.iter().map(|e| *e.key()).collect();
        ids.sort();
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.get_item(id).await?);
        }
        Ok(out)
    }

    /// Booking as seen by its owner or an administrator.
    pub async fn get_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        let shared = self
            .booking_handle(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let guard = self
            .timed(shared.read(), || format!("booking {booking_id}"))
            .await?;
        lifecycle::authorize_owner_or_admin(&*self.policy, actor, &guard).await?;
        Ok(guard.clone())
    }

    /// Bookings owned by `user_id`. Users may list their own; administrators anyone's.
    pub async fn list_bookings_for_user(
        &self,
        actor: &Actor,
        user_id: Ulid,
        query: &BookingQuery,
    ) -> Result<BookingPage, EngineError> {
        validate_query(query)?;
        if !self.policy.has_role(actor, Role::AUTHENTICATED).await {
            return Err(EngineError::Unauthorized("authentication required"));
        }
        if actor.id != user_id && !self.policy.has_role(actor, Role::ADMINISTRATIVE).await {
            return Err(EngineError::Forbidden(format!(
                "actor {} may not list bookings of {user_id}",
                actor.id
            )));
        }
        let ids = self
            .owners
            .get(&user_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let bookings = self.snapshot_bookings(ids).await?;
        self.page(bookings, query).await
    }

    /// Every booking, for administrators.
    pub async fn list_all_bookings(&self, actor: &Actor, query: &BookingQuery) -> Result<BookingPage, EngineError> {
        validate_query(query)?;
        if !self.policy.has_role(actor, Role::ADMINISTRATIVE).await {
            return Err(EngineError::Unauthorized("administrative role required"));
        }
        let ids: Vec<Ulid> = self.bookings.iter().map(|e| *e.key()).collect();
        let bookings = self.snapshot_bookings(ids).await?;
        self.page(bookings, query).await
    }

    /// Clone each booking under its own read lock, one at a time.
    async fn snapshot_bookings(&self, ids: Vec<Ulid>) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(shared) = self.booking_handle(&id) else { continue };
            let guard = self.timed(shared.read(), || format!("booking {id}")).await?;
            out.push(guard.clone());
        }
        Ok(out)
    }

    /// Filter by status and search term, sort, then cut the requested page. The search
    /// matches booking numbers, owner ids and item names, case-insensitively.
    async fn page(&self, mut bookings: Vec<Booking>, query: &BookingQuery) -> Result<BookingPage, EngineError> {
        if let Some(status) = query.status {
            bookings.retain(|b| b.status == status);
        }

        if let Some(needle) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = needle.to_lowercase();
            let item_ids: BTreeSet<Ulid> = bookings
                .iter()
                .flat_map(|b| b.line_items.iter().map(|l| l.item_id))
                .collect();
            let mut names: HashMap<Ulid, String> = HashMap::new();
            for id in item_ids {
                let Some(item) = self.item_handle(&id) else { continue };
                let guard = self.timed(item.read(), || format!("item {id}")).await?;
                if let Some(name) = &guard.name {
                    names.insert(id, name.to_lowercase());
                }
            }
            bookings.retain(|b| {
                b.booking_number.to_lowercase().contains(&needle)
                    || b.owner_id.to_string().to_lowercase().contains(&needle)
                    || b.line_items
                        .iter()
                        .any(|l| names.get(&l.item_id).is_some_and(|n| n.contains(&needle)))
            });
        }

        sort_bookings(&mut bookings, query.sort, query.order);
        let total = bookings.len();
        let bookings = bookings
            .into_iter()
            .skip((query.page - 1) * query.per_page)
            .take(query.per_page)
            .collect();
        Ok(BookingPage {
            bookings,
            total,
            page: query.page,
            per_page: query.per_page,
        })
    }

    /// Diagnostic snapshot of one item: peak per-day usage against capacity, and the
    /// cached count against what the bookings holding stock imply. The ledger and the
    /// bookings are read one after the other, so under concurrent writes the two halves
    /// may come from slightly different moments.
    pub async fn audit_item(&self, item_id: Ulid) -> Result<ItemAudit, EngineError> {
        let (total, cached, claims) = {
            let item = self.item_handle(&item_id).ok_or(EngineError::NotFound(item_id))?;
            let guard = self.timed(item.read(), || format!("item {item_id}")).await?;
            (guard.total_quantity, guard.available_quantity, guard.claims.clone())
        };

        let (peak_claimed, peak_day) = peak_usage(&claims);
        let active_claims = claims.iter().filter(|c| c.status.is_active()).count();

        let booking_ids: BTreeSet<Ulid> = claims.iter().map(|c| c.booking_id).collect();
        let mut held: u64 = 0;
        for booking in self.snapshot_bookings(booking_ids.into_iter().collect()).await? {
            if booking.holds_stock() {
                held += booking
                    .line_items
                    .iter()
                    .filter(|l| l.item_id == item_id)
                    .map(|l| l.quantity as u64)
                    .sum::<u64>();
            }
        }

        Ok(ItemAudit {
            item_id,
            total_quantity: total,
            cached_available: cached,
            expected_available: (total as u64).saturating_sub(held) as u32,
            peak_claimed,
            peak_day,
            active_claims,
            retained_claims: claims.len() - active_claims,
        })
    }
}
