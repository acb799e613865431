use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_capacity, now_ms, validate_requests, Line};
use super::lifecycle::{self, next_status, Transition};
use super::{Engine, EngineError, ItemGuards, WalCommand};

/// Build line items for `booking_id`, copying each item's location.
fn build_line_items(
    booking_id: Ulid,
    lines: &[Line],
    items: &ItemGuards,
    status: BookingStatus,
) -> Result<Vec<LineItem>, EngineError> {
    lines
        .iter()
        .map(|line| {
            let item = items
                .get(&line.item_id)
                .ok_or(EngineError::NotFound(line.item_id))?;
            Ok(LineItem {
                id: Ulid::new(),
                booking_id,
                item_id: line.item_id,
                location_id: item.location_id,
                quantity: line.quantity,
                range: line.range,
                total_days: line.range.total_days(),
                status,
            })
        })
        .collect()
}

/// Cached stock levels after giving back `released` and taking `taken`.
/// Only items touched by either list appear in the result.
fn adjust_stock(items: &ItemGuards, released: &[LineItem], taken: &[LineItem]) -> Vec<StockLevel> {
    let mut levels: BTreeMap<Ulid, u32> = BTreeMap::new();
    for li in released {
        let Some(item) = items.get(&li.item_id) else { continue };
        let level = levels.entry(li.item_id).or_insert(item.available_quantity);
        *level = level.saturating_add(li.quantity).min(item.total_quantity);
    }
    for li in taken {
        let Some(item) = items.get(&li.item_id) else { continue };
        let level = levels.entry(li.item_id).or_insert(item.available_quantity);
        if *level < li.quantity {
            warn!(item_id = %li.item_id, cached = *level, taking = li.quantity, "cached stock below confirmed quantity");
            metrics::counter!(crate::observability::CONSISTENCY_WARNINGS_TOTAL, "kind" => "stock_cache")
                .increment(1);
        }
        *level = level.saturating_sub(li.quantity);
    }
    levels
        .into_iter()
        .map(|(item_id, available_quantity)| StockLevel {
            item_id,
            available_quantity,
        })
        .collect()
}

impl Engine {
    async fn require_admin(&self, actor: &Actor) -> Result<(), EngineError> {
        if self.policy.has_role(actor, Role::ADMINISTRATIVE).await {
            Ok(())
        } else {
            Err(EngineError::Unauthorized("administrative role required"))
        }
    }

    // ── Inventory ────────────────────────────────────────

    /// Register an item with its capacity. Inventory is owned elsewhere; this is how
    /// it is mirrored into the engine.
    pub async fn create_item(
        &self,
        actor: &Actor,
        id: Ulid,
        location_id: Ulid,
        name: Option<String>,
        total_quantity: u32,
    ) -> Result<(), EngineError> {
        self.run("create_item", async {
            self.require_admin(actor).await?;
            if let Some(ref n) = name
                && n.len() > MAX_NAME_LEN
            {
                return Err(EngineError::InvalidInput("item name too long"));
            }

            let shared = Arc::new(RwLock::new(ItemState::new(id, location_id, name.clone(), total_quantity)));
            // Hold the new item's lock until it is durable so nobody books against it early.
            let _guard = shared.clone().write_owned().await;
            match self.items.entry(id) {
                dashmap::mapref::entry::Entry::Occupied(_) => return Err(EngineError::AlreadyExists(id)),
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    slot.insert(shared.clone());
                }
            }

            let event = Event::ItemCreated {
                id,
                location_id,
                name,
                total_quantity,
            };
            if let Err(e) = self.wal_append(&event).await {
                self.items.remove_if(&id, |_, current| Arc::ptr_eq(current, &shared));
                return Err(e);
            }
            info!(%id, total_quantity, "item created");
            Ok(())
        })
        .await
    }

    /// Change an item's total capacity. The cached count moves by the same delta,
    /// clamped to `[0, total_quantity]`. Existing claims are left alone; any that no
    /// longer fit will fail re-validation at confirmation.
    pub async fn set_item_capacity(
        &self,
        actor: &Actor,
        item_id: Ulid,
        total_quantity: u32,
    ) -> Result<ItemInfo, EngineError> {
        self.run("set_item_capacity", async {
            self.require_admin(actor).await?;
            let mut items = self.lock_items([item_id]).await?;
            let item = items
                .get_mut(&item_id)
                .ok_or(EngineError::NotFound(item_id))?;

            let shifted = item.available_quantity as i64 + total_quantity as i64 - item.total_quantity as i64;
            let available_quantity = shifted.clamp(0, total_quantity as i64) as u32;

            let event = Event::ItemCapacitySet {
                id: item_id,
                total_quantity,
                available_quantity,
            };
            self.wal_append(&event).await?;
            item.total_quantity = total_quantity;
            item.available_quantity = available_quantity;

            let (peak, _) = super::peak_usage(&item.claims);
            if peak > total_quantity as u64 {
                warn!(%item_id, total_quantity, peak, "capacity lowered below existing claims");
            }
            info!(%item_id, total_quantity, available_quantity, "item capacity set");
            Ok(ItemInfo {
                id: item.id,
                location_id: item.location_id,
                name: item.name.clone(),
                total_quantity,
                available_quantity,
            })
        })
        .await
    }

    // ── Bookings ─────────────────────────────────────────

    /// Reserve every requested line or none of them. The actor becomes the owner.
    pub async fn create_booking(
        &self,
        actor: &Actor,
        requests: &[LineItemRequest],
    ) -> Result<Booking, EngineError> {
        self.run("create_booking", async {
            if !self.policy.has_role(actor, Role::AUTHENTICATED).await {
                return Err(EngineError::Unauthorized("authentication required"));
            }
            let lines = validate_requests(requests)?;

            let mut items = self.lock_items(lines.iter().map(|l| l.item_id)).await?;
            check_capacity(&items, &lines, None)?;

            let id = Ulid::new();
            let line_items = build_line_items(id, &lines, &items, BookingStatus::Pending)?;
            let booking_number = self.reserve_booking_number(id)?;
            let now = now_ms();
            let mut booking = Booking {
                id,
                booking_number,
                owner_id: actor.id,
                status: BookingStatus::Pending,
                created_at: now,
                updated_at: now,
                picked_up: false,
                returned: false,
                line_items,
            };

            let event = Event::BookingCreated {
                booking: booking.clone(),
            };
            if let Err(e) = self.commit(&mut booking, &mut items, &event).await {
                self.release_booking_number(&booking.booking_number);
                return Err(e);
            }
            // Index before the item locks drop, so every visible claim has a booking.
            self.index_booking(booking.clone());
            drop(items);

            info!(booking = %booking.booking_number, owner = %actor.id, lines = booking.line_items.len(), "booking created");
            Ok(booking)
        })
        .await
    }

    /// Re-check every line against the ledger as it is now, then confirm all of them
    /// and take the quantities out of the items' cached stock.
    pub async fn confirm_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.run("confirm_booking", async {
            let mut booking = self.lock_booking(booking_id).await?;
            lifecycle::authorize(&*self.policy, actor, &booking, Transition::Confirm).await?;
            let status = next_status(&booking, Transition::Confirm)?;

            let mut items = self.lock_items(booking.item_ids()).await?;
            let lines: Vec<Line> = booking.line_items.iter().map(Line::from).collect();
            check_capacity(&items, &lines, Some(booking_id))?;

            let event = Event::StatusChanged {
                booking_id,
                status,
                stock: adjust_stock(&items, &[], &booking.line_items),
                at: now_ms(),
            };
            self.commit(&mut booking, &mut items, &event).await?;
            info!(booking = %booking.booking_number, "booking confirmed");
            Ok(booking.clone())
        })
        .await
    }

    /// Replace every line item of a live booking. The new set is validated like a
    /// fresh request, against everyone's claims but this booking's own.
    pub async fn update_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        requests: &[LineItemRequest],
    ) -> Result<Booking, EngineError> {
        self.run("update_booking", async {
            let lines = validate_requests(requests)?;
            let mut booking = self.lock_booking(booking_id).await?;
            lifecycle::authorize_owner_or_admin(&*self.policy, actor, &booking).await?;
            if booking.status.is_terminal() {
                return Err(EngineError::Forbidden(format!(
                    "cannot update a {} booking",
                    booking.status
                )));
            }
            if booking.picked_up {
                return Err(EngineError::Forbidden(format!(
                    "booking {} is already picked up",
                    booking.booking_number
                )));
            }

            let affected: Vec<Ulid> = booking
                .item_ids()
                .into_iter()
                .chain(lines.iter().map(|l| l.item_id))
                .collect();
            let mut items = self.lock_items(affected).await?;
            check_capacity(&items, &lines, Some(booking_id))?;

            let line_items = build_line_items(booking_id, &lines, &items, booking.status)?;
            let stock = if booking.status == BookingStatus::Confirmed {
                adjust_stock(&items, &booking.line_items, &line_items)
            } else {
                Vec::new()
            };
            let event = Event::LineItemsReplaced {
                booking_id,
                line_items,
                stock,
                at: now_ms(),
            };
            self.commit(&mut booking, &mut items, &event).await?;
            info!(booking = %booking.booking_number, lines = booking.line_items.len(), "booking updated");
            Ok(booking.clone())
        })
        .await
    }

    pub async fn reject_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.run("reject_booking", self.close_booking(actor, booking_id, Transition::Reject))
            .await
    }

    /// Administrators cancel any live booking; owners only their pending ones.
    pub async fn cancel_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.run("cancel_booking", async {
            let transition = if self.policy.has_role(actor, Role::ADMINISTRATIVE).await {
                Transition::CancelByAdmin
            } else {
                Transition::CancelByUser
            };
            self.close_booking(actor, booking_id, transition).await
        })
        .await
    }

    pub async fn delete_booking(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.run("delete_booking", self.close_booking(actor, booking_id, Transition::Delete))
            .await
    }

    /// Move a booking into a terminal status. Its claims stay in the ledger and drop
    /// out of overlap sums by status. A confirmed booking whose items never left gives
    /// its cached stock back.
    async fn close_booking(
        &self,
        actor: &Actor,
        booking_id: Ulid,
        transition: Transition,
    ) -> Result<Booking, EngineError> {
        let mut booking = self.lock_booking(booking_id).await?;
        lifecycle::authorize(&*self.policy, actor, &booking, transition).await?;
        let status = next_status(&booking, transition)?;

        let mut items = self.lock_items(booking.item_ids()).await?;
        let stock = if booking.status == BookingStatus::Confirmed && !booking.picked_up {
            adjust_stock(&items, &booking.line_items, &[])
        } else {
            Vec::new()
        };
        let event = Event::StatusChanged {
            booking_id,
            status,
            stock,
            at: now_ms(),
        };
        self.commit(&mut booking, &mut items, &event).await?;
        info!(booking = %booking.booking_number, %status, actor = %actor.id, "booking closed");
        Ok(booking.clone())
    }

    pub async fn confirm_pickup(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.run("confirm_pickup", async {
            let mut booking = self.lock_booking(booking_id).await?;
            lifecycle::authorize(&*self.policy, actor, &booking, Transition::Pickup).await?;
            next_status(&booking, Transition::Pickup)?;

            let event = Event::PickupConfirmed {
                booking_id,
                at: now_ms(),
            };
            self.commit(&mut booking, &mut ItemGuards::new(), &event).await?;
            info!(booking = %booking.booking_number, "items picked up");
            Ok(booking.clone())
        })
        .await
    }

    /// Put picked-up stock back on the shelf: each line's quantity returns to the
    /// item's cached count, capped at its total.
    pub async fn return_items(&self, actor: &Actor, booking_id: Ulid) -> Result<Booking, EngineError> {
        self.run("return_items", async {
            let mut booking = self.lock_booking(booking_id).await?;
            lifecycle::authorize(&*self.policy, actor, &booking, Transition::Return).await?;
            next_status(&booking, Transition::Return)?;

            let mut items = self.lock_items(booking.item_ids()).await?;
            let event = Event::ItemsReturned {
                booking_id,
                stock: adjust_stock(&items, &booking.line_items, &[]),
                at: now_ms(),
            };
            self.commit(&mut booking, &mut items, &event).await?;
            info!(booking = %booking.booking_number, "items returned");
            Ok(booking.clone())
        })
        .await
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.gate.write().await;

        let mut events = Vec::new();
        let items: Vec<_> = self.items.iter().map(|e| e.value().clone()).collect();
        for item in items {
            let guard = item.read().await;
            events.push(Event::ItemCreated {
                id: guard.id,
                location_id: guard.location_id,
                name: guard.name.clone(),
                total_quantity: guard.total_quantity,
            });
            if guard.available_quantity != guard.total_quantity {
                events.push(Event::ItemCapacitySet {
                    id: guard.id,
                    total_quantity: guard.total_quantity,
                    available_quantity: guard.available_quantity,
                });
            }
        }

        let shared: Vec<_> = self.bookings.iter().map(|e| e.value().clone()).collect();
        let mut bookings = Vec::with_capacity(shared.len());
        for b in shared {
            bookings.push(b.read().await.clone());
        }
        // ULIDs sort by creation time, which keeps per-owner ordering on replay.
        bookings.sort_by_key(|b| b.id);
        events.extend(bookings.into_iter().map(|booking| Event::BookingCreated { booking }));

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::StorageFailure("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::StorageFailure("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::StorageFailure(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(count)
    }
}
