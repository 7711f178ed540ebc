use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError, ListingLock, unmap_listing_entities};

impl Engine {
    /// Upsert the listing mirror. A no-op snapshot writes nothing.
    pub async fn sync_listing(
        &self,
        id: Ulid,
        owner_id: Ulid,
        listing_type: ListingType,
        status: ListingStatus,
    ) -> Result<Listing, EngineError> {
        let now = self.clock.now_ms();
        loop {
            if self.listings.contains_key(&id) {
                match self.lock_listing(id).await {
                    Ok(mut ls) => {
                        return self
                            .update_listing(&mut ls, owner_id, listing_type, status, now)
                            .await;
                    }
                    // Removed while we waited; insert fresh.
                    Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            let listing = Listing {
                id,
                owner_id,
                listing_type,
                status,
                status_changed_at: now,
            };
            if let Some(listing) = self.insert_listing(listing).await? {
                return Ok(listing);
            }
        }
    }

    /// Returns None if another task inserted the id first.
    async fn insert_listing(&self, listing: Listing) -> Result<Option<Listing>, EngineError> {
        if self.listings.len() >= MAX_LISTINGS {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        let id = listing.id;
        let gate = self.compaction_gate.clone().read_owned().await;
        let rs = Arc::new(RwLock::new(ListingState::new(listing.clone())));
        // Locked before it becomes visible, so nobody reads it unpersisted.
        let guard = rs
            .clone()
            .try_write_owned()
            .map_err(|_| EngineError::WalError("fresh listing lock contended".into()))?;
        match self.listings.entry(id) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(e) => {
                e.insert(rs.clone());
            }
        }
        let mut ls = ListingLock { _gate: gate, guard };

        let event = Event::ListingSynced {
            listing: listing.clone(),
        };
        if let Err(e) = self.persist_and_apply(&mut ls, &event, id).await {
            self.listings.remove_if(&id, |_, v| Arc::ptr_eq(v, &rs));
            return Err(e);
        }
        metrics::gauge!(crate::observability::LISTINGS_ACTIVE).set(self.listings.len() as f64);
        Ok(Some(listing))
    }

    async fn update_listing(
        &self,
        ls: &mut ListingState,
        owner_id: Ulid,
        listing_type: ListingType,
        status: ListingStatus,
        now: Ms,
    ) -> Result<Listing, EngineError> {
        let current = &ls.listing;
        if current.owner_id == owner_id
            && current.listing_type == listing_type
            && current.status == status
        {
            return Ok(current.clone());
        }
        let status_changed_at = if current.status == status {
            current.status_changed_at
        } else {
            now
        };
        let listing = Listing {
            id: current.id,
            owner_id,
            listing_type,
            status,
            status_changed_at,
        };
        let event = Event::ListingSynced {
            listing: listing.clone(),
        };
        self.persist_and_apply(ls, &event, listing.id).await?;
        Ok(listing)
    }

    /// Owner-driven status change (mark rented, sold, paused...). Not gated
    /// on open requests; callers check `open_requests` first if they care.
    pub async fn set_listing_status(
        &self,
        listing_id: Ulid,
        caller: &Actor,
        status: ListingStatus,
    ) -> Result<Listing, EngineError> {
        let mut ls = self.lock_listing(listing_id).await?;
        if !ls.is_owner(caller) {
            return Err(EngineError::Forbidden);
        }
        if ls.listing.status == status {
            return Ok(ls.listing.clone());
        }
        let now = self.clock.now_ms();
        let event = Event::ListingStatusChanged {
            id: listing_id,
            status,
            at: now,
        };
        self.persist_and_apply(&mut ls, &event, listing_id).await?;
        if status.is_unavailable() {
            let open = ls
                .requests
                .values()
                .filter(|r| r.effective_status(now) == RequestStatus::Pending)
                .count();
            if open > 0 {
                tracing::info!(%listing_id, open, "listing marked {status} with pending requests");
            }
        }
        Ok(ls.listing.clone())
    }

    /// Drop the listing with all its blocks and requests.
    pub async fn remove_listing(&self, listing_id: Ulid) -> Result<(), EngineError> {
        let mut ls = self.lock_listing(listing_id).await?;
        let event = Event::ListingRemoved { id: listing_id };
        self.persist_and_apply(&mut ls, &event, listing_id).await?;
        unmap_listing_entities(&ls, &self.entity_to_listing);
        // Safe while we hold the lock: inserts only fill vacant ids.
        self.listings.remove(&listing_id);
        metrics::gauge!(crate::observability::LISTINGS_ACTIVE).set(self.listings.len() as f64);
        Ok(())
    }

    /// Requests worth knowing about before marking the listing sold:
    /// pending ones still inside their window and confirmed ones that
    /// haven't ended yet.
    pub async fn open_requests(&self, listing_id: Ulid) -> Result<Vec<RequestView>, EngineError> {
        let rs = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = rs.read().await;
        let now = self.clock.now_ms();
        let today = self.clock.today();
        let mut views: Vec<RequestView> = guard
            .requests
            .values()
            .filter(|r| match r.effective_status(now) {
                RequestStatus::Pending => true,
                RequestStatus::Confirmed => r.range.end >= today,
                _ => false,
            })
            .map(|r| RequestView::of(r, now))
            .collect();
        views.sort_by_key(|v| v.id);
        Ok(views)
    }
}
