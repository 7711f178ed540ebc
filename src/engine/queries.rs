use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{listing_conflict, query_range};
use super::{Engine, EngineError};

impl Engine {
    /// Does `[start, end]` conflict on this listing? Sold and rented
    /// listings always do.
    pub async fn availability_conflict(
        &self,
        listing_id: Ulid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<bool, EngineError> {
        let range = query_range(start, end)?;
        let rs = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = rs.read().await;
        Ok(listing_conflict(&guard, &range))
    }

    /// Batch form for search result pages. Unknown ids are left out of the
    /// result rather than failing the whole page.
    pub async fn annotate_conflicts(
        &self,
        listing_ids: &[Ulid],
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<HashMap<Ulid, bool>, EngineError> {
        if listing_ids.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many listing ids"));
        }
        let range = query_range(start, end)?;

        let mut out = HashMap::with_capacity(listing_ids.len());
        for id in listing_ids {
            if out.contains_key(id) {
                continue;
            }
            let Some(rs) = self.get_listing(id) else {
                continue;
            };
            let guard = rs.read().await;
            out.insert(*id, listing_conflict(&guard, &range));
        }
        Ok(out)
    }

    pub async fn get_request(&self, id: Ulid) -> Result<RequestView, EngineError> {
        let listing_id = self
            .get_listing_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let rs = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = rs.read().await;
        let req = guard.requests.get(&id).ok_or(EngineError::NotFound(id))?;
        Ok(RequestView::of(req, self.clock.now_ms()))
    }

    /// All requests on a listing, oldest first.
    pub async fn list_requests(&self, listing_id: Ulid) -> Result<Vec<RequestView>, EngineError> {
        let rs = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = rs.read().await;
        let now = self.clock.now_ms();
        let mut views: Vec<RequestView> = guard
            .requests
            .values()
            .map(|r| RequestView::of(r, now))
            .collect();
        views.sort_by_key(|v| v.id);
        Ok(views)
    }
}
