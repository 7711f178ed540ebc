use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, query_range, validate_range, validate_text};
use super::{Engine, EngineError};

impl Engine {
    /// True if an unavailable block on the listing overlaps `[start, end]`.
    pub async fn has_conflict(
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
        Ok(guard.blocking_conflict(&range).is_some())
    }

    /// Owner-created blackout (or explicit opening). Overlap check and
    /// insert happen under one listing write lock.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_block(
        &self,
        id: Ulid,
        listing_id: Ulid,
        caller: &Actor,
        start: NaiveDate,
        end: NaiveDate,
        is_available: bool,
        reason: Option<String>,
    ) -> Result<Block, EngineError> {
        let range = validate_range(start, end)?;
        validate_text(&reason, MAX_REASON_LEN, "block reason too long")?;

        let mut ls = self.lock_listing(listing_id).await?;
        if !ls.is_owner(caller) {
            return Err(EngineError::Forbidden);
        }
        if self.entity_to_listing.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if ls.blocks.len() >= MAX_BLOCKS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many blocks on listing"));
        }
        if !is_available {
            check_no_conflict(&ls, &range)?;
        }

        let block = Block {
            id,
            listing_id,
            range,
            is_available,
            reason,
            request_id: None,
        };
        let event = Event::BlockCreated {
            block: block.clone(),
        };
        self.persist_and_apply(&mut ls, &event, id).await?;
        Ok(block)
    }

    /// Returns the listing the block belonged to.
    pub async fn delete_block(&self, id: Ulid, caller: &Actor) -> Result<Ulid, EngineError> {
        let (listing_id, mut ls) = self.lock_entity(&id).await?;
        let block = ls.block(&id).ok_or(EngineError::NotFound(id))?;
        if !ls.is_owner(caller) {
            return Err(EngineError::Forbidden);
        }
        // Confirmed reservations release their block through cancel.
        if let Some(request_id) = block.request_id
            && ls
                .requests
                .get(&request_id)
                .is_some_and(|r| r.status == RequestStatus::Confirmed)
        {
            return Err(EngineError::WrongState(request_id, RequestStatus::Confirmed));
        }

        let event = Event::BlockDeleted { id, listing_id };
        self.persist_and_apply(&mut ls, &event, id).await?;
        Ok(listing_id)
    }

    /// Blocks in start-date order, optionally limited to those overlapping
    /// `[start, end]`. Either bound may be open.
    pub async fn list_blocks(
        &self,
        listing_id: Ulid,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<Block>, EngineError> {
        if let (Some(s), Some(e)) = (start, end)
            && e < s
        {
            return Err(EngineError::Validation("end date is before start date"));
        }
        let rs = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = rs.read().await;
        Ok(guard
            .blocks
            .iter()
            .filter(|b| start.is_none_or(|s| b.range.end >= s))
            .filter(|b| end.is_none_or(|e| b.range.start <= e))
            .cloned()
            .collect())
    }
}
