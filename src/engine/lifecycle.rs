use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind, Recipient};

use super::conflict::{check_no_conflict, validate_range, validate_text};
use super::{Engine, EngineError};

/// A renter's submission, decoded and validated by the caller's surface.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub renter: Renter,
}

fn validate_renter(renter: &Renter) -> Result<(), EngineError> {
    let Renter::Guest {
        name,
        phone,
        cancel_token,
    } = renter
    else {
        return Ok(());
    };
    if name.trim().is_empty() {
        return Err(EngineError::Validation("guest name is required"));
    }
    if phone.trim().is_empty() {
        return Err(EngineError::Validation("guest phone is required"));
    }
    if name.len() > MAX_GUEST_NAME_LEN {
        return Err(EngineError::LimitExceeded("guest name too long"));
    }
    if phone.len() > MAX_PHONE_LEN {
        return Err(EngineError::LimitExceeded("guest phone too long"));
    }
    if cancel_token.len() < MIN_CANCEL_TOKEN_LEN {
        return Err(EngineError::Validation("cancel token too short"));
    }
    if cancel_token.len() > MAX_CANCEL_TOKEN_LEN {
        return Err(EngineError::LimitExceeded("cancel token too long"));
    }
    Ok(())
}

fn throttle_key(renter: &Renter) -> String {
    match renter {
        Renter::Registered { user_id } => user_id.to_string(),
        Renter::Guest { phone, .. } => phone.clone(),
    }
}

/// Snapshot of the fields a transition decision needs, so the request
/// borrow ends before the listing is mutated.
struct Pending {
    status: RequestStatus,
    overdue: bool,
    range: DateRange,
    block_id: Option<Ulid>,
}

fn inspect(ls: &ListingState, id: Ulid, now: Ms) -> Result<Pending, EngineError> {
    let req = ls.requests.get(&id).ok_or(EngineError::NotFound(id))?;
    Ok(Pending {
        status: req.status,
        overdue: req.is_overdue(now),
        range: req.range,
        block_id: req.block_id,
    })
}

impl Engine {
    pub async fn submit(&self, sub: SubmitRequest) -> Result<RequestView, EngineError> {
        let range = validate_range(sub.start, sub.end)?;
        validate_renter(&sub.renter)?;

        let mut ls = self.lock_listing(sub.listing_id).await?;
        if self.entity_to_listing.contains_key(&sub.id) {
            return Err(EngineError::AlreadyExists(sub.id));
        }
        let listing = &ls.listing;
        if !listing.listing_type.supports_rental() || listing.status != ListingStatus::Active {
            return Err(EngineError::Unavailable(sub.listing_id));
        }
        if ls.requests.len() >= MAX_REQUESTS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many requests on listing"));
        }
        // Only submissions that would otherwise be accepted count.
        let now = self.clock.now_ms();
        if !self.throttle.try_acquire(&throttle_key(&sub.renter), now) {
            metrics::counter!(crate::observability::THROTTLED_TOTAL).increment(1);
            return Err(EngineError::RateLimited);
        }

        let request = ReservationRequest {
            id: sub.id,
            listing_id: sub.listing_id,
            range,
            renter: sub.renter,
            status: RequestStatus::Pending,
            expires_at: now + RESPONSE_WINDOW_MS,
            owner_response: None,
            responded_at: None,
            created_at: now,
            block_id: None,
        };
        let event = Event::RequestSubmitted {
            request: request.clone(),
        };
        self.persist_and_apply(&mut ls, &event, request.id).await?;

        self.outbox.enqueue(Notification::about(
            NotificationKind::RequestSubmitted,
            Recipient::User(ls.listing.owner_id),
            &request,
        ));
        Ok(RequestView::of(&request, now))
    }

    /// Owner accepts. The blocking range is created in the same event, so
    /// a confirmed request always has its block.
    pub async fn confirm(
        &self,
        id: Ulid,
        caller: &Actor,
        response: Option<String>,
    ) -> Result<RequestView, EngineError> {
        validate_text(&response, MAX_RESPONSE_LEN, "owner response too long")?;
        let (listing_id, mut ls) = self.lock_entity(&id).await?;
        let now = self.clock.now_ms();
        let req = inspect(&ls, id, now)?;
        if !ls.is_owner(caller) {
            return Err(EngineError::Forbidden);
        }
        if req.overdue {
            self.expire_locked(&mut ls, id, now, "lazy").await?;
            return Err(EngineError::Expired(id));
        }
        if req.status != RequestStatus::Pending {
            return Err(EngineError::WrongState(id, req.status));
        }
        let listing = &ls.listing;
        if !listing.listing_type.supports_rental()
            || listing.status.is_unavailable()
            || listing.status == ListingStatus::Archived
        {
            return Err(EngineError::Unavailable(listing_id));
        }
        check_no_conflict(&ls, &req.range)?;

        let block = Block {
            id: Ulid::new(),
            listing_id,
            range: req.range,
            is_available: false,
            reason: Some("reservation".into()),
            request_id: Some(id),
        };
        let event = Event::RequestConfirmed {
            id,
            listing_id,
            block,
            response,
            at: now,
        };
        self.persist_and_apply(&mut ls, &event, id).await?;
        Ok(self.notify_renter(&ls, id, NotificationKind::RequestConfirmed, now))
    }

    pub async fn decline(
        &self,
        id: Ulid,
        caller: &Actor,
        response: Option<String>,
    ) -> Result<RequestView, EngineError> {
        validate_text(&response, MAX_RESPONSE_LEN, "owner response too long")?;
        let (listing_id, mut ls) = self.lock_entity(&id).await?;
        let now = self.clock.now_ms();
        let req = inspect(&ls, id, now)?;
        if !ls.is_owner(caller) {
            return Err(EngineError::Forbidden);
        }
        if req.overdue {
            self.expire_locked(&mut ls, id, now, "lazy").await?;
            return Err(EngineError::Expired(id));
        }
        if req.status != RequestStatus::Pending {
            return Err(EngineError::WrongState(id, req.status));
        }

        let event = Event::RequestDeclined {
            id,
            listing_id,
            response,
            at: now,
        };
        self.persist_and_apply(&mut ls, &event, id).await?;
        Ok(self.notify_renter(&ls, id, NotificationKind::RequestDeclined, now))
    }

    /// Renter or owner withdraws. Releases the block of a confirmed
    /// request. Cancelling twice is a no-op.
    pub async fn cancel(&self, id: Ulid, caller: &Actor) -> Result<RequestView, EngineError> {
        let (listing_id, mut ls) = self.lock_entity(&id).await?;
        let now = self.clock.now_ms();
        let req = inspect(&ls, id, now)?;
        let by_renter = ls.requests.get(&id).is_some_and(|r| r.is_renter(caller));
        if !by_renter && !ls.is_owner(caller) {
            return Err(EngineError::Forbidden);
        }
        if req.overdue {
            self.expire_locked(&mut ls, id, now, "lazy").await?;
            return Err(EngineError::Expired(id));
        }
        match req.status {
            RequestStatus::Cancelled => {
                return Ok(RequestView::of(&ls.requests[&id], now));
            }
            RequestStatus::Pending | RequestStatus::Confirmed => {}
            other => return Err(EngineError::WrongState(id, other)),
        }

        let event = Event::RequestCancelled {
            id,
            listing_id,
            released_block: req.block_id,
            at: now,
        };
        self.persist_and_apply(&mut ls, &event, id).await?;

        let request = &ls.requests[&id];
        let recipient = if by_renter {
            Recipient::User(ls.listing.owner_id)
        } else {
            Recipient::renter_of(request)
        };
        self.outbox.enqueue(Notification::about(
            NotificationKind::RequestCancelled,
            recipient,
            request,
        ));
        Ok(RequestView::of(request, now))
    }

    /// Commit EXPIRED for an overdue request and notify the renter.
    /// Returns false if the request is no longer pending-and-overdue.
    async fn expire_locked(
        &self,
        ls: &mut ListingState,
        id: Ulid,
        now: Ms,
        path: &'static str,
    ) -> Result<bool, EngineError> {
        let Some(req) = ls.requests.get(&id) else {
            return Ok(false);
        };
        if !req.is_overdue(now) {
            return Ok(false);
        }
        let event = Event::RequestExpired {
            id,
            listing_id: req.listing_id,
            at: now,
        };
        self.persist_and_apply(ls, &event, id).await?;
        metrics::counter!(crate::observability::EXPIRED_TOTAL, "path" => path).increment(1);
        self.notify_renter(ls, id, NotificationKind::RequestExpired, now);
        Ok(true)
    }

    fn notify_renter(
        &self,
        ls: &ListingState,
        id: Ulid,
        kind: NotificationKind,
        now: Ms,
    ) -> RequestView {
        let request = &ls.requests[&id];
        self.outbox
            .enqueue(Notification::about(kind, Recipient::renter_of(request), request));
        RequestView::of(request, now)
    }

    /// Expire one request if it is still pending past its deadline.
    pub async fn expire_overdue_request(&self, id: Ulid) -> Result<bool, EngineError> {
        let (_, mut ls) = self.lock_entity(&id).await?;
        let now = self.clock.now_ms();
        self.expire_locked(&mut ls, id, now, "sweep").await
    }

    /// Ids of pending requests past their deadline at `now`.
    pub async fn collect_overdue(&self, now: Ms) -> Vec<Ulid> {
        let listings: Vec<_> = self.listings.iter().map(|e| e.value().clone()).collect();
        let mut overdue = Vec::new();
        for rs in listings {
            let guard = rs.read().await;
            overdue.extend(
                guard
                    .requests
                    .values()
                    .filter(|r| r.is_overdue(now))
                    .map(|r| r.id),
            );
        }
        overdue
    }

    /// Expire every overdue request. Safe to run concurrently with itself:
    /// each transition re-checks status under the listing lock, so a request
    /// is expired and notified at most once.
    pub async fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let mut expired = 0;
        for id in self.collect_overdue(now).await {
            match self.expire_overdue_request(id).await {
                Ok(true) => expired += 1,
                Ok(false) | Err(EngineError::NotFound(_)) => {}
                Err(e) => tracing::warn!(request_id = %id, "sweep: failed to expire: {e}"),
            }
        }
        if expired > 0 {
            tracing::info!("expired {expired} overdue requests");
        }
        expired
    }

    /// Forget submission windows that have elapsed.
    pub fn prune_throttle(&self) {
        self.throttle.prune(self.clock.now_ms());
    }
}
