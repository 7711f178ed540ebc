mod blocks;
mod conflict;
mod error;
mod lifecycle;
mod queries;
mod reconcile;

pub use conflict::listing_conflict;
pub use error::EngineError;
pub use lifecycle::SubmitRequest;

use std::io;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::clock::Clock;
use crate::model::*;
use crate::notify::Outbox;
use crate::throttle::SubmitThrottle;
use crate::wal::Wal;

pub type SharedListingState = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is queued, then does a
/// single fsync for the batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let _ = tx.send(match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            });
        }

        // Non-append commands run after the appends queued ahead of them.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let append_result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray buffered bytes don't leak
    // into the next batch; the whole batch is reported failed either way.
    let flush_result = wal.flush_sync();
    append_result.and(flush_result)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Write access to one listing, plus a shared hold on the compaction gate.
/// Lock order is always gate, then listing.
pub struct ListingLock {
    _gate: OwnedRwLockReadGuard<()>,
    guard: OwnedRwLockWriteGuard<ListingState>,
}

impl Deref for ListingLock {
    type Target = ListingState;

    fn deref(&self) -> &ListingState {
        &self.guard
    }
}

impl DerefMut for ListingLock {
    fn deref_mut(&mut self) -> &mut ListingState {
        &mut self.guard
    }
}

pub struct Engine {
    pub(super) listings: DashMap<Ulid, SharedListingState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) outbox: Outbox,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) throttle: SubmitThrottle,
    /// Reverse lookup: block/request id → listing id.
    pub(super) entity_to_listing: DashMap<Ulid, Ulid>,
    /// Writers hold it shared; compaction takes it exclusively so its
    /// snapshot can't miss an append.
    pub(super) compaction_gate: Arc<RwLock<()>>,
}

/// Apply an event to a listing's state (caller holds the lock).
fn apply_to_listing(ls: &mut ListingState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ListingSynced { listing } => {
            ls.listing = listing.clone();
        }
        Event::ListingStatusChanged { status, at, .. } => {
            ls.listing.status = *status;
            ls.listing.status_changed_at = *at;
        }
        Event::BlockCreated { block } => {
            entity_map.insert(block.id, block.listing_id);
            ls.insert_block(block.clone());
        }
        Event::BlockDeleted { id, .. } => {
            ls.remove_block(*id);
            entity_map.remove(id);
        }
        Event::RequestSubmitted { request } => {
            entity_map.insert(request.id, request.listing_id);
            ls.requests.insert(request.id, request.clone());
        }
        Event::RequestConfirmed {
            id,
            listing_id,
            block,
            response,
            at,
        } => {
            if let Some(req) = ls.requests.get_mut(id) {
                req.status = RequestStatus::Confirmed;
                req.owner_response = response.clone();
                req.responded_at = Some(*at);
                req.block_id = Some(block.id);
            }
            entity_map.insert(block.id, *listing_id);
            ls.insert_block(block.clone());
        }
        Event::RequestDeclined { id, response, at, .. } => {
            if let Some(req) = ls.requests.get_mut(id) {
                req.status = RequestStatus::Declined;
                req.owner_response = response.clone();
                req.responded_at = Some(*at);
            }
        }
        Event::RequestCancelled {
            id, released_block, ..
        } => {
            if let Some(req) = ls.requests.get_mut(id) {
                req.status = RequestStatus::Cancelled;
                req.block_id = None;
            }
            if let Some(block_id) = released_block {
                ls.remove_block(*block_id);
                entity_map.remove(block_id);
            }
        }
        Event::RequestExpired { id, .. } => {
            if let Some(req) = ls.requests.get_mut(id) {
                req.status = RequestStatus::Expired;
            }
        }
        // Removal is handled at the map level
        Event::ListingRemoved { .. } => {}
    }
}

fn unmap_listing_entities(ls: &ListingState, entity_map: &DashMap<Ulid, Ulid>) {
    for block in &ls.blocks {
        entity_map.remove(&block.id);
    }
    for id in ls.requests.keys() {
        entity_map.remove(id);
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        outbox: Outbox,
        clock: Arc<dyn Clock>,
        throttle: SubmitThrottle,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            listings: DashMap::new(),
            wal_tx,
            outbox,
            clock,
            throttle,
            entity_to_listing: DashMap::new(),
            compaction_gate: Arc::new(RwLock::new(())),
        };

        // Sole owner of these Arcs during replay, so try_write never contends.
        // Never blocking_write here: this may run inside the runtime.
        for event in replay.events {
            let listing_id = event.listing_id();
            match &event {
                Event::ListingRemoved { id } => {
                    if let Some((_, rs)) = engine.listings.remove(id) {
                        let guard = rs.try_read().expect("replay: uncontended read");
                        unmap_listing_entities(&guard, &engine.entity_to_listing);
                    }
                }
                Event::ListingSynced { listing } if !engine.listings.contains_key(&listing.id) => {
                    let ls = ListingState::new(listing.clone());
                    engine.listings.insert(listing.id, Arc::new(RwLock::new(ls)));
                }
                _ => {
                    if let Some(entry) = engine.listings.get(&listing_id) {
                        let rs = entry.clone();
                        drop(entry);
                        let mut guard = rs.try_write().expect("replay: uncontended write");
                        apply_to_listing(&mut guard, &event, &engine.entity_to_listing);
                    }
                }
            }
        }
        metrics::gauge!(crate::observability::LISTINGS_ACTIVE).set(engine.listings.len() as f64);

        Ok(engine)
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn listing_count(&self) -> usize {
        self.listings.len()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_listing(&self, id: &Ulid) -> Option<SharedListingState> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    pub fn get_listing_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_listing.get(entity_id).map(|e| *e.value())
    }

    /// WAL-append then apply. The event is durable before state changes,
    /// and before the caller enqueues any notification.
    pub(super) async fn persist_and_apply(
        &self,
        ls: &mut ListingState,
        event: &Event,
        entity_id: Ulid,
    ) -> Result<(), EngineError> {
        if let Err(e) = self.wal_append(event).await {
            tracing::error!(
                listing_id = %event.listing_id(),
                entity_id = %entity_id,
                transition = event.label(),
                "persist failed: {e}"
            );
            return Err(e);
        }
        apply_to_listing(ls, event, &self.entity_to_listing);
        metrics::counter!(crate::observability::TRANSITIONS_TOTAL, "transition" => event.label())
            .increment(1);
        Ok(())
    }

    /// Gate (shared) then listing write lock. Fails with NotFound if the
    /// listing was removed while we waited.
    pub(super) async fn lock_listing(&self, listing_id: Ulid) -> Result<ListingLock, EngineError> {
        let gate = self.compaction_gate.clone().read_owned().await;
        let rs = self
            .get_listing(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = rs.clone().write_owned().await;
        let current = self
            .listings
            .get(&listing_id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), &rs));
        if !current {
            return Err(EngineError::NotFound(listing_id));
        }
        Ok(ListingLock { _gate: gate, guard })
    }

    /// Lookup entity → listing, then lock the listing.
    pub(super) async fn lock_entity(&self, entity_id: &Ulid) -> Result<(Ulid, ListingLock), EngineError> {
        let listing_id = self
            .get_listing_for_entity(entity_id)
            .ok_or(EngineError::NotFound(*entity_id))?;
        let lock = self.lock_listing(listing_id).await?;
        Ok((listing_id, lock))
    }

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let listings: Vec<SharedListingState> =
            self.listings.iter().map(|e| e.value().clone()).collect();

        let mut events = Vec::new();
        for rs in listings {
            let guard = rs.read().await;
            events.push(Event::ListingSynced {
                listing: guard.listing.clone(),
            });
            for block in &guard.blocks {
                events.push(Event::BlockCreated {
                    block: block.clone(),
                });
            }
            let mut requests: Vec<&ReservationRequest> = guard.requests.values().collect();
            requests.sort_by_key(|r| r.id);
            for request in requests {
                events.push(Event::RequestSubmitted {
                    request: request.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
