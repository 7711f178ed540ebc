use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for instants (deadlines, audit stamps).
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// Inclusive calendar range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "DateRange start must not be after end");
        Self { start, end }
    }

    /// Number of calendar days covered, both ends included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    #[cfg(test)]
    pub fn contains_date(&self, d: NaiveDate) -> bool {
        self.start <= d && d <= self.end
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingType {
    Rent,
    Sale,
    Both,
}

impl ListingType {
    pub fn supports_rental(self) -> bool {
        matches!(self, ListingType::Rent | ListingType::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Active,
    Paused,
    Rented,
    Sold,
    Archived,
}

impl ListingStatus {
    /// Sold and rented listings conflict with every date range.
    pub fn is_unavailable(self) -> bool {
        matches!(self, ListingStatus::Sold | ListingStatus::Rented)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    Pending,
    Confirmed,
    Declined,
    Cancelled,
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }
}

/// Error returned when a status keyword doesn't parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownKeyword(pub String);

impl fmt::Display for UnknownKeyword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown keyword: {}", self.0)
    }
}

impl std::error::Error for UnknownKeyword {}

macro_rules! keyword_enum {
    ($ty:ident { $($variant:ident => $kw:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $kw,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownKeyword;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($kw => Ok($ty::$variant),)+
                    _ => Err(UnknownKeyword(s.to_string())),
                }
            }
        }
    };
}

keyword_enum!(ListingType { Rent => "RENT", Sale => "SALE", Both => "BOTH" });
keyword_enum!(ListingStatus {
    Active => "ACTIVE",
    Paused => "PAUSED",
    Rented => "RENTED",
    Sold => "SOLD",
    Archived => "ARCHIVED",
});
keyword_enum!(RequestStatus {
    Pending => "PENDING",
    Confirmed => "CONFIRMED",
    Declined => "DECLINED",
    Cancelled => "CANCELLED",
    Expired => "EXPIRED",
});

/// Mirror of the marketplace listing. Owned by the listing provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub listing_type: ListingType,
    pub status: ListingStatus,
    pub status_changed_at: Ms,
}

/// A date range on a listing's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub range: DateRange,
    /// `false` blocks the range, `true` explicitly opens it.
    pub is_available: bool,
    pub reason: Option<String>,
    /// Set when the block was materialised by a confirmed request.
    pub request_id: Option<Ulid>,
}

impl Block {
    pub fn is_blocking(&self) -> bool {
        !self.is_available
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Renter {
    Registered { user_id: Ulid },
    Guest {
        name: String,
        phone: String,
        cancel_token: String,
    },
}

/// The caller of an action, as resolved by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Actor {
    User(Ulid),
    /// Unauthenticated caller presenting the token handed out at submission.
    Guest(String),
    Anonymous,
}

impl Actor {
    pub fn user_id(&self) -> Option<Ulid> {
        match self {
            Actor::User(id) => Some(*id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequest {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub range: DateRange,
    pub renter: Renter,
    pub status: RequestStatus,
    pub expires_at: Ms,
    pub owner_response: Option<String>,
    pub responded_at: Option<Ms>,
    pub created_at: Ms,
    pub block_id: Option<Ulid>,
}

impl ReservationRequest {
    /// Pending past its deadline.
    pub fn is_overdue(&self, now: Ms) -> bool {
        self.status == RequestStatus::Pending && now > self.expires_at
    }

    /// Status as observed at `now`, with lazy expiry applied.
    pub fn effective_status(&self, now: Ms) -> RequestStatus {
        if self.is_overdue(now) {
            RequestStatus::Expired
        } else {
            self.status
        }
    }

    pub fn is_renter(&self, actor: &Actor) -> bool {
        match (&self.renter, actor) {
            (Renter::Registered { user_id }, Actor::User(caller)) => user_id == caller,
            (Renter::Guest { cancel_token, .. }, Actor::Guest(token)) => cancel_token == token,
            _ => false,
        }
    }
}

/// Per-listing state: the listing mirror, its calendar and its requests.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub listing: Listing,
    /// All blocks, sorted by `range.start`.
    pub blocks: Vec<Block>,
    pub requests: HashMap<Ulid, ReservationRequest>,
}

impl ListingState {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing,
            blocks: Vec::new(),
            requests: HashMap::new(),
        }
    }

    pub fn is_owner(&self, actor: &Actor) -> bool {
        actor.user_id() == Some(self.listing.owner_id)
    }

    /// Insert block maintaining sort order by range.start.
    pub fn insert_block(&mut self, block: Block) {
        let pos = self
            .blocks
            .binary_search_by_key(&block.range.start, |b| b.range.start)
            .unwrap_or_else(|e| e);
        self.blocks.insert(pos, block);
    }

    pub fn remove_block(&mut self, id: Ulid) -> Option<Block> {
        let pos = self.blocks.iter().position(|b| b.id == id)?;
        Some(self.blocks.remove(pos))
    }

    pub fn block(&self, id: &Ulid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == *id)
    }

    /// Blocks whose range overlaps the query (inclusive on both ends).
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: &DateRange) -> impl Iterator<Item = &Block> {
        let right_bound = self
            .blocks
            .partition_point(|b| b.range.start <= query.end);
        self.blocks[..right_bound]
            .iter()
            .filter(move |b| b.range.end >= query.start)
    }

    /// First unavailable block overlapping the query, if any.
    pub fn blocking_conflict(&self, query: &DateRange) -> Option<&Block> {
        self.overlapping(query).find(|b| b.is_blocking())
    }
}

/// WAL record format. Flat, one variant per committed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ListingSynced {
        listing: Listing,
    },
    ListingStatusChanged {
        id: Ulid,
        status: ListingStatus,
        at: Ms,
    },
    ListingRemoved {
        id: Ulid,
    },
    BlockCreated {
        block: Block,
    },
    BlockDeleted {
        id: Ulid,
        listing_id: Ulid,
    },
    RequestSubmitted {
        request: ReservationRequest,
    },
    /// Confirmation and its blocking range commit as one record.
    RequestConfirmed {
        id: Ulid,
        listing_id: Ulid,
        block: Block,
        response: Option<String>,
        at: Ms,
    },
    RequestDeclined {
        id: Ulid,
        listing_id: Ulid,
        response: Option<String>,
        at: Ms,
    },
    RequestCancelled {
        id: Ulid,
        listing_id: Ulid,
        released_block: Option<Ulid>,
        at: Ms,
    },
    RequestExpired {
        id: Ulid,
        listing_id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn listing_id(&self) -> Ulid {
        match self {
            Event::ListingSynced { listing } => listing.id,
            Event::ListingStatusChanged { id, .. } | Event::ListingRemoved { id } => *id,
            Event::BlockCreated { block } => block.listing_id,
            Event::RequestSubmitted { request } => request.listing_id,
            Event::BlockDeleted { listing_id, .. }
            | Event::RequestConfirmed { listing_id, .. }
            | Event::RequestDeclined { listing_id, .. }
            | Event::RequestCancelled { listing_id, .. }
            | Event::RequestExpired { listing_id, .. } => *listing_id,
        }
    }

    /// Short name of the transition, for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Event::ListingSynced { .. } => "listing_synced",
            Event::ListingStatusChanged { .. } => "listing_status_changed",
            Event::ListingRemoved { .. } => "listing_removed",
            Event::BlockCreated { .. } => "block_created",
            Event::BlockDeleted { .. } => "block_deleted",
            Event::RequestSubmitted { .. } => "submit",
            Event::RequestConfirmed { .. } => "confirm",
            Event::RequestDeclined { .. } => "decline",
            Event::RequestCancelled { .. } => "cancel",
            Event::RequestExpired { .. } => "expire",
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Read view of a request. Never carries the guest cancel token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestView {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub range: DateRange,
    pub status: RequestStatus,
    pub renter_id: Option<Ulid>,
    pub guest_name: Option<String>,
    pub guest_phone: Option<String>,
    pub expires_at: Ms,
    pub owner_response: Option<String>,
    pub responded_at: Option<Ms>,
    pub created_at: Ms,
    pub block_id: Option<Ulid>,
}

impl RequestView {
    pub fn of(req: &ReservationRequest, now: Ms) -> Self {
        let (renter_id, guest_name, guest_phone) = match &req.renter {
            Renter::Registered { user_id } => (Some(*user_id), None, None),
            Renter::Guest { name, phone, .. } => (None, Some(name.clone()), Some(phone.clone())),
        };
        Self {
            id: req.id,
            listing_id: req.listing_id,
            range: req.range,
            status: req.effective_status(now),
            renter_id,
            guest_name,
            guest_phone,
            expires_at: req.expires_at,
            owner_response: req.owner_response.clone(),
            responded_at: req.responded_at,
            created_at: req.created_at,
            block_id: req.block_id,
        }
    }
}
