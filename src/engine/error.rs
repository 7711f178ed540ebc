use ulid::Ulid;

use crate::model::RequestStatus;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed input: inverted range, empty field, bad token.
    Validation(&'static str),
    /// Overlap with the given block (or a lost race for the same range).
    Conflict(Ulid),
    NotFound(Ulid),
    /// An entity with this id already exists.
    AlreadyExists(Ulid),
    /// Listing can't take reservations (wrong type, paused, sold, rented...).
    Unavailable(Ulid),
    /// Carries no detail so ownership isn't leaked.
    Forbidden,
    /// Action not valid for the request's current status.
    WrongState(Ulid, RequestStatus),
    /// The request passed its response deadline; it is now EXPIRED.
    Expired(Ulid),
    RateLimited,
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Expected business outcomes, as opposed to storage failures.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::WalError(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Conflict(_) => write!(f, "this date range was just taken"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Unavailable(_) => write!(f, "this listing is not available for rent"),
            EngineError::Forbidden => write!(f, "forbidden"),
            EngineError::WrongState(id, status) => {
                write!(f, "request {id} is {status}; action not allowed")
            }
            EngineError::Expired(_) => write!(f, "this request has expired"),
            EngineError::RateLimited => write!(f, "too many requests, try again later"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
