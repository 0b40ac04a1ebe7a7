use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum EngineError {
    InvalidPriceInput(String),
    InvalidDateRange {
        start: NaiveDate,
        end: NaiveDate,
    },
    /// Conflicts with this confirmed booking.
    Overlap(Ulid),
    InvalidState {
        id: Ulid,
        status: BookingStatus,
    },
    Forbidden(&'static str),
    AlreadyCancelled(Ulid),
    AlreadyPaid(Ulid),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidPriceInput(msg) => write!(f, "invalid price input: {msg}"),
            EngineError::InvalidDateRange { start, end } => {
                write!(f, "end date {end} must be after start date {start}")
            }
            EngineError::Overlap(id) => {
                write!(f, "listing is already booked for the selected dates (booking {id})")
            }
            EngineError::InvalidState { id, status } => {
                write!(f, "booking {id} is {status}, expected pending")
            }
            EngineError::Forbidden(reason) => write!(f, "forbidden: {reason}"),
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::AlreadyPaid(id) => {
                write!(f, "payment already recorded for booking {id}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
