use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{AppointmentStatus, TimeOfDay};

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    /// The requested slot is held by this active appointment.
    Conflict(Ulid),
    InvalidTimeRange {
        start: TimeOfDay,
        end: TimeOfDay,
    },
    /// Requested appointment does not fit the doctor's open window.
    InvalidWindow {
        date: NaiveDate,
        time: TimeOfDay,
        duration_minutes: u16,
    },
    InvalidInput(String),
    Forbidden(&'static str),
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    /// The appointment exists but is not in a state that allows this.
    InvalidState(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Client-side mistakes that never reach the ledger.
    pub fn is_client_input(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidTimeRange { .. }
                | EngineError::InvalidWindow { .. }
                | EngineError::InvalidInput(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::Conflict(id) => write!(f, "slot already booked by appointment {id}"),
            EngineError::InvalidTimeRange { start, end } => {
                write!(f, "invalid time range: start {start} must be before end {end}")
            }
            EngineError::InvalidWindow {
                date,
                time,
                duration_minutes,
            } => write!(
                f,
                "{date} {time} (+{duration_minutes} min) is outside the doctor's availability"
            ),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot move appointment from {from} to {to}")
            }
            EngineError::InvalidState(msg) => write!(f, "invalid state: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
