use chrono::{Datelike, NaiveDate};

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(super) fn validate_duration(duration: Option<u16>) -> Result<u16, EngineError> {
    let d = duration.unwrap_or(DEFAULT_DURATION_MINUTES);
    if !(MIN_DURATION_MINUTES..=MAX_DURATION_MINUTES).contains(&d) {
        return Err(EngineError::InvalidInput(format!(
            "duration must be {MIN_DURATION_MINUTES}..={MAX_DURATION_MINUTES} minutes, got {d}"
        )));
    }
    Ok(d)
}

/// The whole appointment must sit inside that weekday's open window.
pub(super) fn check_within_window(
    ds: &DoctorState,
    date: NaiveDate,
    time: TimeOfDay,
    duration_minutes: u16,
) -> Result<Span, EngineError> {
    let span = time.span(duration_minutes);
    let fits = ds
        .window(date.weekday())
        .open_span()
        .is_some_and(|open| open.contains_span(&span));
    if !fits {
        return Err(EngineError::InvalidWindow {
            date,
            time,
            duration_minutes,
        });
    }
    Ok(span)
}

/// Reject when the exact slot key is held, or when the interval overlaps
/// any active appointment that day. Must run under the doctor's write lock.
pub(super) fn check_no_conflict(
    ds: &DoctorState,
    date: NaiveDate,
    time: TimeOfDay,
    span: &Span,
) -> Result<(), EngineError> {
    if let Some(holder) = ds.active_holder(&(date, time)) {
        return Err(EngineError::Conflict(holder));
    }
    match ds.active_on(date).find(|a| a.span().overlaps(span)) {
        Some(a) => Err(EngineError::Conflict(a.id)),
        None => Ok(()),
    }
}
