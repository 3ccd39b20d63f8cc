use chrono::Weekday;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// An enabled window must open before it closes on the same day.
/// Disabled windows keep whatever hours were sent.
pub(super) fn validate_window(
    start: TimeOfDay,
    end: TimeOfDay,
    is_available: bool,
) -> Result<Window, EngineError> {
    if is_available && start >= end {
        return Err(EngineError::InvalidTimeRange { start, end });
    }
    Ok(Window {
        start,
        end,
        is_available,
    })
}

impl Engine {
    /// The stored window for a weekday; unconfigured days are closed.
    pub async fn get_window(&self, doctor_id: Ulid, weekday: Weekday) -> Result<Window, EngineError> {
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = ds.read().await;
        Ok(guard.window(weekday))
    }

    /// All seven days, Monday first.
    pub async fn weekly_schedule(&self, doctor_id: Ulid) -> Result<Vec<(Weekday, Window)>, EngineError> {
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = ds.read().await;
        Ok(WEEK.iter().map(|day| (*day, guard.window(*day))).collect())
    }

    /// Replace one weekday's window. Existing appointments are left alone
    /// even if they now fall outside the hours.
    pub async fn set_window(
        &self,
        doctor_id: Ulid,
        weekday: Weekday,
        start: TimeOfDay,
        end: TimeOfDay,
        is_available: bool,
    ) -> Result<(), EngineError> {
        let window = validate_window(start, end, is_available)?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let mut guard = ds.write().await;
        let event = Event::WindowSet {
            doctor_id,
            weekday,
            window,
        };
        self.persist_and_apply(&mut guard, &event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    #[test]
    fn enabling_requires_start_before_end() {
        assert!(validate_window(t("09:00"), t("17:00"), true).is_ok());
        assert!(matches!(
            validate_window(t("17:00"), t("09:00"), true),
            Err(EngineError::InvalidTimeRange { .. })
        ));
        assert!(matches!(
            validate_window(t("09:00"), t("09:00"), true),
            Err(EngineError::InvalidTimeRange { .. })
        ));
    }

    #[test]
    fn cross_midnight_is_rejected_but_end_of_day_is_fine() {
        assert!(validate_window(t("22:00"), t("02:00"), true).is_err());
        let w = validate_window(t("20:00"), t("24:00"), true).unwrap();
        assert_eq!(w.open_span(), Some(Span::new(1200, 1440)));
    }

    #[test]
    fn disabling_skips_the_range_check() {
        let w = validate_window(t("17:00"), t("09:00"), false).unwrap();
        assert!(!w.is_available);
        assert_eq!(w.open_span(), None);
    }
}
