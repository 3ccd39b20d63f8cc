use chrono::{Datelike, NaiveDate};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Bookable slot starts for one day.
///
/// Candidates step from the window start by `granularity`; a candidate must
/// end by the window end and must not overlap any `booked` interval
/// (half-open, so touching is fine). Pure function of its inputs.
pub fn generate_slots(window: &Window, booked: &[Span], granularity: Minute) -> Vec<TimeOfDay> {
    let Some(open) = window.open_span() else {
        return Vec::new();
    };
    if granularity == 0 {
        return Vec::new();
    }

    let mut slots = Vec::new();
    let mut start = open.start as u32;
    while start + granularity as u32 <= open.end as u32 {
        let candidate = Span::new(start as Minute, (start + granularity as u32) as Minute);
        if !booked.iter().any(|b| b.overlaps(&candidate))
            && let Some(t) = TimeOfDay::from_minutes(candidate.start)
        {
            slots.push(t);
        }
        start += granularity as u32;
    }
    slots
}

pub(super) fn validate_granularity(granularity: Option<u16>) -> Result<Minute, EngineError> {
    let g = granularity.unwrap_or(DEFAULT_GRANULARITY_MINUTES);
    if !(MIN_GRANULARITY_MINUTES..=MAX_GRANULARITY_MINUTES).contains(&g) {
        return Err(EngineError::InvalidInput(format!(
            "granularity must be {MIN_GRANULARITY_MINUTES}..={MAX_GRANULARITY_MINUTES} minutes, got {g}"
        )));
    }
    Ok(g)
}

/// Open window for `date` plus the active booked intervals on it.
pub(super) fn day_view(ds: &DoctorState, date: NaiveDate) -> (Window, Vec<Span>) {
    let window = ds.window(date.weekday());
    let booked = ds.active_on(date).map(Appointment::span).collect();
    (window, booked)
}

impl Engine {
    pub async fn list_slots(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
        granularity: Option<u16>,
    ) -> Result<Vec<TimeOfDay>, EngineError> {
        let granularity = validate_granularity(granularity)?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = ds.read().await;
        let (window, booked) = day_view(&guard, date);
        Ok(generate_slots(&window, &booked, granularity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn times(slots: &[TimeOfDay]) -> Vec<String> {
        slots.iter().map(|s| s.to_string()).collect()
    }

    fn booked(time: &str, minutes: u16) -> Span {
        t(time).span(minutes)
    }

    #[test]
    fn morning_window_half_hour_steps() {
        let w = Window::open(t("09:00"), t("12:00"));
        let slots = generate_slots(&w, &[], 30);
        assert_eq!(times(&slots), ["09:00", "09:30", "10:00", "10:30", "11:00", "11:30"]);
    }

    #[test]
    fn closed_window_yields_nothing() {
        assert!(generate_slots(&Window::CLOSED, &[], 30).is_empty());
        let disabled = Window {
            is_available: false,
            ..Window::open(t("09:00"), t("12:00"))
        };
        assert!(generate_slots(&disabled, &[], 30).is_empty());
    }

    #[test]
    fn hour_long_booking_removes_two_slots() {
        let w = Window::open(t("09:00"), t("12:00"));
        let slots = generate_slots(&w, &[booked("10:00", 60)], 30);
        assert_eq!(times(&slots), ["09:00", "09:30", "11:00", "11:30"]);
    }

    #[test]
    fn touching_booking_does_not_exclude() {
        let w = Window::open(t("09:00"), t("10:00"));
        let slots = generate_slots(&w, &[booked("09:30", 30)], 30);
        assert_eq!(times(&slots), ["09:00"]);
    }

    #[test]
    fn off_grid_booking_blocks_both_neighbours() {
        let w = Window::open(t("09:00"), t("11:00"));
        let slots = generate_slots(&w, &[booked("09:45", 30)], 30);
        assert_eq!(times(&slots), ["09:00", "10:30"]);
    }

    #[test]
    fn last_slot_must_end_inside_window() {
        // 12:10 close: 11:30 ends at 12:00 and fits, 12:00 would end at 12:30.
        let w = Window::open(t("09:00"), t("12:10"));
        let slots = generate_slots(&w, &[], 30);
        assert_eq!(slots.last(), Some(&t("11:30")));

        let w = Window::open(t("09:00"), t("12:00"));
        assert_eq!(generate_slots(&w, &[], 30).last(), Some(&t("11:30")));
    }

    #[test]
    fn window_shorter_than_granularity_is_empty() {
        let w = Window::open(t("09:00"), t("09:20"));
        assert!(generate_slots(&w, &[], 30).is_empty());
    }

    #[test]
    fn window_to_end_of_day() {
        let w = Window::open(t("23:00"), t("24:00"));
        assert_eq!(times(&generate_slots(&w, &[], 30)), ["23:00", "23:30"]);
    }

    #[test]
    fn no_returned_slot_overlaps_a_booking() {
        let w = Window::open(t("08:00"), t("18:00"));
        let bookings = [booked("08:15", 20), booked("11:00", 90), booked("16:50", 15)];
        for g in [5, 10, 15, 20, 30, 45, 60] {
            for slot in generate_slots(&w, &bookings, g) {
                let span = slot.span(g);
                assert!(bookings.iter().all(|b| !b.overlaps(&span)), "{slot} g={g}");
                assert!(w.open_span().unwrap().contains_span(&span));
            }
        }
    }

    #[test]
    fn granularity_bounds() {
        assert_eq!(validate_granularity(None).unwrap(), DEFAULT_GRANULARITY_MINUTES);
        assert_eq!(validate_granularity(Some(15)).unwrap(), 15);
        assert!(validate_granularity(Some(0)).is_err());
        assert!(validate_granularity(Some(MAX_GRANULARITY_MINUTES + 1)).is_err());
    }
}
