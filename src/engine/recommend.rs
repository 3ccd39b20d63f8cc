//! Deterministic slot ranking from booking history. No learned weights:
//! a fixed mix of how often a start time was used and a time-of-day curve.

use std::collections::BTreeMap;

use chrono::{NaiveDate, TimeDelta};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::slots::day_view;
use super::{generate_slots, Engine, EngineError};

const POPULARITY_WEIGHT: f64 = 0.6;
const TIME_OF_DAY_WEIGHT: f64 = 0.4;

/// Fixed preference by start hour.
pub fn time_of_day_preference(hour: u8) -> f64 {
    match hour {
        9..=11 => 1.0,
        14..=16 => 0.9,
        17..=19 => 0.7,
        8 => 0.8,
        _ => 0.5,
    }
}

/// Completed appointments of one doctor over a trailing window, grouped by
/// start time. Derived on demand, never stored.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoricalStats {
    counts: BTreeMap<TimeOfDay, u32>,
    total_minutes: u64,
    samples: u64,
}

impl HistoricalStats {
    pub fn from_appointments<'a>(appointments: impl IntoIterator<Item = &'a Appointment>) -> Self {
        let mut stats = Self::default();
        for a in appointments {
            *stats.counts.entry(a.time).or_default() += 1;
            stats.total_minutes += a.duration_minutes as u64;
            stats.samples += 1;
        }
        stats
    }

    /// Completed appointments in `[today - HISTORY_WINDOW_DAYS, today]`.
    pub fn for_doctor(ds: &DoctorState, today: NaiveDate) -> Self {
        let since = today - TimeDelta::days(HISTORY_WINDOW_DAYS);
        Self::from_appointments(ds.appointments.iter().filter(|a| {
            a.status == AppointmentStatus::Completed && a.date >= since && a.date <= today
        }))
    }

    pub fn popularity(&self, time: TimeOfDay) -> u32 {
        self.counts.get(&time).copied().unwrap_or(0)
    }

    pub fn average_duration(&self) -> Option<f64> {
        (self.samples > 0).then(|| self.total_minutes as f64 / self.samples as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    /// Step used for recommended slots: the average historical duration
    /// rounded up to the rounding unit.
    pub fn slot_length(&self) -> Minute {
        let Some(avg) = self.average_duration() else {
            return RECOMMENDATION_ROUNDING_MINUTES;
        };
        let unit = RECOMMENDATION_ROUNDING_MINUTES as f64;
        let rounded = ((avg / unit).ceil() * unit) as Minute;
        rounded.clamp(RECOMMENDATION_ROUNDING_MINUTES, MAX_GRANULARITY_MINUTES)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredSlot {
    pub time: TimeOfDay,
    pub score: f64,
}

/// Score every candidate and sort best first; equal scores go to the
/// earlier time.
pub fn rank(candidates: &[TimeOfDay], stats: &HistoricalStats) -> Vec<ScoredSlot> {
    let mut scored: Vec<ScoredSlot> = candidates
        .iter()
        .map(|&time| ScoredSlot {
            time,
            score: POPULARITY_WEIGHT * stats.popularity(time) as f64
                + TIME_OF_DAY_WEIGHT * time_of_day_preference(time.hour()),
        })
        .collect();
    scored.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.time.cmp(&b.time)));
    scored
}

impl Engine {
    pub async fn historical_stats(
        &self,
        doctor_id: Ulid,
        today: NaiveDate,
    ) -> Result<HistoricalStats, EngineError> {
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = ds.read().await;
        Ok(HistoricalStats::for_doctor(&guard, today))
    }

    /// Top recommended slots for `date`, judged against history as of `today`.
    pub async fn list_recommended_slots(
        &self,
        doctor_id: Ulid,
        date: NaiveDate,
        today: NaiveDate,
    ) -> Result<Vec<ScoredSlot>, EngineError> {
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        let guard = ds.read().await;
        let stats = HistoricalStats::for_doctor(&guard, today);
        let (window, booked) = day_view(&guard, date);
        drop(guard);

        let candidates = generate_slots(&window, &booked, stats.slot_length());
        let mut ranked = rank(&candidates, &stats);
        ranked.truncate(RECOMMENDED_SLOT_COUNT);
        Ok(ranked)
    }
}
