use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since midnight — the only intra-day time unit.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Time of day with minute resolution. `24:00` is valid and only
/// meaningful as the end of a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(Minute);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);
    pub const END_OF_DAY: TimeOfDay = TimeOfDay(MINUTES_PER_DAY);

    pub fn from_minutes(minutes: Minute) -> Option<Self> {
        (minutes <= MINUTES_PER_DAY).then_some(Self(minutes))
    }

    pub fn hm(hour: u8, minute: u8) -> Option<Self> {
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return None;
        }
        Some(Self(hour as Minute * 60 + minute as Minute))
    }

    pub fn minutes(self) -> Minute {
        self.0
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    /// `[self, self + len)`.
    pub fn span(self, len: Minute) -> Span {
        Span::new(self.0, self.0 + len)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTimeError(pub String);

impl fmt::Display for ParseTimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid time of day (expected HH:MM): {}", self.0)
    }
}

impl std::error::Error for ParseTimeError {}

impl FromStr for TimeOfDay {
    type Err = ParseTimeError;

    /// Accepts `H:MM` and `HH:MM`, hours 0-24 (24 only as `24:00`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseTimeError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        if h.is_empty() || h.len() > 2 || m.len() != 2 {
            return Err(err());
        }
        if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let hour: u8 = h.parse().map_err(|_| err())?;
        let minute: u8 = m.parse().map_err(|_| err())?;
        TimeOfDay::hm(hour, minute).ok_or_else(err)
    }
}

/// Half-open minute interval `[start, end)` within a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

// ── Weekly calendar ──────────────────────────────────────────────

/// Monday..Sunday, the index order of a weekly schedule.
pub const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

pub fn weekday_index(day: Weekday) -> usize {
    day.num_days_from_monday() as usize
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

/// A doctor's open hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    pub is_available: bool,
}

impl Window {
    pub const CLOSED: Window = Window {
        start: TimeOfDay::MIDNIGHT,
        end: TimeOfDay::MIDNIGHT,
        is_available: false,
    };

    pub fn open(start: TimeOfDay, end: TimeOfDay) -> Self {
        Self {
            start,
            end,
            is_available: true,
        }
    }

    /// The bookable span, or `None` when closed.
    pub fn open_span(&self) -> Option<Span> {
        (self.is_available && self.start < self.end)
            .then(|| Span::new(self.start.minutes(), self.end.minutes()))
    }
}

impl Default for Window {
    fn default() -> Self {
        Self::CLOSED
    }
}

// ── Identity ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Doctor,
    Patient,
    /// Trusted integration connection with no personal identity. Same
    /// rights as an admin over appointments, calendars and channels.
    Service,
}

/// Who is performing an operation, as vouched for by the auth layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub id: Option<Ulid>,
    pub role: Role,
}

impl Actor {
    pub fn admin() -> Self {
        Self { id: None, role: Role::Admin }
    }

    pub fn doctor(id: Ulid) -> Self {
        Self { id: Some(id), role: Role::Doctor }
    }

    pub fn patient(id: Ulid) -> Self {
        Self { id: Some(id), role: Role::Patient }
    }

    pub fn service() -> Self {
        Self { id: None, role: Role::Service }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Admin or service: acts on behalf of anyone.
    pub fn is_privileged(&self) -> bool {
        matches!(self.role, Role::Admin | Role::Service)
    }

    /// Privileged actors, and the patient or doctor named on the appointment.
    pub fn is_party_to(&self, appointment: &Appointment) -> bool {
        self.is_privileged()
            || self
                .id
                .is_some_and(|id| id == appointment.patient_id || id == appointment.doctor_id)
    }
}

// ── Appointments ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Pending => "pending",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no-show",
        }
    }

    /// Active appointments hold their slot.
    pub fn is_active(self) -> bool {
        matches!(self, AppointmentStatus::Pending | AppointmentStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(AppointmentStatus::Pending),
            "confirmed" => Ok(AppointmentStatus::Confirmed),
            "completed" => Ok(AppointmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AppointmentStatus::Cancelled),
            "no-show" | "no_show" | "noshow" => Ok(AppointmentStatus::NoShow),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub duration_minutes: u16,
    pub status: AppointmentStatus,
    pub notes: Option<String>,
    pub rating: Option<u8>,
    pub review: Option<String>,
    pub reminder_sent: bool,
}

impl Appointment {
    pub fn span(&self) -> Span {
        self.time.span(self.duration_minutes)
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn slot_key(&self) -> SlotKey {
        (self.date, self.time)
    }

    /// Wall-clock start, time zone agnostic.
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN) + TimeDelta::minutes(self.time.minutes() as i64)
    }
}

/// Unique key of an active appointment within one doctor.
pub type SlotKey = (NaiveDate, TimeOfDay);

// ── Per-doctor state ─────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct DoctorState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Indexed by `weekday_index`.
    pub week: [Window; 7],
    /// Every appointment ever booked with this doctor, sorted by `(date, time)`.
    pub appointments: Vec<Appointment>,
    /// Unique index over active appointments only.
    active: HashMap<SlotKey, Ulid>,
}

impl DoctorState {
    pub fn new(id: Ulid, name: Option<String>) -> Self {
        Self {
            id,
            name,
            week: [Window::CLOSED; 7],
            appointments: Vec::new(),
            active: HashMap::new(),
        }
    }

    pub fn window(&self, day: Weekday) -> Window {
        self.week[weekday_index(day)]
    }

    pub fn set_window(&mut self, day: Weekday, window: Window) {
        self.week[weekday_index(day)] = window;
    }

    /// Insert keeping `(date, time)` order; equal keys keep booking order.
    ///
    /// An active appointment whose slot key is already held is rejected with
    /// the holder's id and nothing is inserted.
    pub fn insert_appointment(&mut self, appointment: Appointment) -> Result<(), Ulid> {
        let key = appointment.slot_key();
        if appointment.is_active() {
            if let Some(holder) = self.active.get(&key) {
                return Err(*holder);
            }
            self.active.insert(key, appointment.id);
        }
        let pos = self.appointments.partition_point(|a| a.slot_key() <= key);
        self.appointments.insert(pos, appointment);
        Ok(())
    }

    /// Change status, keeping the active index in step. Moving an appointment
    /// back into an active status whose slot is held by another fails.
    pub fn set_status(&mut self, id: Ulid, status: AppointmentStatus) -> Result<(), Ulid> {
        let Some(pos) = self.appointments.iter().position(|a| a.id == id) else {
            return Err(id);
        };
        let key = self.appointments[pos].slot_key();
        let was_active = self.appointments[pos].is_active();
        match (was_active, status.is_active()) {
            (true, false) => {
                if self.active.get(&key) == Some(&id) {
                    self.active.remove(&key);
                }
            }
            (false, true) => {
                if let Some(holder) = self.active.get(&key) {
                    return Err(*holder);
                }
                self.active.insert(key, id);
            }
            _ => {}
        }
        self.appointments[pos].status = status;
        Ok(())
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    /// Appointments on one date, in time order.
    pub fn on_date(&self, date: NaiveDate) -> impl Iterator<Item = &Appointment> {
        let lo = self.appointments.partition_point(|a| a.date < date);
        let hi = self.appointments.partition_point(|a| a.date <= date);
        self.appointments[lo..hi].iter()
    }

    pub fn active_on(&self, date: NaiveDate) -> impl Iterator<Item = &Appointment> {
        self.on_date(date).filter(|a| a.is_active())
    }

    pub fn active_holder(&self, key: &SlotKey) -> Option<Ulid> {
        self.active.get(key).copied()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorRegistered {
        id: Ulid,
        name: Option<String>,
    },
    DoctorRenamed {
        id: Ulid,
        name: Option<String>,
    },
    WindowSet {
        doctor_id: Ulid,
        weekday: Weekday,
        window: Window,
    },
    AppointmentBooked {
        id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        date: NaiveDate,
        time: TimeOfDay,
        duration_minutes: u16,
        notes: Option<String>,
    },
    StatusChanged {
        id: Ulid,
        doctor_id: Ulid,
        status: AppointmentStatus,
    },
    AppointmentRated {
        id: Ulid,
        doctor_id: Ulid,
        rating: u8,
        review: Option<String>,
    },
    ReminderSent {
        id: Ulid,
        doctor_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub open_days: usize,
    pub active_appointments: usize,
}

/// Listing filter; unset fields match everything. Dates are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentFilter {
    pub id: Option<Ulid>,
    pub doctor_id: Option<Ulid>,
    pub patient_id: Option<Ulid>,
    pub status: Option<AppointmentStatus>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl AppointmentFilter {
    pub fn matches(&self, a: &Appointment) -> bool {
        self.id.is_none_or(|id| a.id == id)
            && self.doctor_id.is_none_or(|id| a.doctor_id == id)
            && self.patient_id.is_none_or(|id| a.patient_id == id)
            && self.status.is_none_or(|s| a.status == s)
            && self.from.is_none_or(|d| a.date >= d)
            && self.to.is_none_or(|d| a.date <= d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> TimeOfDay {
        s.parse().unwrap()
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn appt(date_str: &str, time: &str, duration: u16) -> Appointment {
        Appointment {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            patient_id: Ulid::new(),
            date: date(date_str),
            time: t(time),
            duration_minutes: duration,
            status: AppointmentStatus::Confirmed,
            notes: None,
            rating: None,
            review: None,
            reminder_sent: false,
        }
    }

    #[test]
    fn time_of_day_parse_and_format() {
        assert_eq!(t("09:00").minutes(), 540);
        assert_eq!(t("9:05").minutes(), 545);
        assert_eq!(t("23:59").minutes(), 1439);
        assert_eq!(t("24:00"), TimeOfDay::END_OF_DAY);
        assert_eq!(t("07:30").to_string(), "07:30");
        assert_eq!(TimeOfDay::from_minutes(61).unwrap().to_string(), "01:01");
    }

    #[test]
    fn time_of_day_rejects_garbage() {
        for bad in ["", "9", "24:01", "25:00", "12:60", "12:5", "ab:cd", "123:00", "-1:00"] {
            assert!(bad.parse::<TimeOfDay>().is_err(), "{bad} should not parse");
        }
        assert!(TimeOfDay::from_minutes(MINUTES_PER_DAY + 1).is_none());
    }

    #[test]
    fn time_of_day_orders_numerically() {
        // "9:30" sorts after "10:00" as a string; minutes must not.
        assert!(t("9:30") < t("10:00"));
        assert_eq!(t("13:45").hour(), 13);
    }

    #[test]
    fn span_overlap_is_half_open() {
        let a = Span::new(600, 660);
        assert!(a.overlaps(&Span::new(630, 690)));
        assert!(!a.overlaps(&Span::new(660, 690))); // touching
        assert!(!a.overlaps(&Span::new(570, 600))); // touching
        assert!(a.overlaps(&Span::new(540, 720))); // enclosing
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(540, 720);
        assert!(outer.contains_span(&Span::new(690, 720)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(700, 730)));
    }

    #[test]
    fn window_open_span() {
        assert_eq!(Window::CLOSED.open_span(), None);
        let w = Window::open(t("09:00"), t("12:00"));
        assert_eq!(w.open_span(), Some(Span::new(540, 720)));
        let disabled = Window { is_available: false, ..w };
        assert_eq!(disabled.open_span(), None);
    }

    #[test]
    fn weekday_table_is_monday_first() {
        assert_eq!(weekday_index(Weekday::Mon), 0);
        assert_eq!(weekday_index(Weekday::Sun), 6);
        for (i, day) in WEEK.iter().enumerate() {
            assert_eq!(weekday_index(*day), i);
        }
        assert_eq!(weekday_name(Weekday::Wed), "wednesday");
        assert_eq!("Monday".parse::<Weekday>().unwrap(), Weekday::Mon);
    }

    #[test]
    fn status_activity() {
        assert!(AppointmentStatus::Pending.is_active());
        assert!(AppointmentStatus::Confirmed.is_active());
        assert!(AppointmentStatus::Cancelled.is_terminal());
        assert!(AppointmentStatus::Completed.is_terminal());
        assert!(AppointmentStatus::NoShow.is_terminal());
        assert_eq!("no-show".parse::<AppointmentStatus>(), Ok(AppointmentStatus::NoShow));
        assert_eq!(AppointmentStatus::NoShow.to_string(), "no-show");
        assert!("later".parse::<AppointmentStatus>().is_err());
    }

    #[test]
    fn actor_party_check() {
        let a = appt("2026-03-02", "10:00", 30);
        assert!(Actor::patient(a.patient_id).is_party_to(&a));
        assert!(Actor::doctor(a.doctor_id).is_party_to(&a));
        assert!(Actor::admin().is_party_to(&a));
        assert!(!Actor::patient(Ulid::new()).is_party_to(&a));
        assert!(!Actor::service().is_party_to(&a));
    }

    #[test]
    fn unique_index_rejects_second_active() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        let first = appt("2026-03-02", "10:00", 30);
        let second = appt("2026-03-02", "10:00", 30);
        ds.insert_appointment(first.clone()).unwrap();
        assert_eq!(ds.insert_appointment(second), Err(first.id));
        assert_eq!(ds.appointments.len(), 1);
        assert_eq!(ds.active_count(), 1);
    }

    #[test]
    fn unique_index_ignores_inactive() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        let first = appt("2026-03-02", "10:00", 30);
        ds.insert_appointment(first.clone()).unwrap();
        ds.set_status(first.id, AppointmentStatus::Cancelled).unwrap();
        assert_eq!(ds.active_count(), 0);

        let second = appt("2026-03-02", "10:00", 30);
        ds.insert_appointment(second.clone()).unwrap();
        assert_eq!(ds.active_holder(&second.slot_key()), Some(second.id));
        assert_eq!(ds.appointments.len(), 2);

        // Reactivating the cancelled one collides with the new holder.
        assert_eq!(
            ds.set_status(first.id, AppointmentStatus::Confirmed),
            Err(second.id)
        );
    }

    #[test]
    fn appointments_sorted_by_date_then_time() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        ds.insert_appointment(appt("2026-03-03", "09:00", 30)).unwrap();
        ds.insert_appointment(appt("2026-03-02", "14:00", 30)).unwrap();
        ds.insert_appointment(appt("2026-03-02", "09:30", 30)).unwrap();
        let keys: Vec<String> = ds
            .appointments
            .iter()
            .map(|a| format!("{} {}", a.date, a.time))
            .collect();
        assert_eq!(keys, ["2026-03-02 09:30", "2026-03-02 14:00", "2026-03-03 09:00"]);
    }

    #[test]
    fn on_date_selects_one_day() {
        let mut ds = DoctorState::new(Ulid::new(), None);
        ds.insert_appointment(appt("2026-03-01", "09:00", 30)).unwrap();
        ds.insert_appointment(appt("2026-03-02", "09:00", 30)).unwrap();
        ds.insert_appointment(appt("2026-03-02", "11:00", 30)).unwrap();
        ds.insert_appointment(appt("2026-03-03", "09:00", 30)).unwrap();
        assert_eq!(ds.on_date(date("2026-03-02")).count(), 2);
        assert_eq!(ds.on_date(date("2026-03-04")).count(), 0);
    }

    #[test]
    fn starts_at_combines_date_and_time() {
        let a = appt("2026-03-02", "10:15", 30);
        assert_eq!(a.starts_at().to_string(), "2026-03-02 10:15:00");
    }

    #[test]
    fn filter_matches_inclusive_dates() {
        let a = appt("2026-03-02", "10:00", 30);
        let f = AppointmentFilter {
            from: Some(date("2026-03-02")),
            to: Some(date("2026-03-02")),
            ..Default::default()
        };
        assert!(f.matches(&a));
        let f = AppointmentFilter {
            status: Some(AppointmentStatus::Cancelled),
            ..Default::default()
        };
        assert!(!f.matches(&a));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            patient_id: Ulid::new(),
            date: date("2026-03-02"),
            time: t("10:00"),
            duration_minutes: 45,
            notes: Some("follow-up".into()),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
