//! Hard limits and defaults. Everything the engine rejects with
//! `LimitExceeded` or validates as client input is bounded here.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const MAX_DOCTORS_PER_TENANT: usize = 100_000;
pub const MAX_APPOINTMENTS_PER_DOCTOR: usize = 100_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_NOTES_LEN: usize = 2048;
pub const MAX_REVIEW_LEN: usize = 2048;

/// Appointment length bounds, minutes.
pub const MIN_DURATION_MINUTES: u16 = 15;
pub const MAX_DURATION_MINUTES: u16 = 120;
pub const DEFAULT_DURATION_MINUTES: u16 = 30;

/// Slot step bounds for slot listing, minutes.
pub const MIN_GRANULARITY_MINUTES: u16 = 5;
pub const MAX_GRANULARITY_MINUTES: u16 = 240;
pub const DEFAULT_GRANULARITY_MINUTES: u16 = 30;

/// Trailing window of completed appointments feeding recommendations.
pub const HISTORY_WINDOW_DAYS: i64 = 30;
/// Recommended-slot lengths are rounded up to a multiple of this.
pub const RECOMMENDATION_ROUNDING_MINUTES: u16 = 30;
pub const RECOMMENDED_SLOT_COUNT: usize = 3;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 5;

/// Reminders go out for confirmed appointments starting within this lead time.
pub const REMINDER_LEAD_MINUTES: i64 = 60;
