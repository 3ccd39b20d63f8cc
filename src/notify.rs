use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Appointment;

const CHANNEL_CAPACITY: usize = 256;

/// Logical events published after a ledger commit. Delivery is best-effort
/// and never feeds back into the operation that produced them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    AppointmentBooked {
        appointment_id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        date: NaiveDate,
        time: String,
    },
    AppointmentCancelled {
        appointment_id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
    },
    AppointmentReminder {
        appointment_id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        date: NaiveDate,
        time: String,
    },
}

impl Notification {
    pub fn booked(a: &Appointment) -> Self {
        Notification::AppointmentBooked {
            appointment_id: a.id,
            doctor_id: a.doctor_id,
            patient_id: a.patient_id,
            date: a.date,
            time: a.time.to_string(),
        }
    }

    pub fn cancelled(a: &Appointment) -> Self {
        Notification::AppointmentCancelled {
            appointment_id: a.id,
            doctor_id: a.doctor_id,
            patient_id: a.patient_id,
        }
    }

    pub fn reminder(a: &Appointment) -> Self {
        Notification::AppointmentReminder {
            appointment_id: a.id,
            doctor_id: a.doctor_id,
            patient_id: a.patient_id,
            date: a.date,
            time: a.time.to_string(),
        }
    }

    fn parties(&self) -> (Ulid, Ulid) {
        match self {
            Notification::AppointmentBooked { doctor_id, patient_id, .. }
            | Notification::AppointmentCancelled { doctor_id, patient_id, .. }
            | Notification::AppointmentReminder { doctor_id, patient_id, .. } => {
                (*doctor_id, *patient_id)
            }
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Subscription key: one room per doctor and one per patient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Doctor(Ulid),
    Patient(Ulid),
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Doctor(id) => write!(f, "doctor_{id}"),
            Channel::Patient(id) => write!(f, "patient_{id}"),
        }
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_matches('"');
        let (ctor, id): (fn(Ulid) -> Channel, &str) = if let Some(id) = s.strip_prefix("doctor_") {
            (Channel::Doctor, id)
        } else if let Some(id) = s.strip_prefix("patient_") {
            (Channel::Patient, id)
        } else {
            return Err(format!("invalid channel: {s} (expected doctor_{{id}} or patient_{{id}})"));
        };
        Ulid::from_string(id)
            .map(ctor)
            .map_err(|e| format!("bad ULID in channel {s}: {e}"))
    }
}

/// Broadcast hub keyed by channel. Publishing to a channel nobody listens on
/// is a no-op.
pub struct NotifyHub {
    channels: DashMap<Channel, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a channel, creating it if needed.
    pub fn subscribe(&self, channel: Channel) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Fan out to the doctor's and the patient's channels.
    pub fn publish(&self, notification: &Notification) {
        let (doctor_id, patient_id) = notification.parties();
        for channel in [Channel::Doctor(doctor_id), Channel::Patient(patient_id)] {
            if let Some(sender) = self.channels.get(&channel) {
                // Err only means every receiver has gone away.
                let _ = sender.send(notification.clone());
            }
        }
    }

    /// Drop channels whose subscribers have all disconnected.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
