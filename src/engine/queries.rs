use std::collections::BTreeSet;

use chrono::{NaiveDateTime, TimeDelta};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn list_doctors(&self) -> Vec<DoctorInfo> {
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(doctors.len());
        for ds in doctors {
            let guard = ds.read().await;
            out.push(DoctorInfo {
                id: guard.id,
                name: guard.name.clone(),
                open_days: guard.week.iter().filter(|w| w.open_span().is_some()).count(),
                active_appointments: guard.active_count(),
            });
        }
        out.sort_by_key(|d| d.id);
        out
    }

    /// Fetch one appointment. Only its parties and admins may read it.
    pub async fn get_appointment(&self, id: Ulid, actor: &Actor) -> Result<Appointment, EngineError> {
        let guard = self.resolve_appointment_read(&id).await?;
        let appointment = guard.appointment(&id).ok_or(EngineError::NotFound(id))?;
        if !actor.is_party_to(appointment) {
            return Err(EngineError::Forbidden("not a party to this appointment"));
        }
        Ok(appointment.clone())
    }

    /// Appointments matching `filter`, by date then time. The narrowest
    /// index available picks which doctors are scanned.
    pub async fn list_appointments(&self, filter: &AppointmentFilter) -> Vec<Appointment> {
        let doctor_ids: BTreeSet<Ulid> = if let Some(id) = filter.id {
            self.doctor_for_appointment(&id).into_iter().collect()
        } else if let Some(doctor_id) = filter.doctor_id {
            BTreeSet::from([doctor_id])
        } else if let Some(patient_id) = filter.patient_id {
            self.patient_appointments
                .get(&patient_id)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| self.doctor_for_appointment(id))
                        .collect()
                })
                .unwrap_or_default()
        } else {
            self.state.iter().map(|e| *e.key()).collect()
        };

        let mut out = Vec::new();
        for doctor_id in doctor_ids {
            let Some(ds) = self.get_doctor(&doctor_id) else {
                continue;
            };
            let guard = ds.read().await;
            out.extend(guard.appointments.iter().filter(|a| filter.matches(a)).cloned());
        }
        out.sort_by(|a, b| (a.date, a.time, a.id).cmp(&(b.date, b.time, b.id)));
        out
    }

    /// Confirmed appointments starting within the reminder lead time of
    /// `now` whose reminder has not gone out.
    pub async fn due_reminders(&self, now: NaiveDateTime) -> Vec<Ulid> {
        let horizon = now + TimeDelta::minutes(REMINDER_LEAD_MINUTES);
        let doctors: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut due = Vec::new();
        for ds in doctors {
            let guard = ds.read().await;
            due.extend(
                guard
                    .appointments
                    .iter()
                    .filter(|a| a.status == AppointmentStatus::Confirmed && !a.reminder_sent)
                    .filter(|a| {
                        let starts = a.starts_at();
                        starts >= now && starts <= horizon
                    })
                    .map(|a| a.id),
            );
        }
        due
    }
}
