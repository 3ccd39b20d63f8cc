use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, check_within_window, validate_duration};
use super::{Engine, EngineError, WalCommand};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    /// Defaults to 30 minutes.
    pub duration_minutes: Option<u16>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// Idempotent repeat; nothing was written.
    AlreadyCancelled,
}

/// An appointment id held in the index while its booking is in flight.
/// Released on drop unless the booking committed.
struct IdReservation<'a> {
    index: &'a DashMap<Ulid, Ulid>,
    id: Ulid,
    kept: bool,
}

impl IdReservation<'_> {
    fn keep(mut self) {
        self.kept = true;
    }
}

impl Drop for IdReservation<'_> {
    fn drop(&mut self) {
        if !self.kept {
            self.index.remove(&self.id);
        }
    }
}

fn check_name(name: &Option<String>) -> Result<(), EngineError> {
    if let Some(n) = name
        && n.len() > MAX_NAME_LEN
    {
        return Err(EngineError::LimitExceeded("doctor name too long"));
    }
    Ok(())
}

/// Who may close out an appointment as completed or no-show: the workflow
/// side, never the patient.
fn may_close_out(actor: &Actor, appointment: &Appointment) -> bool {
    match actor.role {
        Role::Admin | Role::Service => true,
        Role::Doctor => actor.id == Some(appointment.doctor_id),
        Role::Patient => false,
    }
}

impl Engine {
    pub async fn register_doctor(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        check_name(&name)?;
        let _registry = self.registry.lock().await;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.state.len() >= MAX_DOCTORS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many doctors"));
        }

        let event = Event::DoctorRegistered {
            id,
            name: name.clone(),
        };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(DoctorState::new(id, name))));
        Ok(())
    }

    pub async fn rename_doctor(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        check_name(&name)?;
        let ds = self.get_doctor(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ds.write().await;
        let event = Event::DoctorRenamed { id, name };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Reserve a slot. The window check, the conflict check and the commit
    /// all happen under the doctor's write lock, so of several concurrent
    /// requests for one slot exactly one commits and the rest see `Conflict`.
    pub async fn book(&self, req: BookingRequest) -> Result<Appointment, EngineError> {
        let duration_minutes = validate_duration(req.duration_minutes)?;
        if let Some(n) = &req.notes
            && n.len() > MAX_NOTES_LEN
        {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        let reservation = self.reserve_appointment_id(req.id, req.doctor_id)?;
        let ds = self
            .get_doctor(&req.doctor_id)
            .ok_or(EngineError::NotFound(req.doctor_id))?;
        let mut guard = ds.write().await;
        if guard.appointments.len() >= MAX_APPOINTMENTS_PER_DOCTOR {
            return Err(EngineError::LimitExceeded("too many appointments for doctor"));
        }

        let span = check_within_window(&guard, req.date, req.time, duration_minutes)?;
        check_no_conflict(&guard, req.date, req.time, &span)?;

        let event = Event::AppointmentBooked {
            id: req.id,
            doctor_id: req.doctor_id,
            patient_id: req.patient_id,
            date: req.date,
            time: req.time,
            duration_minutes,
            notes: req.notes,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        reservation.keep();
        guard
            .appointment(&req.id)
            .cloned()
            .ok_or(EngineError::NotFound(req.id))
    }

    /// Claim `id` in the appointment index before the doctor lock is taken.
    /// A second booking with the same id fails here even when both race.
    fn reserve_appointment_id(
        &self,
        id: Ulid,
        doctor_id: Ulid,
    ) -> Result<IdReservation<'_>, EngineError> {
        match self.appointment_to_doctor.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(doctor_id);
                Ok(IdReservation {
                    index: &self.appointment_to_doctor,
                    id,
                    kept: false,
                })
            }
        }
    }

    /// Cancel an active appointment. Only its patient, its doctor or an
    /// admin may do so. The slot is free again as soon as this returns.
    pub async fn cancel(&self, id: Ulid, actor: &Actor) -> Result<CancelOutcome, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appointment = guard.appointment(&id).ok_or(EngineError::NotFound(id))?;
        if !actor.is_party_to(appointment) {
            return Err(EngineError::Forbidden(
                "only the patient, the doctor or an admin may cancel an appointment",
            ));
        }
        let (status, doctor_id) = (appointment.status, appointment.doctor_id);
        match status {
            AppointmentStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            from @ (AppointmentStatus::Completed | AppointmentStatus::NoShow) => {
                Err(EngineError::InvalidTransition {
                    from,
                    to: AppointmentStatus::Cancelled,
                })
            }
            AppointmentStatus::Pending | AppointmentStatus::Confirmed => {
                let event = Event::StatusChanged {
                    id,
                    doctor_id,
                    status: AppointmentStatus::Cancelled,
                };
                self.persist_and_apply(&mut guard, &event).await?;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    pub async fn complete(&self, id: Ulid) -> Result<(), EngineError> {
        self.close_out(id, AppointmentStatus::Completed, None).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<(), EngineError> {
        self.close_out(id, AppointmentStatus::NoShow, None).await
    }

    /// Move an appointment to `status` on behalf of `actor`. Returns `false`
    /// when nothing changed (a repeated cancel).
    pub async fn update_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        actor: &Actor,
    ) -> Result<bool, EngineError> {
        match status {
            AppointmentStatus::Cancelled => {
                Ok(self.cancel(id, actor).await? == CancelOutcome::Cancelled)
            }
            AppointmentStatus::Completed | AppointmentStatus::NoShow => {
                self.close_out(id, status, Some(actor)).await?;
                Ok(true)
            }
            AppointmentStatus::Pending | AppointmentStatus::Confirmed => {
                let guard = self.resolve_appointment_read(&id).await?;
                let from = guard.appointment(&id).ok_or(EngineError::NotFound(id))?.status;
                Err(EngineError::InvalidTransition { from, to: status })
            }
        }
    }

    async fn close_out(
        &self,
        id: Ulid,
        to: AppointmentStatus,
        actor: Option<&Actor>,
    ) -> Result<(), EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appointment = guard.appointment(&id).ok_or(EngineError::NotFound(id))?;
        if let Some(actor) = actor
            && !may_close_out(actor, appointment)
        {
            return Err(EngineError::Forbidden(
                "only the doctor or an admin may close out an appointment",
            ));
        }
        if appointment.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                from: appointment.status,
                to,
            });
        }
        let event = Event::StatusChanged {
            id,
            doctor_id: appointment.doctor_id,
            status: to,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Attach or replace the patient's rating of a completed appointment.
    pub async fn rate(
        &self,
        id: Ulid,
        actor: &Actor,
        rating: u8,
        review: Option<String>,
    ) -> Result<(), EngineError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(EngineError::InvalidInput(format!(
                "rating must be {MIN_RATING}..={MAX_RATING}, got {rating}"
            )));
        }
        if let Some(r) = &review
            && r.len() > MAX_REVIEW_LEN
        {
            return Err(EngineError::LimitExceeded("review too long"));
        }
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appointment = guard.appointment(&id).ok_or(EngineError::NotFound(id))?;
        if actor.role != Role::Patient || actor.id != Some(appointment.patient_id) {
            return Err(EngineError::Forbidden("only the patient may rate an appointment"));
        }
        if appointment.status != AppointmentStatus::Completed {
            return Err(EngineError::InvalidState("only completed appointments can be rated"));
        }
        let event = Event::AppointmentRated {
            id,
            doctor_id: appointment.doctor_id,
            rating,
            review,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Record and publish the reminder for a confirmed appointment. Returns
    /// `false` if it no longer qualifies (cancelled meanwhile, or already sent).
    pub async fn send_reminder(&self, id: Ulid) -> Result<bool, EngineError> {
        let mut guard = self.resolve_appointment_write(&id).await?;
        let appointment = guard.appointment(&id).ok_or(EngineError::NotFound(id))?;
        if appointment.status != AppointmentStatus::Confirmed || appointment.reminder_sent {
            return Ok(false);
        }
        let event = Event::ReminderSent {
            id,
            doctor_id: appointment.doctor_id,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(true)
    }

    /// Rewrite the WAL with only the events needed to recreate current state.
    /// Holds every doctor's read lock and the registry until the new file is
    /// in place, so no commit can slip between snapshot and swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut doctors: Vec<_> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        doctors.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(doctors.len());
        for (_, ds) in doctors {
            guards.push(ds.read_owned().await);
        }

        let mut events = Vec::new();
        for ds in &guards {
            snapshot_doctor(ds, &mut events);
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Minimal event sequence that rebuilds one doctor. Appointments go out in
/// `(date, time)` order with equal keys in booking order, so a cancelled
/// record is replayed and released before the one that took its slot.
fn snapshot_doctor(ds: &DoctorState, events: &mut Vec<Event>) {
    events.push(Event::DoctorRegistered {
        id: ds.id,
        name: ds.name.clone(),
    });
    for day in WEEK {
        let window = ds.window(day);
        if window != Window::CLOSED {
            events.push(Event::WindowSet {
                doctor_id: ds.id,
                weekday: day,
                window,
            });
        }
    }
    for a in &ds.appointments {
        events.push(Event::AppointmentBooked {
            id: a.id,
            doctor_id: a.doctor_id,
            patient_id: a.patient_id,
            date: a.date,
            time: a.time,
            duration_minutes: a.duration_minutes,
            notes: a.notes.clone(),
        });
        if a.status != AppointmentStatus::Confirmed {
            events.push(Event::StatusChanged {
                id: a.id,
                doctor_id: a.doctor_id,
                status: a.status,
            });
        }
        if let Some(rating) = a.rating {
            events.push(Event::AppointmentRated {
                id: a.id,
                doctor_id: a.doctor_id,
                rating,
                review: a.review.clone(),
            });
        }
        if a.reminder_sent {
            events.push(Event::ReminderSent {
                id: a.id,
                doctor_id: a.doctor_id,
            });
        }
    }
}
