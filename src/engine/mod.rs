mod calendar;
mod conflict;
mod error;
mod mutations;
mod queries;
mod recommend;
mod slots;

pub use error::EngineError;
pub use mutations::{BookingRequest, CancelOutcome};
pub use recommend::{rank, time_of_day_preference, HistoricalStats, ScoredSlot};
pub use slots::generate_slots;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::wal::Wal;

pub type SharedDoctorState = Arc<RwLock<DoctorState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL file and batches appends for group commit: block for the
/// first append, drain whatever else is already queued, write the batch
/// buffered, fsync once, then ack every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stale bytes never ride along with
    // the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// The booking ledger of one tenant.
pub struct Engine {
    pub state: DashMap<Ulid, SharedDoctorState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Serializes doctor registration against compaction snapshots.
    pub(super) registry: Mutex<()>,
    /// Reverse lookup: appointment id → doctor id.
    pub(super) appointment_to_doctor: DashMap<Ulid, Ulid>,
    /// Patient id → their appointment ids, booking order.
    pub(super) patient_appointments: DashMap<Ulid, Vec<Ulid>>,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            notify,
            registry: Mutex::new(()),
            appointment_to_doctor: DashMap::new(),
            patient_appointments: DashMap::new(),
        };

        // Rebuild into plain owned state; nothing else can see it yet.
        let mut doctors: HashMap<Ulid, DoctorState> = HashMap::new();
        for event in &events {
            match event {
                Event::DoctorRegistered { id, name } => {
                    doctors
                        .entry(*id)
                        .or_insert_with(|| DoctorState::new(*id, name.clone()));
                }
                other => {
                    let doctor_id = event_doctor_id(other);
                    match doctors.get_mut(&doctor_id) {
                        Some(ds) => engine.apply(ds, other),
                        None => tracing::warn!("replay: event for unknown doctor {doctor_id}"),
                    }
                }
            }
        }
        let replayed = events.len();
        for (id, ds) in doctors {
            engine.state.insert(id, Arc::new(RwLock::new(ds)));
        }
        if replayed > 0 {
            tracing::info!(
                "replayed {replayed} WAL events ({} doctors) from {}",
                engine.state.len(),
                wal_path.display()
            );
        }

        Ok(engine)
    }

    /// Apply a committed event to a doctor's state. Caller holds the lock.
    fn apply(&self, ds: &mut DoctorState, event: &Event) {
        match event {
            Event::DoctorRenamed { name, .. } => ds.name = name.clone(),
            Event::WindowSet { weekday, window, .. } => ds.set_window(*weekday, *window),
            Event::AppointmentBooked {
                id,
                doctor_id,
                patient_id,
                date,
                time,
                duration_minutes,
                notes,
            } => {
                let appointment = Appointment {
                    id: *id,
                    doctor_id: *doctor_id,
                    patient_id: *patient_id,
                    date: *date,
                    time: *time,
                    duration_minutes: *duration_minutes,
                    status: AppointmentStatus::Confirmed,
                    notes: notes.clone(),
                    rating: None,
                    review: None,
                    reminder_sent: false,
                };
                if let Err(holder) = ds.insert_appointment(appointment) {
                    tracing::warn!("apply: booking {id} collides with active appointment {holder}");
                    return;
                }
                self.appointment_to_doctor.insert(*id, *doctor_id);
                self.patient_appointments.entry(*patient_id).or_default().push(*id);
            }
            Event::StatusChanged { id, status, .. } => {
                if let Err(other) = ds.set_status(*id, *status) {
                    tracing::warn!("apply: status change of {id} to {status} rejected ({other})");
                }
            }
            Event::AppointmentRated { id, rating, review, .. } => {
                if let Some(a) = ds.appointment_mut(id) {
                    a.rating = Some(*rating);
                    a.review = review.clone();
                }
            }
            Event::ReminderSent { id, .. } => {
                if let Some(a) = ds.appointment_mut(id) {
                    a.reminder_sent = true;
                }
            }
            // Registration is handled at the DashMap level.
            Event::DoctorRegistered { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_doctor(&self, id: &Ulid) -> Option<SharedDoctorState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn doctor_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_to_doctor.get(appointment_id).map(|e| *e.value())
    }

    /// WAL-append, apply, then publish whatever the event means to subscribers.
    /// Publishing happens after the commit and cannot fail it.
    pub(super) async fn persist_and_apply(
        &self,
        ds: &mut DoctorState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(ds, event);
        if let Some(notification) = notification_for(ds, event) {
            self.notify.publish(&notification);
        }
        Ok(())
    }

    /// Lookup appointment → doctor, acquire the doctor's write lock.
    pub(super) async fn resolve_appointment_write(
        &self,
        appointment_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<DoctorState>, EngineError> {
        let doctor_id = self
            .doctor_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        Ok(ds.write_owned().await)
    }

    pub(super) async fn resolve_appointment_read(
        &self,
        appointment_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<DoctorState>, EngineError> {
        let doctor_id = self
            .doctor_for_appointment(appointment_id)
            .ok_or(EngineError::NotFound(*appointment_id))?;
        let ds = self
            .get_doctor(&doctor_id)
            .ok_or(EngineError::NotFound(doctor_id))?;
        Ok(ds.read_owned().await)
    }
}

fn notification_for(ds: &DoctorState, event: &Event) -> Option<Notification> {
    match event {
        Event::AppointmentBooked { id, .. } => ds.appointment(id).map(Notification::booked),
        Event::StatusChanged {
            id,
            status: AppointmentStatus::Cancelled,
            ..
        } => ds.appointment(id).map(Notification::cancelled),
        Event::ReminderSent { id, .. } => ds.appointment(id).map(Notification::reminder),
        _ => None,
    }
}

fn event_doctor_id(event: &Event) -> Ulid {
    match event {
        Event::DoctorRegistered { id, .. } | Event::DoctorRenamed { id, .. } => *id,
        Event::WindowSet { doctor_id, .. }
        | Event::AppointmentBooked { doctor_id, .. }
        | Event::StatusChanged { doctor_id, .. }
        | Event::AppointmentRated { doctor_id, .. }
        | Event::ReminderSent { doctor_id, .. } => *doctor_id,
    }
}
