mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use availability::{busy_windows, free_windows, merge_overlapping, subtract_intervals};
pub use conflict::{find_conflicting_facility_ids, find_conflicts};
pub use error::{EngineError, Entity};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{
    mpsc, oneshot, Mutex, OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock,
};
use tracing::warn;
use ulid::Ulid;

use crate::calendar::Clock;
use crate::model::*;
use crate::notify::{Notice, Notifier};
use crate::wal::Wal;

pub type SharedFacilityState = Arc<RwLock<FacilityState>>;

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

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends.
/// 4. One flush_sync for the whole batch.
/// 5. Answer every sender with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even on append error so a half-buffered batch never leaks into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<Pending>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let _ = response.send(wal.compact(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Unit of work ─────────────────────────────────────────

/// Exclusive hold on the schedule a reservation lives in. Held across
/// validation, WAL append and in-memory apply. The commit gate is always taken
/// before the schedule, so compaction and writers lock in the same order.
pub(super) struct ScheduleLock {
    _gate: OwnedRwLockReadGuard<()>,
    schedule: Schedule,
}

enum Schedule {
    Facility(OwnedRwLockWriteGuard<FacilityState>),
    Unbound(#[allow(dead_code)] OwnedMutexGuard<()>),
}

impl ScheduleLock {
    pub(super) fn state(&self) -> Option<&FacilityState> {
        match &self.schedule {
            Schedule::Facility(guard) => Some(&**guard),
            Schedule::Unbound(_) => None,
        }
    }

    pub(super) fn state_mut(&mut self) -> Option<&mut FacilityState> {
        match &mut self.schedule {
            Schedule::Facility(guard) => Some(&mut **guard),
            Schedule::Unbound(_) => None,
        }
    }
}

pub struct Engine {
    pub(super) facilities: DashMap<Ulid, SharedFacilityState>,
    pub(super) reservations: DashMap<Ulid, Reservation>,
    pub(super) users: DashMap<Ulid, User>,
    /// Requester → reservation ids, in creation order.
    pub(super) by_requester: DashMap<Ulid, Vec<Ulid>>,
    /// Reservation ids with a create in flight. Creates on different
    /// facilities hold different locks, so the id is claimed here first.
    pub(super) claimed_ids: DashSet<Ulid>,
    /// Serializes reservations that are not bound to a facility.
    unbound: Arc<Mutex<()>>,
    /// Serializes user and facility registration (duplicate checks).
    pub(super) registry: Mutex<()>,
    /// Commits hold it shared; compaction holds it exclusively while snapshotting.
    pub(super) commit_gate: Arc<RwLock<()>>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    notifier: Arc<dyn Notifier>,
    pub(super) clock: Clock,
}

impl Engine {
    pub fn new(wal_path: PathBuf, notifier: Arc<dyn Notifier>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            facilities: DashMap::new(),
            reservations: DashMap::new(),
            users: DashMap::new(),
            by_requester: DashMap::new(),
            claimed_ids: DashSet::new(),
            unbound: Arc::new(Mutex::new(())),
            registry: Mutex::new(()),
            commit_gate: Arc::new(RwLock::new(())),
            wal_tx,
            notifier,
            clock: Clock::default(),
        };

        // Sole owner of every Arc here, so try_write never contends. Never block:
        // this may run inside an async context (lazy tenant creation).
        for event in &events {
            let shared = engine
                .event_facility_id(event)
                .and_then(|id| engine.get_facility_state(&id));
            match shared {
                Some(fs) => match fs.try_write() {
                    Ok(mut guard) => engine.apply(Some(&mut *guard), event),
                    Err(_) => warn!("replay: facility state busy, skipping event"),
                },
                None => engine.apply(None, event),
            }
        }

        Ok(engine)
    }

    /// Replace the time source. Used by tests to pin "now".
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> Ms {
        self.clock.now_ms()
    }

    pub(super) fn get_facility_state(&self, id: &Ulid) -> Option<SharedFacilityState> {
        self.facilities.get(id).map(|e| e.value().clone())
    }

    pub(super) fn load_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .get(id)
            .map(|r| r.value().clone())
            .ok_or(EngineError::NotFound(Entity::Reservation, *id))
    }

    pub(super) fn load_user(&self, id: &Ulid) -> Result<User, EngineError> {
        self.users
            .get(id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(Entity::User, *id))
    }

    /// Acquire the schedule a reservation binds to. A facility that was
    /// deleted while we waited reports NotFound.
    pub(super) async fn lock_schedule(
        &self,
        facility_id: Option<Ulid>,
    ) -> Result<ScheduleLock, EngineError> {
        let gate = self.commit_gate.clone().read_owned().await;
        let schedule = match facility_id {
            Some(id) => {
                let fs = self
                    .get_facility_state(&id)
                    .ok_or(EngineError::NotFound(Entity::Facility, id))?;
                let guard = fs.write_owned().await;
                if guard.retired {
                    return Err(EngineError::NotFound(Entity::Facility, id));
                }
                Schedule::Facility(guard)
            }
            None => Schedule::Unbound(self.unbound.clone().lock_owned().await),
        };
        Ok(ScheduleLock {
            _gate: gate,
            schedule,
        })
    }

    /// Durable append followed by in-memory apply. Memory is untouched if the
    /// append fails.
    pub(super) async fn commit(
        &self,
        lock: &mut ScheduleLock,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(lock.state_mut(), event);
        Ok(())
    }

    /// Commit for events outside any schedule (user and facility registration).
    pub(super) async fn commit_unscheduled(&self, event: &Event) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        self.wal_append(event).await?;
        self.apply(None, event);
        Ok(())
    }

    /// Best effort: a failed notice is logged, never rolled back.
    pub(super) fn notify(&self, user_id: Ulid, notice: Notice) {
        if let Err(e) = self.notifier.notify(user_id, &notice) {
            metrics::counter!(crate::observability::NOTIFICATIONS_FAILED_TOTAL).increment(1);
            warn!(
                %user_id,
                reservation_id = %notice.reservation_id,
                error = %e,
                "notification failed"
            );
        }
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
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

    /// The facility whose schedule an event touches, if any.
    fn event_facility_id(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::UserRegistered { .. } | Event::FacilityCreated { .. } => None,
            Event::FacilityUpdated { facility } => Some(facility.id),
            Event::FacilityDeleted { id } => Some(*id),
            Event::ReservationCreated { reservation } => reservation.facility_id(),
            Event::ReservationEdited { id, .. } | Event::ReservationStatusChanged { id, .. } => {
                self.reservations.get(id).and_then(|r| r.facility_id())
            }
        }
    }

    /// Apply an event to memory. The caller holds the write lock of `fs`
    /// when the event touches a facility schedule.
    fn apply(&self, fs: Option<&mut FacilityState>, event: &Event) {
        match event {
            Event::UserRegistered { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::FacilityCreated { facility } => {
                self.facilities.insert(
                    facility.id,
                    Arc::new(RwLock::new(FacilityState::new(facility.clone()))),
                );
            }
            Event::FacilityUpdated { facility } => {
                if let Some(fs) = fs {
                    fs.facility = facility.clone();
                }
            }
            Event::FacilityDeleted { id } => {
                if let Some(fs) = fs {
                    fs.retired = true;
                }
                self.facilities.remove(id);
            }
            Event::ReservationCreated { reservation } => {
                if let Some(fs) = fs
                    && reservation.status.is_active()
                {
                    fs.insert_item(scheduled(reservation));
                }
                self.by_requester
                    .entry(reservation.requester_id)
                    .or_default()
                    .push(reservation.id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationEdited {
                id,
                purpose,
                attendees,
                span,
                proposal_ref,
                actor,
                at,
            } => {
                let Some(mut r) = self.reservations.get_mut(id) else {
                    return;
                };
                r.purpose = purpose.clone();
                r.attendees = *attendees;
                r.item.span = *span;
                r.proposal_ref = proposal_ref.clone();
                r.updated_at = *at;
                r.log.push(LogEntry {
                    at: *at,
                    actor: Some(*actor),
                    action: LogAction::Edited,
                    note: None,
                });
                if let Some(fs) = fs {
                    fs.remove_reservation(*id);
                    if r.status.is_active() {
                        fs.insert_item(scheduled(&*r));
                    }
                }
            }
            Event::ReservationStatusChanged {
                id,
                status,
                actor,
                note,
                at,
            } => {
                let Some(mut r) = self.reservations.get_mut(id) else {
                    return;
                };
                r.status = *status;
                r.updated_at = *at;
                r.log.push(LogEntry {
                    at: *at,
                    actor: *actor,
                    action: LogAction::for_status(*status),
                    note: note.clone(),
                });
                if let Some(fs) = fs
                    && status.is_terminal()
                {
                    fs.remove_reservation(*id);
                }
            }
        }
    }
}

fn scheduled(r: &Reservation) -> ScheduledItem {
    ScheduledItem {
        item_id: r.item.id,
        reservation_id: r.id,
        span: r.item.span,
    }
}
