use dashmap::DashSet;
use tokio::sync::oneshot;
use tracing::info;
use ulid::Ulid;

use crate::calendar;
use crate::limits::*;
use crate::model::*;
use crate::notify::{Notice, NoticeKind};

use super::conflict::{check_bookable, check_capacity, check_no_conflict, check_room};
use super::lifecycle::{
    ensure_admin_transition, ensure_editable, ensure_owner, ensure_owner_cancel,
};
use super::{Engine, EngineError, Entity, WalCommand};

impl Engine {
    // ── Registry ─────────────────────────────────────────

    pub async fn register_user(&self, id: Ulid, name: &str, role: Role) -> Result<User, EngineError> {
        let name = validate_name(name, "user name")?;
        let _registry = self.registry.lock().await;
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::User, id));
        }
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        let user = User { id, name, role };
        self.commit_unscheduled(&Event::UserRegistered { user: user.clone() })
            .await?;
        info!(user_id = %id, role = role.as_str(), "user registered");
        Ok(user)
    }

    pub async fn create_facility(
        &self,
        id: Ulid,
        name: &str,
        capacity: Option<u32>,
        is_active: bool,
    ) -> Result<Facility, EngineError> {
        let name = validate_name(name, "facility name")?;
        let _registry = self.registry.lock().await;
        if self.facilities.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Facility, id));
        }
        if self.facilities.len() >= MAX_FACILITIES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many facilities"));
        }
        let facility = Facility {
            id,
            name,
            capacity,
            is_active,
            maintenance_until: None,
            maintenance_reason: None,
        };
        self.commit_unscheduled(&Event::FacilityCreated {
            facility: facility.clone(),
        })
        .await?;
        info!(facility_id = %id, "facility created");
        Ok(facility)
    }

    /// Patch name, capacity, active flag or the maintenance window. Existing
    /// reservations are not re-validated.
    pub async fn update_facility(
        &self,
        id: Ulid,
        patch: FacilityPatch,
    ) -> Result<Facility, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let mut lock = self.lock_schedule(Some(id)).await?;
        let Some(current) = lock.state().map(|fs| fs.facility.clone()) else {
            return Err(EngineError::NotFound(Entity::Facility, id));
        };

        let mut facility = current;
        if let Some(name) = patch.name {
            facility.name = validate_name(&name, "facility name")?;
        }
        if let Some(capacity) = patch.capacity {
            facility.capacity = capacity;
        }
        if let Some(active) = patch.is_active {
            facility.is_active = active;
        }
        if let Some(until) = patch.maintenance_until {
            facility.maintenance_until = until
                .map(|s| calendar::parse_timestamp(&s))
                .transpose()?;
        }
        if let Some(reason) = patch.maintenance_reason {
            facility.maintenance_reason = reason
                .map(|r| validate_text(&r, MAX_REASON_LEN, "maintenance reason"))
                .transpose()?;
        }
        if facility.maintenance_until.is_none() {
            facility.maintenance_reason = None;
        }

        self.commit(&mut lock, &Event::FacilityUpdated {
            facility: facility.clone(),
        })
        .await?;
        info!(facility_id = %id, active = facility.is_active, "facility updated");
        Ok(facility)
    }

    /// Refused while any reservation, active or not, points at the facility.
    pub async fn delete_facility(&self, id: Ulid) -> Result<(), EngineError> {
        let mut lock = self.lock_schedule(Some(id)).await?;
        if self
            .reservations
            .iter()
            .any(|r| r.value().facility_id() == Some(id))
        {
            return Err(EngineError::FacilityInUse(id));
        }
        self.commit(&mut lock, &Event::FacilityDeleted { id }).await?;
        info!(facility_id = %id, "facility deleted");
        Ok(())
    }

    // ── Booking ──────────────────────────────────────────

    pub async fn create_reservation(
        &self,
        requester_id: Ulid,
        input: NewReservation,
    ) -> Result<ReservationDetail, EngineError> {
        let result = self.create_reservation_inner(requester_id, input).await;
        record_outcome("create", &result);
        result
    }

    async fn create_reservation_inner(
        &self,
        requester_id: Ulid,
        input: NewReservation,
    ) -> Result<ReservationDetail, EngineError> {
        let purpose = validate_purpose(&input.purpose)?;
        validate_attendees(input.attendees)?;
        let proposal_ref = validate_proposal_ref(input.proposal_ref)?;
        let span = calendar::window(&input.date, &input.start_time, &input.end_time)?;

        let requester = self.load_user(&requester_id)?;
        let id = input.id.unwrap_or_else(Ulid::new);
        let _claim = self.claim_reservation_id(id)?;

        let mut lock = self.lock_schedule(input.facility_id).await?;
        if self.reservations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(Entity::Reservation, id));
        }
        let now = self.now();
        if let Some(fs) = lock.state() {
            check_capacity(&fs.facility, input.attendees)?;
            check_bookable(&fs.facility, now)?;
            check_room(fs)?;
            check_no_conflict(fs, &span, None)?;
        }

        let reservation = Reservation {
            id,
            requester_id,
            purpose,
            attendees: input.attendees,
            status: ReservationStatus::Pending,
            proposal_ref,
            created_at: now,
            updated_at: now,
            item: ReservationItem {
                id: Ulid::new(),
                facility_id: input.facility_id,
                span,
            },
            log: vec![LogEntry {
                at: now,
                actor: Some(requester_id),
                action: LogAction::Submitted,
                note: None,
            }],
        };
        self.commit(&mut lock, &Event::ReservationCreated {
            reservation: reservation.clone(),
        })
        .await?;
        let facility = lock.state().map(|fs| fs.facility.clone());
        drop(lock);

        info!(reservation_id = %id, %requester_id, "reservation submitted");
        let (date, start, end) = calendar::split_window(&span);
        self.notify(
            requester_id,
            Notice {
                kind: NoticeKind::Submitted,
                reservation_id: id,
                status: ReservationStatus::Pending,
                message: format!("reservation submitted for {date} {start}-{end}"),
            },
        );
        Ok(self.detail(&reservation, Some(&requester), facility.as_ref()))
    }

    pub async fn update_reservation(
        &self,
        id: Ulid,
        requester_id: Ulid,
        patch: ReservationPatch,
    ) -> Result<ReservationDetail, EngineError> {
        let result = self.update_reservation_inner(id, requester_id, patch).await;
        record_outcome("update", &result);
        result
    }

    async fn update_reservation_inner(
        &self,
        id: Ulid,
        requester_id: Ulid,
        patch: ReservationPatch,
    ) -> Result<ReservationDetail, EngineError> {
        if patch.is_empty() {
            return Err(EngineError::Validation("nothing to update".into()));
        }
        let snapshot = self.load_reservation(&id)?;
        ensure_owner(&snapshot, requester_id)?;

        let mut lock = self.lock_schedule(snapshot.facility_id()).await?;
        let current = self.load_reservation(&id)?;
        ensure_editable(&current)?;

        let (date, start, end) = calendar::split_window(&current.item.span);
        let span = calendar::window(
            patch.date.as_deref().unwrap_or(&date),
            patch.start_time.as_deref().unwrap_or(&start),
            patch.end_time.as_deref().unwrap_or(&end),
        )?;
        let purpose = match &patch.purpose {
            Some(p) => validate_purpose(p)?,
            None => current.purpose.clone(),
        };
        let attendees = match patch.attendees {
            Some(n) => {
                validate_attendees(n)?;
                n
            }
            None => current.attendees,
        };
        let proposal_ref = match patch.proposal_ref {
            Some(r) => validate_proposal_ref(Some(r))?,
            None => current.proposal_ref.clone(),
        };

        let window_changed = span != current.item.span;
        if let Some(fs) = lock.state() {
            if window_changed {
                check_no_conflict(fs, &span, Some(id))?;
            }
            if window_changed || attendees != current.attendees {
                check_capacity(&fs.facility, attendees)?;
            }
        }

        let now = self.now();
        self.commit(&mut lock, &Event::ReservationEdited {
            id,
            purpose,
            attendees,
            span,
            proposal_ref,
            actor: requester_id,
            at: now,
        })
        .await?;
        let facility = lock.state().map(|fs| fs.facility.clone());
        drop(lock);

        info!(reservation_id = %id, window_changed, "reservation edited");
        self.notify(
            requester_id,
            Notice {
                kind: NoticeKind::Edited,
                reservation_id: id,
                status: ReservationStatus::Pending,
                message: "reservation updated".into(),
            },
        );
        let updated = self.load_reservation(&id)?;
        let requester = self.users.get(&requester_id).map(|u| u.value().clone());
        Ok(self.detail(&updated, requester.as_ref(), facility.as_ref()))
    }

    pub async fn cancel_reservation(&self, id: Ulid, requester_id: Ulid) -> Result<(), EngineError> {
        let result = self.cancel_reservation_inner(id, requester_id).await;
        record_outcome("cancel", &result);
        result
    }

    async fn cancel_reservation_inner(&self, id: Ulid, requester_id: Ulid) -> Result<(), EngineError> {
        let snapshot = self.load_reservation(&id)?;
        ensure_owner(&snapshot, requester_id)?;

        let mut lock = self.lock_schedule(snapshot.facility_id()).await?;
        let current = self.load_reservation(&id)?;
        ensure_owner_cancel(&current)?;

        self.commit(&mut lock, &Event::ReservationStatusChanged {
            id,
            status: ReservationStatus::Canceled,
            actor: Some(requester_id),
            note: None,
            at: self.now(),
        })
        .await?;
        drop(lock);

        info!(reservation_id = %id, from = current.status.as_str(), "reservation canceled by owner");
        self.notify(
            requester_id,
            Notice {
                kind: NoticeKind::Canceled,
                reservation_id: id,
                status: ReservationStatus::Canceled,
                message: "reservation canceled".into(),
            },
        );
        Ok(())
    }

    /// Administrative decision. `acted_by`, when given, must be an ADMIN.
    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        status: &str,
        acted_by: Option<Ulid>,
        note: Option<String>,
    ) -> Result<ReservationDetail, EngineError> {
        let result = self.set_reservation_status_inner(id, status, acted_by, note).await;
        record_outcome("set_status", &result);
        result
    }

    async fn set_reservation_status_inner(
        &self,
        id: Ulid,
        status: &str,
        acted_by: Option<Ulid>,
        note: Option<String>,
    ) -> Result<ReservationDetail, EngineError> {
        let target: ReservationStatus = status.parse().map_err(EngineError::InvalidStatus)?;
        if let Some(admin_id) = acted_by {
            let admin = self.load_user(&admin_id)?;
            if !admin.is_admin() {
                return Err(EngineError::Forbidden(format!(
                    "user {admin_id} is not an administrator"
                )));
            }
        }
        let note = note
            .map(|n| validate_text(&n, MAX_REASON_LEN, "note"))
            .transpose()?;

        let snapshot = self.load_reservation(&id)?;
        let mut lock = self.lock_schedule(snapshot.facility_id()).await?;
        let current = self.load_reservation(&id)?;
        ensure_admin_transition(&current, target)?;

        self.commit(&mut lock, &Event::ReservationStatusChanged {
            id,
            status: target,
            actor: acted_by,
            note: note.clone(),
            at: self.now(),
        })
        .await?;
        let facility = lock.state().map(|fs| fs.facility.clone());
        drop(lock);

        info!(reservation_id = %id, status = target.as_str(), "reservation status changed");
        let message = match &note {
            Some(n) => format!("reservation {}: {n}", target.as_str().to_ascii_lowercase()),
            None => format!("reservation {}", target.as_str().to_ascii_lowercase()),
        };
        self.notify(
            current.requester_id,
            Notice {
                kind: NoticeKind::StatusChanged,
                reservation_id: id,
                status: target,
                message,
            },
        );
        let updated = self.load_reservation(&id)?;
        let requester = self.users.get(&current.requester_id).map(|u| u.value().clone());
        Ok(self.detail(&updated, requester.as_ref(), facility.as_ref()))
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL as a snapshot of current state. Commits wait on the
    /// gate until the snapshot has been handed to the writer.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for user in self.users.iter() {
            events.push(Event::UserRegistered {
                user: user.value().clone(),
            });
        }

        let shared: Vec<_> = self.facilities.iter().map(|e| e.value().clone()).collect();
        for fs in shared {
            let guard = fs.read().await;
            events.push(Event::FacilityCreated {
                facility: guard.facility.clone(),
            });
        }

        let mut reservations: Vec<Reservation> =
            self.reservations.iter().map(|r| r.value().clone()).collect();
        reservations.sort_by_key(|r| (r.created_at, r.id));
        for reservation in reservations {
            events.push(Event::ReservationCreated { reservation });
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

/// Held for the whole create; releases the id on drop.
struct IdClaim<'a> {
    ids: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.ids.remove(&self.id);
    }
}

impl Engine {
    fn claim_reservation_id(&self, id: Ulid) -> Result<IdClaim<'_>, EngineError> {
        if self.reservations.contains_key(&id) || !self.claimed_ids.insert(id) {
            return Err(EngineError::AlreadyExists(Entity::Reservation, id));
        }
        Ok(IdClaim {
            ids: &self.claimed_ids,
            id,
        })
    }
}

fn record_outcome<T>(op: &'static str, result: &Result<T, EngineError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    metrics::counter!(
        crate::observability::RESERVATION_OPS_TOTAL,
        "op" => op,
        "outcome" => outcome
    )
    .increment(1);
}

// ── Input validation ─────────────────────────────────────

fn validate_name(name: &str, what: &str) -> Result<String, EngineError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(EngineError::Validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(name.to_string())
}

fn validate_text(text: &str, max: usize, what: &str) -> Result<String, EngineError> {
    let text = text.trim();
    if text.chars().count() > max {
        return Err(EngineError::Validation(format!(
            "{what} must be at most {max} characters"
        )));
    }
    Ok(text.to_string())
}

fn validate_purpose(purpose: &str) -> Result<String, EngineError> {
    let purpose = validate_text(purpose, MAX_PURPOSE_LEN, "purpose")?;
    if purpose.chars().count() < MIN_PURPOSE_LEN {
        return Err(EngineError::Validation(format!(
            "purpose must be at least {MIN_PURPOSE_LEN} characters"
        )));
    }
    Ok(purpose)
}

fn validate_attendees(attendees: u32) -> Result<(), EngineError> {
    if attendees == 0 {
        return Err(EngineError::Validation(
            "attendees must be a positive number".into(),
        ));
    }
    if attendees > MAX_ATTENDEES {
        return Err(EngineError::LimitExceeded("too many attendees"));
    }
    Ok(())
}

/// Blank references are dropped.
fn validate_proposal_ref(proposal_ref: Option<String>) -> Result<Option<String>, EngineError> {
    match proposal_ref.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(r) if r.len() > MAX_PROPOSAL_REF_LEN => {
            Err(EngineError::LimitExceeded("proposal reference too long"))
        }
        Some(r) => Ok(Some(r.to_string())),
    }
}
