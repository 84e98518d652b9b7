use std::collections::HashMap;

use ulid::Ulid;

use crate::calendar;
use crate::model::*;

use super::availability::{busy_windows, free_windows};
use super::conflict::{find_conflicting_facility_ids, find_conflicts};
use super::{Engine, EngineError, Entity};

impl Engine {
    /// Owner or admin only; anyone else gets NotFound so ids don't leak.
    pub async fn get_reservation(
        &self,
        id: Ulid,
        requester_id: Option<Ulid>,
    ) -> Result<ReservationDetail, EngineError> {
        let r = self.load_reservation(&id)?;
        if let Some(viewer) = requester_id
            && !self.may_view(&r, viewer)
        {
            return Err(EngineError::NotFound(Entity::Reservation, id));
        }
        let requester = self.users.get(&r.requester_id).map(|u| u.value().clone());
        let facility = match r.facility_id() {
            Some(fid) => self.facility_snapshot(&fid).await,
            None => None,
        };
        Ok(self.detail(&r, requester.as_ref(), facility.as_ref()))
    }

    /// Newest first.
    pub async fn list_reservations_for_user(&self, user_id: Ulid) -> Vec<ReservationSummary> {
        let ids = self
            .by_requester
            .get(&user_id)
            .map(|ids| ids.value().clone())
            .unwrap_or_default();
        let reservations: Vec<Reservation> = ids
            .iter()
            .filter_map(|id| self.reservations.get(id).map(|r| r.value().clone()))
            .collect();
        self.summarize(reservations).await
    }

    /// Every reservation of the organization, newest first.
    pub async fn list_all_reservations(&self) -> Vec<ReservationSummary> {
        let reservations: Vec<Reservation> =
            self.reservations.iter().map(|r| r.value().clone()).collect();
        self.summarize(reservations).await
    }

    /// True when no active reservation overlaps the window. Does not look at
    /// the active flag or maintenance.
    pub async fn check_facility_availability(
        &self,
        facility_id: Ulid,
        date: &str,
        start_time: &str,
        end_time: &str,
    ) -> Result<bool, EngineError> {
        let span = calendar::window(date, start_time, end_time)?;
        let fs = self
            .get_facility_state(&facility_id)
            .ok_or(EngineError::NotFound(Entity::Facility, facility_id))?;
        let guard = fs.read().await;
        Ok(find_conflicts(&guard, &span, None).is_empty())
    }

    pub async fn get_facility(&self, id: Ulid) -> Result<FacilityInfo, EngineError> {
        self.facility_snapshot(&id)
            .await
            .map(|f| self.facility_info(&f))
            .ok_or(EngineError::NotFound(Entity::Facility, id))
    }

    /// Sorted by name.
    pub async fn list_facilities(&self) -> Vec<FacilityInfo> {
        let mut out = Vec::new();
        for fs in self.shared_facilities() {
            let guard = fs.read().await;
            out.push(self.facility_info(&guard.facility));
        }
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        out
    }

    /// Facilities a new reservation for this window could be placed on right now.
    pub async fn available_facilities(
        &self,
        date: &str,
        start_time: &str,
        end_time: &str,
        min_capacity: Option<u32>,
    ) -> Result<Vec<FacilityInfo>, EngineError> {
        let span = calendar::window(date, start_time, end_time)?;
        let busy = find_conflicting_facility_ids(&self.facilities, &span).await;
        Ok(self
            .list_facilities()
            .await
            .into_iter()
            .filter(|f| f.is_active && !f.under_maintenance && !busy.contains(&f.id))
            .filter(|f| match (min_capacity, f.capacity) {
                (Some(min), Some(cap)) => cap >= min,
                _ => true,
            })
            .collect())
    }

    /// Active windows on one day, ascending.
    pub async fn busy_slots(&self, facility_id: Ulid, date: &str) -> Result<Vec<Span>, EngineError> {
        let day = calendar::day_span(date)?;
        let fs = self
            .get_facility_state(&facility_id)
            .ok_or(EngineError::NotFound(Entity::Facility, facility_id))?;
        let guard = fs.read().await;
        Ok(busy_windows(&guard, &day))
    }

    /// The day minus its busy windows.
    pub async fn free_slots(&self, facility_id: Ulid, date: &str) -> Result<Vec<Span>, EngineError> {
        let day = calendar::day_span(date)?;
        let fs = self
            .get_facility_state(&facility_id)
            .ok_or(EngineError::NotFound(Entity::Facility, facility_id))?;
        let guard = fs.read().await;
        Ok(free_windows(&guard, &day))
    }

    /// Approval log in the order it was written. Same visibility rule as
    /// [`Engine::get_reservation`].
    pub fn approval_log(
        &self,
        reservation_id: Ulid,
        requester_id: Option<Ulid>,
    ) -> Result<Vec<LogInfo>, EngineError> {
        let r = self.load_reservation(&reservation_id)?;
        if let Some(viewer) = requester_id
            && !self.may_view(&r, viewer)
        {
            return Err(EngineError::NotFound(Entity::Reservation, reservation_id));
        }
        Ok(r.log
            .iter()
            .map(|e| LogInfo {
                reservation_id,
                at: e.at,
                actor: e.actor,
                action: e.action,
                note: e.note.clone(),
            })
            .collect())
    }

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.load_user(&id)
    }

    // ── Projection helpers ───────────────────────────────

    fn may_view(&self, r: &Reservation, viewer: Ulid) -> bool {
        r.requester_id == viewer || self.users.get(&viewer).is_some_and(|u| u.is_admin())
    }

    fn shared_facilities(&self) -> Vec<super::SharedFacilityState> {
        self.facilities.iter().map(|e| e.value().clone()).collect()
    }

    async fn facility_snapshot(&self, id: &Ulid) -> Option<Facility> {
        let fs = self.get_facility_state(id)?;
        let guard = fs.read().await;
        Some(guard.facility.clone())
    }

    fn facility_info(&self, f: &Facility) -> FacilityInfo {
        FacilityInfo {
            id: f.id,
            name: f.name.clone(),
            capacity: f.capacity,
            is_active: f.is_active,
            under_maintenance: f.under_maintenance(self.now()),
            maintenance_until: f.maintenance_until,
            maintenance_reason: f.maintenance_reason.clone(),
        }
    }

    pub(super) fn detail(
        &self,
        r: &Reservation,
        requester: Option<&User>,
        facility: Option<&Facility>,
    ) -> ReservationDetail {
        let (date, start_time, end_time) = calendar::split_window(&r.item.span);
        ReservationDetail {
            id: r.id,
            requester_id: r.requester_id,
            requester_name: requester.map(|u| u.name.clone()),
            facility_id: r.facility_id(),
            facility_name: facility.map(|f| f.name.clone()),
            facility_capacity: facility.and_then(|f| f.capacity),
            status: r.status,
            purpose: r.purpose.clone(),
            attendees: r.attendees,
            date,
            start_time,
            end_time,
            proposal_ref: r.proposal_ref.clone(),
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }

    async fn summarize(&self, mut reservations: Vec<Reservation>) -> Vec<ReservationSummary> {
        reservations.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let mut facility_names: HashMap<Ulid, Option<String>> = HashMap::new();
        let mut out = Vec::with_capacity(reservations.len());
        for r in reservations {
            let facility_name = match r.facility_id() {
                Some(fid) => {
                    if !facility_names.contains_key(&fid) {
                        let name = self.facility_snapshot(&fid).await.map(|f| f.name);
                        facility_names.insert(fid, name);
                    }
                    facility_names.get(&fid).cloned().flatten()
                }
                None => None,
            };
            let (date, start_time, end_time) = calendar::split_window(&r.item.span);
            out.push(ReservationSummary {
                id: r.id,
                requester_id: r.requester_id,
                requester_name: self.users.get(&r.requester_id).map(|u| u.name.clone()),
                facility_id: r.facility_id(),
                facility_name,
                status: r.status,
                purpose: r.purpose,
                attendees: r.attendees,
                date,
                start_time,
                end_time,
                proposal_ref: r.proposal_ref,
                created_at: r.created_at,
            });
        }
        out
    }
}
