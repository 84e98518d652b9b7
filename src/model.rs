use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds of a naive local date-time. The only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Back-to-back spans (`self.end == other.start`) do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Users ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Member,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "MEMBER",
            Role::Admin => "ADMIN",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MEMBER" | "USER" => Ok(Role::Member),
            "ADMIN" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Ulid,
    pub name: String,
    pub role: Role,
}

impl User {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// ── Facilities ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facility {
    pub id: Ulid,
    pub name: String,
    /// `None` means unknown / unbounded.
    pub capacity: Option<u32>,
    pub is_active: bool,
    pub maintenance_until: Option<Ms>,
    pub maintenance_reason: Option<String>,
}

impl Facility {
    pub fn under_maintenance(&self, now: Ms) -> bool {
        self.maintenance_until.is_some_and(|until| until > now)
    }
}

/// Partial facility edit. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FacilityPatch {
    pub name: Option<String>,
    pub capacity: Option<Option<u32>>,
    pub is_active: Option<bool>,
    /// Boundary string (`YYYY-MM-DD` or `YYYY-MM-DD HH:MM`); `Some(None)` ends maintenance.
    pub maintenance_until: Option<Option<String>>,
    pub maintenance_reason: Option<Option<String>>,
}

impl FacilityPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.capacity.is_none()
            && self.is_active.is_none()
            && self.maintenance_until.is_none()
            && self.maintenance_reason.is_none()
    }
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Approved => "APPROVED",
            ReservationStatus::Rejected => "REJECTED",
            ReservationStatus::Canceled => "CANCELED",
        }
    }

    /// Active reservations occupy the schedule.
    pub fn is_active(&self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Approved)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Total parse: every input maps to a status or an error, never a pass-through string.
impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Ok(ReservationStatus::Pending),
            "APPROVED" => Ok(ReservationStatus::Approved),
            "REJECTED" => Ok(ReservationStatus::Rejected),
            "CANCELED" | "CANCELLED" => Ok(ReservationStatus::Canceled),
            _ => Err(s.to_string()),
        }
    }
}

/// The facility + time-window binding underlying a reservation header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationItem {
    pub id: Ulid,
    pub facility_id: Option<Ulid>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogAction {
    Submitted,
    Edited,
    Approved,
    Rejected,
    Canceled,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Submitted => "SUBMITTED",
            LogAction::Edited => "EDITED",
            LogAction::Approved => "APPROVED",
            LogAction::Rejected => "REJECTED",
            LogAction::Canceled => "CANCELED",
        }
    }

    pub fn for_status(status: ReservationStatus) -> Self {
        match status {
            ReservationStatus::Pending => LogAction::Edited,
            ReservationStatus::Approved => LogAction::Approved,
            ReservationStatus::Rejected => LogAction::Rejected,
            ReservationStatus::Canceled => LogAction::Canceled,
        }
    }
}

/// One row of a reservation's approval log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: Ms,
    pub actor: Option<Ulid>,
    pub action: LogAction,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub purpose: String,
    pub attendees: u32,
    pub status: ReservationStatus,
    pub proposal_ref: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub item: ReservationItem,
    pub log: Vec<LogEntry>,
}

impl Reservation {
    pub fn facility_id(&self) -> Option<Ulid> {
        self.item.facility_id
    }
}

/// Canonical create input. Dates and times stay in boundary format
/// (`YYYY-MM-DD`, `HH:MM`) until the engine validates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    /// Caller-chosen id; lets a client retry a create without double-booking.
    pub id: Option<Ulid>,
    pub facility_id: Option<Ulid>,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub purpose: String,
    pub attendees: u32,
    pub proposal_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub purpose: Option<String>,
    pub attendees: Option<u32>,
    pub proposal_ref: Option<String>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.start_time.is_none()
            && self.end_time.is_none()
            && self.purpose.is_none()
            && self.attendees.is_none()
            && self.proposal_ref.is_none()
    }
}

// ── Conflict index ───────────────────────────────────────────────

/// An active reservation item as held by the facility's conflict index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledItem {
    pub item_id: Ulid,
    pub reservation_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FacilityState {
    pub facility: Facility,
    /// Active items only, sorted by `span.start`.
    pub items: Vec<ScheduledItem>,
    /// Set when the facility is deleted while a writer still holds its Arc.
    pub retired: bool,
}

impl FacilityState {
    pub fn new(facility: Facility) -> Self {
        Self {
            facility,
            items: Vec::new(),
            retired: false,
        }
    }

    /// Insert item maintaining sort order by span.start.
    pub fn insert_item(&mut self, item: ScheduledItem) {
        let pos = self
            .items
            .binary_search_by_key(&item.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.items.insert(pos, item);
    }

    /// Remove every item belonging to a reservation.
    pub fn remove_reservation(&mut self, reservation_id: Ulid) -> usize {
        let before = self.items.len();
        self.items.retain(|i| i.reservation_id != reservation_id);
        before - self.items.len()
    }

    /// Items whose span overlaps the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ScheduledItem> {
        let right_bound = self.items.partition_point(|i| i.span.start < query.end);
        self.items[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }
}

// ── WAL record format ────────────────────────────────────────────

/// One event per committed mutation. A reservation header and its item always
/// travel in the same record, so neither is ever durable without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        user: User,
    },
    FacilityCreated {
        facility: Facility,
    },
    FacilityUpdated {
        facility: Facility,
    },
    FacilityDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    ReservationEdited {
        id: Ulid,
        purpose: String,
        attendees: u32,
        span: Span,
        proposal_ref: Option<String>,
        actor: Ulid,
        at: Ms,
    },
    ReservationStatusChanged {
        id: Ulid,
        status: ReservationStatus,
        actor: Option<Ulid>,
        note: Option<String>,
        at: Ms,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationDetail {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub requester_name: Option<String>,
    pub facility_id: Option<Ulid>,
    pub facility_name: Option<String>,
    pub facility_capacity: Option<u32>,
    pub status: ReservationStatus,
    pub purpose: String,
    pub attendees: u32,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub proposal_ref: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationSummary {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub requester_name: Option<String>,
    pub facility_id: Option<Ulid>,
    pub facility_name: Option<String>,
    pub status: ReservationStatus,
    pub purpose: String,
    pub attendees: u32,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub proposal_ref: Option<String>,
    pub created_at: Ms,
}

impl From<ReservationDetail> for ReservationSummary {
    fn from(d: ReservationDetail) -> Self {
        Self {
            id: d.id,
            requester_id: d.requester_id,
            requester_name: d.requester_name,
            facility_id: d.facility_id,
            facility_name: d.facility_name,
            status: d.status,
            purpose: d.purpose,
            attendees: d.attendees,
            date: d.date,
            start_time: d.start_time,
            end_time: d.end_time,
            proposal_ref: d.proposal_ref,
            created_at: d.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FacilityInfo {
    pub id: Ulid,
    pub name: String,
    pub capacity: Option<u32>,
    pub is_active: bool,
    pub under_maintenance: bool,
    pub maintenance_until: Option<Ms>,
    pub maintenance_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfo {
    pub reservation_id: Ulid,
    pub at: Ms,
    pub actor: Option<Ulid>,
    pub action: LogAction,
    pub note: Option<String>,
}
