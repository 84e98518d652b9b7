use ulid::Ulid;

use crate::calendar::TimeError;
use crate::model::ReservationStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    User,
    Facility,
    Reservation,
}

impl std::fmt::Display for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Entity::User => "user",
            Entity::Facility => "facility",
            Entity::Reservation => "reservation",
        })
    }
}

/// Everything but `Wal` is a business error the caller can act on.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0} {1} not found")]
    NotFound(Entity, Ulid),
    #[error("{0} {1} already exists")]
    AlreadyExists(Entity, Ulid),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("reservation {id} is {status}: {action} not allowed")]
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
        action: &'static str,
    },
    #[error("facility {0} still has reservations; deactivate it instead")]
    FacilityInUse(Ulid),
    #[error("capacity insufficient: {requested} attendees requested, only {capacity} seats available")]
    CapacityExceeded { capacity: u32, requested: u32 },
    #[error("{0}")]
    FacilityUnavailable(String),
    #[error("time slot conflicts with {} existing booking(s) on facility {facility_id}", conflicting.len())]
    SlotConflict {
        facility_id: Ulid,
        conflicting: Vec<Ulid>,
    },
    #[error("invalid status: '{0}' (expected PENDING, APPROVED, REJECTED or CANCELED)")]
    InvalidStatus(String),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Infrastructure failures; the caller sees only a generic retry message.
    pub fn is_internal(&self) -> bool {
        matches!(self, EngineError::WalError(_))
    }

    /// SQLSTATE reported to pgwire clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "P0002",
            EngineError::AlreadyExists(..) => "23505",
            EngineError::Forbidden(_) => "42501",
            EngineError::InvalidState { .. } | EngineError::FacilityInUse(_) => "55000",
            EngineError::CapacityExceeded { .. } => "23514",
            EngineError::FacilityUnavailable(_) => "55006",
            EngineError::SlotConflict { .. } => "23P01",
            EngineError::InvalidStatus(_) | EngineError::Validation(_) => "22023",
            EngineError::Time(_) => "22007",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "XX000",
        }
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::NotFound(..) => "not_found",
            EngineError::AlreadyExists(..) => "already_exists",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::FacilityInUse(_) => "facility_in_use",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::FacilityUnavailable(_) => "facility_unavailable",
            EngineError::SlotConflict { .. } => "slot_conflict",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::Validation(_) | EngineError::Time(_) => "validation",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "internal",
        }
    }

    /// Text safe to show an end user.
    pub fn public_message(&self) -> String {
        if self.is_internal() {
            "internal error, please try again".to_string()
        } else {
            self.to_string()
        }
    }
}
