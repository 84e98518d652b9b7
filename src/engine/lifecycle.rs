//! Guards of the reservation state machine.
//!
//! ```text
//!            create
//!              │
//!              ▼
//!          PENDING ──admin──▶ APPROVED ──owner cancel──▶ CANCELED
//!              │ │                                          ▲
//!              │ └──admin reject──▶ REJECTED                │
//!              └──────────admin or owner cancel─────────────┘
//! ```
//!
//! REJECTED and CANCELED are final.

use ulid::Ulid;

use crate::model::{Reservation, ReservationStatus};

use super::EngineError;

pub(crate) fn ensure_owner(r: &Reservation, requester_id: Ulid) -> Result<(), EngineError> {
    if r.requester_id != requester_id {
        return Err(EngineError::Forbidden(format!(
            "reservation {} belongs to another user",
            r.id
        )));
    }
    Ok(())
}

/// Window, purpose, attendees and proposal reference change only while PENDING.
pub(crate) fn ensure_editable(r: &Reservation) -> Result<(), EngineError> {
    if r.status != ReservationStatus::Pending {
        return Err(invalid(r, "edit"));
    }
    Ok(())
}

pub(crate) fn ensure_owner_cancel(r: &Reservation) -> Result<(), EngineError> {
    if r.status.is_terminal() {
        return Err(invalid(r, "cancel"));
    }
    Ok(())
}

/// Administrative decisions apply to PENDING reservations only.
pub(crate) fn ensure_admin_transition(
    r: &Reservation,
    target: ReservationStatus,
) -> Result<(), EngineError> {
    let action = match target {
        ReservationStatus::Pending => "reset to PENDING",
        ReservationStatus::Approved => "approve",
        ReservationStatus::Rejected => "reject",
        ReservationStatus::Canceled => "cancel",
    };
    if r.status != ReservationStatus::Pending || target == ReservationStatus::Pending {
        return Err(invalid(r, action));
    }
    Ok(())
}

fn invalid(r: &Reservation, action: &'static str) -> EngineError {
    EngineError::InvalidState {
        id: r.id,
        status: r.status,
        action,
    }
}
