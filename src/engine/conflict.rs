use std::collections::HashSet;

use dashmap::DashMap;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, SharedFacilityState};

/// Active items on this facility overlapping `span`, skipping those of
/// `exclude` (the reservation being edited).
pub fn find_conflicts(fs: &FacilityState, span: &Span, exclude: Option<Ulid>) -> Vec<Ulid> {
    fs.overlapping(span)
        .filter(|i| Some(i.reservation_id) != exclude)
        .map(|i| i.item_id)
        .collect()
}

/// Facilities with at least one active item overlapping `span`. Facilities
/// whose lock is held by a writer are read after the writer finishes.
pub async fn find_conflicting_facility_ids(
    facilities: &DashMap<Ulid, SharedFacilityState>,
    span: &Span,
) -> HashSet<Ulid> {
    let shared: Vec<(Ulid, SharedFacilityState)> = facilities
        .iter()
        .map(|e| (*e.key(), e.value().clone()))
        .collect();
    let mut busy = HashSet::new();
    for (id, fs) in shared {
        let guard = fs.read().await;
        if guard.overlapping(span).next().is_some() {
            busy.insert(id);
        }
    }
    busy
}

pub(crate) fn check_no_conflict(
    fs: &FacilityState,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let conflicting = find_conflicts(fs, span, exclude);
    if conflicting.is_empty() {
        Ok(())
    } else {
        Err(EngineError::SlotConflict {
            facility_id: fs.facility.id,
            conflicting,
        })
    }
}

pub(crate) fn check_capacity(facility: &Facility, attendees: u32) -> Result<(), EngineError> {
    match facility.capacity {
        Some(capacity) if attendees > capacity => Err(EngineError::CapacityExceeded {
            capacity,
            requested: attendees,
        }),
        _ => Ok(()),
    }
}

/// Inactive or under maintenance at `now`.
pub(crate) fn check_bookable(facility: &Facility, now: Ms) -> Result<(), EngineError> {
    if !facility.is_active {
        return Err(EngineError::FacilityUnavailable(format!(
            "facility '{}' is not active",
            facility.name
        )));
    }
    if facility.under_maintenance(now)
        && let Some(until) = facility.maintenance_until
    {
        let reason = facility
            .maintenance_reason
            .as_deref()
            .unwrap_or("no reason given");
        return Err(EngineError::FacilityUnavailable(format!(
            "facility '{}' is under maintenance until {}: {}",
            facility.name,
            crate::calendar::format_timestamp(until),
            reason
        )));
    }
    Ok(())
}

pub(crate) fn check_room(fs: &FacilityState) -> Result<(), EngineError> {
    if fs.items.len() >= MAX_ITEMS_PER_FACILITY {
        return Err(EngineError::LimitExceeded("too many reservations on facility"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn facility() -> Facility {
        Facility {
            id: Ulid::new(),
            name: "Aula".into(),
            capacity: Some(20),
            is_active: true,
            maintenance_until: None,
            maintenance_reason: None,
        }
    }

    fn with_items(items: &[(Ulid, Ms, Ms)]) -> FacilityState {
        let mut fs = FacilityState::new(facility());
        for &(rid, start, end) in items {
            fs.insert_item(ScheduledItem {
                item_id: Ulid::new(),
                reservation_id: rid,
                span: Span::new(start, end),
            });
        }
        fs
    }

    #[test]
    fn conflicts_respect_half_open_windows() {
        let fs = with_items(&[(Ulid::new(), 100, 200)]);
        assert_eq!(find_conflicts(&fs, &Span::new(150, 250), None).len(), 1);
        assert!(find_conflicts(&fs, &Span::new(200, 300), None).is_empty());
        assert!(find_conflicts(&fs, &Span::new(0, 100), None).is_empty());
    }

    #[test]
    fn excluded_reservation_is_ignored() {
        let own = Ulid::new();
        let fs = with_items(&[(own, 100, 200)]);
        assert!(find_conflicts(&fs, &Span::new(100, 200), Some(own)).is_empty());
        assert!(check_no_conflict(&fs, &Span::new(100, 200), Some(own)).is_ok());
        assert!(matches!(
            check_no_conflict(&fs, &Span::new(100, 200), None),
            Err(EngineError::SlotConflict { .. })
        ));
    }

    #[test]
    fn capacity_unknown_is_unbounded() {
        let mut f = facility();
        assert!(check_capacity(&f, 20).is_ok());
        assert!(matches!(
            check_capacity(&f, 21),
            Err(EngineError::CapacityExceeded {
                capacity: 20,
                requested: 21
            })
        ));
        f.capacity = None;
        assert!(check_capacity(&f, 10_000).is_ok());
    }

    #[test]
    fn maintenance_message_names_end_and_reason() {
        let mut f = facility();
        f.maintenance_until = crate::calendar::parse_timestamp("2025-04-01").ok();
        f.maintenance_reason = Some("roof repair".into());
        let now = crate::calendar::parse_timestamp("2025-03-01 09:00").unwrap();
        let err = check_bookable(&f, now).unwrap_err().to_string();
        assert!(err.contains("2025-04-01 00:00"), "{err}");
        assert!(err.contains("roof repair"), "{err}");

        let later = crate::calendar::parse_timestamp("2025-04-02").unwrap();
        assert!(check_bookable(&f, later).is_ok());
    }

    #[test]
    fn inactive_facility_is_not_bookable() {
        let mut f = facility();
        f.is_active = false;
        assert!(matches!(
            check_bookable(&f, 0),
            Err(EngineError::FacilityUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn conflicting_facility_ids_scan_every_facility() {
        let facilities: DashMap<Ulid, SharedFacilityState> = DashMap::new();
        let busy = with_items(&[(Ulid::new(), 100, 200)]);
        let free = with_items(&[(Ulid::new(), 300, 400)]);
        let busy_id = busy.facility.id;
        facilities.insert(busy_id, std::sync::Arc::new(tokio::sync::RwLock::new(busy)));
        facilities.insert(
            free.facility.id,
            std::sync::Arc::new(tokio::sync::RwLock::new(free)),
        );
        let hits = find_conflicting_facility_ids(&facilities, &Span::new(150, 300)).await;
        assert_eq!(hits.len(), 1);
        assert!(hits.contains(&busy_id));
    }
}
