use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, always UTC. Naive wall-clock input is normalized
/// before it ever becomes an `Ms` (see `crate::time`).
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from untrusted bounds, `None` unless `start < end`.
    pub fn checked(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Boundary-touching spans do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// A persisted reservation of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub device_id: Ulid,
    pub span: Span,
    /// Placed by the queue scheduler rather than requested explicitly.
    pub queued: bool,
    pub created_at: Ms,
    pub modified_at: Ms,
}

/// Partial update of a reservation. `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationPatch {
    pub device_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
}

impl ReservationPatch {
    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.start.is_none() && self.end.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    pub id: Ulid,
    pub name: String,
    pub created_at: Ms,
    pub modified_at: Ms,
}

/// Partial update of a device. `device_type_id: Some(None)` detaches the type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub device_type_id: Option<Option<Ulid>>,
}

/// Device record plus its reservations. Lives behind a per-device lock.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub id: Ulid,
    pub name: String,
    pub device_type_id: Option<Ulid>,
    pub created_at: Ms,
    pub modified_at: Ms,
    /// Set under the write lock when the device is removed, so writers that
    /// were queued on the lock see it and back off.
    pub deleted: bool,
    /// Reservations sorted by `span.start`. Pairwise disjoint.
    pub reservations: Vec<Reservation>,
}

impl DeviceState {
    pub fn new(id: Ulid, name: String, device_type_id: Option<Ulid>, now: Ms) -> Self {
        Self {
            id,
            name,
            device_type_id,
            created_at: now,
            modified_at: now,
            deleted: false,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping sort order by start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: &Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == *id)
    }

    /// Reservations whose span overlaps `query`.
    /// Everything at index >= right_bound starts at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    pub fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.id,
            name: self.name.clone(),
            device_type_id: self.device_type_id,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

/// The WAL record format. Flat, one variant per committed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DeviceTypeCreated {
        device_type: DeviceType,
    },
    DeviceTypeDeleted {
        id: Ulid,
    },
    DeviceCreated {
        id: Ulid,
        name: String,
        device_type_id: Option<Ulid>,
        at: Ms,
    },
    DeviceUpdated {
        id: Ulid,
        name: String,
        device_type_id: Option<Ulid>,
        at: Ms,
    },
    DeviceDeleted {
        id: Ulid,
    },
    ReservationCreated {
        reservation: Reservation,
    },
    /// `previous_device_id` differs from `reservation.device_id` when the
    /// reservation moved between devices.
    ReservationUpdated {
        previous_device_id: Ulid,
        reservation: Reservation,
    },
    ReservationDeleted {
        id: Ulid,
        device_id: Ulid,
    },
}

impl Event {
    /// Device whose notification channel receives this event.
    pub fn device_id(&self) -> Option<Ulid> {
        match self {
            Event::DeviceCreated { id, .. }
            | Event::DeviceUpdated { id, .. }
            | Event::DeviceDeleted { id } => Some(*id),
            Event::ReservationCreated { reservation }
            | Event::ReservationUpdated { reservation, .. } => Some(reservation.device_id),
            Event::ReservationDeleted { device_id, .. } => Some(*device_id),
            Event::DeviceTypeCreated { .. } | Event::DeviceTypeDeleted { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: Ulid,
    pub name: String,
    pub device_type_id: Option<Ulid>,
    pub created_at: Ms,
    pub modified_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reservation(start: Ms, end: Ms) -> Reservation {
        Reservation {
            id: Ulid::new(),
            device_id: Ulid::nil(),
            span: Span::new(start, end),
            queued: false,
            created_at: 0,
            modified_at: 0,
        }
    }

    fn device() -> DeviceState {
        DeviceState::new(Ulid::new(), "scope".into(), None, 0)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_overlap_is_boundary_exclusive() {
        let a = Span::new(10, 20);
        assert!(!a.overlaps(&Span::new(20, 30)));
        assert!(!a.overlaps(&Span::new(0, 10)));
        assert!(a.overlaps(&Span::new(19, 30)));
        assert!(a.overlaps(&Span::new(0, 11)));
        assert!(a.overlaps(&Span::new(12, 15)));
    }

    #[test]
    fn span_checked_rejects_empty_and_inverted() {
        assert!(Span::checked(5, 5).is_none());
        assert!(Span::checked(6, 5).is_none());
        assert_eq!(Span::checked(5, 6), Some(Span::new(5, 6)));
    }

    #[test]
    fn reservations_stay_sorted() {
        let mut d = device();
        d.insert_reservation(reservation(300, 400));
        d.insert_reservation(reservation(100, 200));
        d.insert_reservation(reservation(200, 300));
        let starts: Vec<Ms> = d.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut d = device();
        let ids: Vec<Ulid> = (0..3)
            .map(|i| {
                let r = reservation(i * 100, i * 100 + 50);
                let id = r.id;
                d.insert_reservation(r);
                id
            })
            .collect();
        assert!(d.remove_reservation(ids[1]).is_some());
        assert_eq!(d.reservations.len(), 2);
        assert_eq!(d.reservations[0].id, ids[0]);
        assert_eq!(d.reservations[1].id, ids[2]);
        assert!(d.remove_reservation(ids[1]).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut d = device();
        d.insert_reservation(reservation(100, 200));
        d.insert_reservation(reservation(450, 600));
        d.insert_reservation(reservation(1000, 1100));

        let hits: Vec<_> = d.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut d = device();
        d.insert_reservation(reservation(100, 200));
        assert_eq!(d.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(d.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn event_device_routing() {
        let r = reservation(0, 10);
        let event = Event::ReservationCreated { reservation: r.clone() };
        assert_eq!(event.device_id(), Some(r.device_id));
        assert_eq!(Event::DeviceTypeDeleted { id: Ulid::new() }.device_id(), None);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationUpdated {
            previous_device_id: Ulid::new(),
            reservation: reservation(1_000, 2_000),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
