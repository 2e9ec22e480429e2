use ulid::Ulid;

use crate::model::*;
use crate::time::now_ms;

use super::{Engine, EngineError};

impl Engine {
    pub fn get_device_type(&self, id: &Ulid) -> Result<DeviceType, EngineError> {
        self.device_types
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::DeviceTypeNotFound(*id))
    }

    pub fn list_device_types(&self) -> Vec<DeviceType> {
        let mut out: Vec<DeviceType> = self.device_types.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|t| t.id);
        out
    }

    pub async fn get_device(&self, id: &Ulid) -> Result<DeviceInfo, EngineError> {
        let state = self.device_state(id)?;
        let guard = state.read().await;
        if guard.deleted {
            return Err(EngineError::DeviceNotFound(*id));
        }
        Ok(guard.info())
    }

    pub async fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut out = Vec::new();
        for state in self.device_handles() {
            let guard = state.read().await;
            if !guard.deleted {
                out.push(guard.info());
            }
        }
        out.sort_by_key(|d| d.id);
        out
    }

    pub async fn get_reservation(&self, id: &Ulid) -> Result<Reservation, EngineError> {
        let device_id = self.device_for_reservation(id)?;
        let state = self
            .device_state(&device_id)
            .map_err(|_| EngineError::NotFound(*id))?;
        let guard = state.read().await;
        guard.reservation(id).cloned().ok_or(EngineError::NotFound(*id))
    }

    /// Reservations of one device, sorted by start ascending.
    pub async fn list_by_device(&self, device_id: &Ulid) -> Result<Vec<Reservation>, EngineError> {
        let state = self.device_state(device_id)?;
        let guard = state.read().await;
        if guard.deleted {
            return Err(EngineError::DeviceNotFound(*device_id));
        }
        Ok(guard.reservations.clone())
    }

    /// Every reservation, ordered by start, then device.
    pub async fn list_reservations(&self) -> Vec<Reservation> {
        let mut out = Vec::new();
        for state in self.device_handles() {
            let guard = state.read().await;
            if !guard.deleted {
                out.extend(guard.reservations.iter().cloned());
            }
        }
        out.sort_by_key(|r| (r.span.start, r.device_id));
        out
    }

    /// The reservation running right now on any device.
    pub async fn current_reservation(&self) -> Result<Reservation, EngineError> {
        self.current_reservation_at(now_ms()).await
    }

    /// Reservation whose window contains `at`. Windows on one device are
    /// disjoint, but several devices can be busy at once: the earliest start
    /// wins, then the lowest id.
    pub async fn current_reservation_at(&self, at: Ms) -> Result<Reservation, EngineError> {
        let mut best: Option<Reservation> = None;
        for state in self.device_handles() {
            let guard = state.read().await;
            if guard.deleted {
                continue;
            }
            // Sorted and disjoint: only the last reservation starting at or
            // before `at` can contain it.
            let idx = guard.reservations.partition_point(|r| r.span.start <= at);
            let Some(candidate) = idx.checked_sub(1).map(|i| &guard.reservations[i]) else {
                continue;
            };
            if !candidate.span.contains_instant(at) {
                continue;
            }
            let better = match &best {
                None => true,
                Some(b) => (candidate.span.start, candidate.id) < (b.span.start, b.id),
            };
            if better {
                best = Some(candidate.clone());
            }
        }
        best.ok_or(EngineError::NoCurrentReservation)
    }
}
