use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::{oneshot, RwLock};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::time::now_ms;

use super::overlap::{check_no_conflict, validate_span};
use super::queue::{place_queued, queued_duration_ms};
use super::{DeviceDirectory, Engine, EngineError, SharedDeviceState, WalCommand};

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// Stored record with `patch` folded in. The merged window is validated
/// here so a bad patch never reaches the conflict check.
fn merge_patch(
    current: &Reservation,
    patch: &ReservationPatch,
    now: Ms,
) -> Result<Reservation, EngineError> {
    let span = validate_span(
        patch.start.unwrap_or(current.span.start),
        patch.end.unwrap_or(current.span.end),
    )?;
    Ok(Reservation {
        device_id: patch.device_id.unwrap_or(current.device_id),
        span,
        modified_at: now,
        ..current.clone()
    })
}

impl Engine {
    // ── Device types ─────────────────────────────────────────────

    pub async fn create_device_type(
        &self,
        id: Option<Ulid>,
        name: String,
    ) -> Result<DeviceType, EngineError> {
        check_name(&name, "device type name too long")?;
        let _catalog = self.catalog.lock().await;

        let id = id.unwrap_or_else(Ulid::new);
        if self.device_types.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if self.device_types.len() >= MAX_DEVICE_TYPES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many device types"));
        }

        let now = now_ms();
        let device_type = DeviceType {
            id,
            name,
            created_at: now,
            modified_at: now,
        };
        self.wal_append(&Event::DeviceTypeCreated {
            device_type: device_type.clone(),
        })
        .await?;
        self.device_types.insert(id, device_type.clone());
        info!(device_type_id = %id, name = %device_type.name, "device type created");
        Ok(device_type)
    }

    pub async fn delete_device_type(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        if !self.device_types.contains_key(&id) {
            return Err(EngineError::DeviceTypeNotFound(id));
        }
        // Device type references only change under the catalog lock, which we hold.
        for state in self.device_handles() {
            if state.read().await.device_type_id == Some(id) {
                return Err(EngineError::DeviceTypeInUse(id));
            }
        }

        self.wal_append(&Event::DeviceTypeDeleted { id }).await?;
        self.device_types.remove(&id);
        info!(device_type_id = %id, "device type deleted");
        Ok(())
    }

    // ── Devices ──────────────────────────────────────────────────

    pub async fn create_device(
        &self,
        id: Option<Ulid>,
        name: String,
        device_type_id: Option<Ulid>,
    ) -> Result<DeviceInfo, EngineError> {
        check_name(&name, "device name too long")?;
        let _catalog = self.catalog.lock().await;

        let id = id.unwrap_or_else(Ulid::new);
        if self.devices.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(type_id) = device_type_id
            && !self.device_types.contains_key(&type_id)
        {
            return Err(EngineError::DeviceTypeNotFound(type_id));
        }
        if self.devices.len() >= MAX_DEVICES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many devices"));
        }

        let now = now_ms();
        let event = Event::DeviceCreated {
            id,
            name: name.clone(),
            device_type_id,
            at: now,
        };
        self.wal_append(&event).await?;
        let state = DeviceState::new(id, name, device_type_id, now);
        let info = state.info();
        self.devices.insert(id, Arc::new(RwLock::new(state)));
        self.publish(&event);
        info!(device_id = %id, name = %info.name, "device created");
        Ok(info)
    }

    pub async fn update_device(
        &self,
        id: Ulid,
        patch: DevicePatch,
    ) -> Result<DeviceInfo, EngineError> {
        if let Some(name) = &patch.name {
            check_name(name, "device name too long")?;
        }
        let _catalog = self.catalog.lock().await;
        let state = self.device_state(&id)?;
        let mut guard = state.write().await;
        if guard.deleted {
            return Err(EngineError::DeviceNotFound(id));
        }

        let device_type_id = patch.device_type_id.unwrap_or(guard.device_type_id);
        if let Some(type_id) = device_type_id
            && !self.device_types.contains_key(&type_id)
        {
            return Err(EngineError::DeviceTypeNotFound(type_id));
        }
        let event = Event::DeviceUpdated {
            id,
            name: patch.name.unwrap_or_else(|| guard.name.clone()),
            device_type_id,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, None, &event).await?;
        info!(device_id = %id, "device updated");
        Ok(guard.info())
    }

    /// Remove a device together with all of its reservations.
    pub async fn delete_device(&self, id: Ulid) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let state = self.device_state(&id)?;
        let mut guard = state.write().await;
        if guard.deleted {
            return Err(EngineError::DeviceNotFound(id));
        }

        let event = Event::DeviceDeleted { id };
        self.wal_append(&event).await?;
        guard.deleted = true;
        for r in &guard.reservations {
            self.reservation_index.remove(&r.id);
        }
        let dropped = guard.reservations.len();
        guard.reservations.clear();
        self.devices.remove(&id);
        self.publish(&event);
        drop(guard);
        self.notify.remove(&id);
        info!(device_id = %id, reservations = dropped, "device deleted");
        Ok(())
    }

    // ── Reservations ─────────────────────────────────────────────

    /// Reserve `[start, end)` on a device, failing on any overlap.
    pub async fn create_reservation(
        &self,
        id: Option<Ulid>,
        device_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Reservation, EngineError> {
        let span = validate_span(start, end)?;
        let state = self.device_state(&device_id)?;
        let mut guard = state.write().await;
        if guard.deleted {
            return Err(EngineError::DeviceNotFound(device_id));
        }
        check_no_conflict(&guard, &span, None)?;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_DEVICE {
            return Err(EngineError::LimitExceeded("too many reservations on device"));
        }

        let now = now_ms();
        let reservation = Reservation {
            id: self.claim_reservation_id(id, device_id)?,
            device_id,
            span,
            queued: false,
            created_at: now,
            modified_at: now,
        };
        self.commit_new_reservation(&mut guard, &reservation).await?;
        info!(
            reservation_id = %reservation.id,
            %device_id,
            start = span.start,
            end = span.end,
            "reservation created"
        );
        Ok(reservation)
    }

    /// Run `simulation_time_secs` (plus the fixed buffer) on a device as soon
    /// as it is free.
    pub async fn create_queued_reservation(
        &self,
        id: Option<Ulid>,
        device_id: Ulid,
        simulation_time_secs: i64,
    ) -> Result<Reservation, EngineError> {
        self.create_queued_reservation_at(id, device_id, simulation_time_secs, now_ms())
            .await
    }

    pub async fn create_queued_reservation_at(
        &self,
        id: Option<Ulid>,
        device_id: Ulid,
        simulation_time_secs: i64,
        now: Ms,
    ) -> Result<Reservation, EngineError> {
        let duration = queued_duration_ms(simulation_time_secs)?;
        if !self.exists(&device_id) {
            return Err(EngineError::DeviceNotFound(device_id));
        }
        let state = self.device_state(&device_id)?;
        let mut guard = state.write().await;
        if guard.deleted {
            return Err(EngineError::DeviceNotFound(device_id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_DEVICE {
            return Err(EngineError::LimitExceeded("too many reservations on device"));
        }

        let span = place_queued(&guard.reservations, duration, now);
        if span.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let reservation = Reservation {
            id: self.claim_reservation_id(id, device_id)?,
            device_id,
            span,
            queued: true,
            created_at: now,
            modified_at: now,
        };
        self.commit_new_reservation(&mut guard, &reservation).await?;

        let wait_secs = (span.start - now) as f64 / 1_000.0;
        metrics::counter!(crate::observability::QUEUE_PLACEMENTS_TOTAL).increment(1);
        metrics::histogram!(crate::observability::QUEUE_WAIT_SECONDS).record(wait_secs);
        info!(
            reservation_id = %reservation.id,
            %device_id,
            simulation_time_secs,
            start = span.start,
            end = span.end,
            wait_secs,
            "queued reservation placed"
        );
        Ok(reservation)
    }

    /// Merge `patch` into a stored reservation. On any error the stored
    /// record is left as it was.
    pub async fn update_reservation(
        &self,
        id: Ulid,
        patch: ReservationPatch,
    ) -> Result<Reservation, EngineError> {
        loop {
            let source_id = self.device_for_reservation(&id)?;
            let target_id = patch.device_id.unwrap_or(source_id);
            let source = self.device_state(&source_id).map_err(|_| EngineError::NotFound(id))?;

            if target_id == source_id {
                let mut guard = source.write().await;
                let Some(current) = live_reservation(&guard, &id) else {
                    drop(guard);
                    if self.device_for_reservation(&id)? != source_id {
                        continue;
                    }
                    return Err(EngineError::NotFound(id));
                };
                let updated = merge_patch(&current, &patch, now_ms())?;
                check_no_conflict(&guard, &updated.span, Some(id))?;

                let event = Event::ReservationUpdated {
                    previous_device_id: source_id,
                    reservation: updated.clone(),
                };
                self.persist_and_apply(&mut guard, None, &event).await?;
                info!(
                    reservation_id = %id,
                    device_id = %source_id,
                    start = updated.span.start,
                    end = updated.span.end,
                    "reservation updated"
                );
                return Ok(updated);
            }

            let target = match self.device_state(&target_id) {
                Ok(target) => target,
                Err(missing) => {
                    // An inverted interval is reported ahead of a missing target.
                    let guard = source.read().await;
                    let Some(current) = live_reservation(&guard, &id) else {
                        drop(guard);
                        if self.device_for_reservation(&id)? != source_id {
                            continue;
                        }
                        return Err(EngineError::NotFound(id));
                    };
                    merge_patch(&current, &patch, now_ms())?;
                    return Err(missing);
                }
            };
            let (mut source_guard, mut target_guard) = if source_id < target_id {
                let s = source.write().await;
                let t = target.write().await;
                (s, t)
            } else {
                let t = target.write().await;
                let s = source.write().await;
                (s, t)
            };
            let Some(current) = live_reservation(&source_guard, &id) else {
                drop((source_guard, target_guard));
                if self.device_for_reservation(&id)? != source_id {
                    continue;
                }
                return Err(EngineError::NotFound(id));
            };
            let updated = merge_patch(&current, &patch, now_ms())?;
            if target_guard.deleted {
                return Err(EngineError::DeviceNotFound(target_id));
            }
            check_no_conflict(&target_guard, &updated.span, None)?;
            if target_guard.reservations.len() >= MAX_RESERVATIONS_PER_DEVICE {
                return Err(EngineError::LimitExceeded("too many reservations on device"));
            }

            let event = Event::ReservationUpdated {
                previous_device_id: source_id,
                reservation: updated.clone(),
            };
            self.persist_and_apply(&mut target_guard, Some(&mut *source_guard), &event)
                .await?;
            info!(
                reservation_id = %id,
                from = %source_id,
                to = %target_id,
                start = updated.span.start,
                end = updated.span.end,
                "reservation moved"
            );
            return Ok(updated);
        }
    }

    pub async fn delete_reservation(&self, id: Ulid) -> Result<(), EngineError> {
        loop {
            let device_id = self.device_for_reservation(&id)?;
            let state = self.device_state(&device_id).map_err(|_| EngineError::NotFound(id))?;
            let mut guard = state.write().await;
            if live_reservation(&guard, &id).is_none() {
                drop(guard);
                if self.device_for_reservation(&id)? != device_id {
                    continue;
                }
                return Err(EngineError::NotFound(id));
            }

            let event = Event::ReservationDeleted { id, device_id };
            self.persist_and_apply(&mut guard, None, &event).await?;
            info!(reservation_id = %id, %device_id, "reservation deleted");
            return Ok(());
        }
    }

    /// Reserve the id in the index before the WAL write so two concurrent
    /// creates on different devices cannot both take it.
    fn claim_reservation_id(&self, id: Option<Ulid>, device_id: Ulid) -> Result<Ulid, EngineError> {
        let id = id.unwrap_or_else(Ulid::new);
        match self.reservation_index.entry(id) {
            Entry::Occupied(_) => Err(EngineError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(device_id);
                Ok(id)
            }
        }
    }

    async fn commit_new_reservation(
        &self,
        device: &mut DeviceState,
        reservation: &Reservation,
    ) -> Result<(), EngineError> {
        let event = Event::ReservationCreated {
            reservation: reservation.clone(),
        };
        if let Err(e) = self.persist_and_apply(device, None, &event).await {
            self.reservation_index.remove(&reservation.id);
            return Err(e);
        }
        Ok(())
    }

    pub(super) fn device_handles(&self) -> Vec<SharedDeviceState> {
        self.devices.iter().map(|e| e.value().clone()).collect()
    }

    // ── WAL maintenance ──────────────────────────────────────────

    /// Rewrite the WAL as the minimal event set for the current state.
    ///
    /// Holds the catalog lock and a read lock on every device until the new
    /// file is in place, so no write can land in the old log after the
    /// snapshot was taken.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _catalog = self.catalog.lock().await;
        let mut handles: Vec<(Ulid, SharedDeviceState)> = self
            .devices
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(handles.len());
        for (_, state) in &handles {
            guards.push(state.read().await);
        }

        let mut device_types: Vec<DeviceType> =
            self.device_types.iter().map(|e| e.value().clone()).collect();
        device_types.sort_by_key(|t| t.id);

        let mut events: Vec<Event> = device_types
            .into_iter()
            .map(|device_type| Event::DeviceTypeCreated { device_type })
            .collect();
        for device in &guards {
            events.push(Event::DeviceCreated {
                id: device.id,
                name: device.name.clone(),
                device_type_id: device.device_type_id,
                at: device.created_at,
            });
            if device.modified_at != device.created_at {
                events.push(Event::DeviceUpdated {
                    id: device.id,
                    name: device.name.clone(),
                    device_type_id: device.device_type_id,
                    at: device.modified_at,
                });
            }
            events.extend(device.reservations.iter().map(|r| Event::ReservationCreated {
                reservation: r.clone(),
            }));
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))?;
        info!(events = count, "WAL compacted");
        Ok(())
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

fn live_reservation(device: &DeviceState, id: &Ulid) -> Option<Reservation> {
    if device.deleted {
        return None;
    }
    device.reservation(id).cloned()
}
