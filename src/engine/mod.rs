mod error;
mod mutations;
mod overlap;
mod queries;
pub mod queue;

pub use error::EngineError;
pub use queue::{place_queued, QUEUE_BUFFER_SECS};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::warn;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedDeviceState = Arc<RwLock<DeviceState>>;

/// Answers whether a device id refers to a live device.
pub trait DeviceDirectory {
    fn exists(&self, device_id: &Ulid) -> bool;
}

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

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Waits for one append, drains whatever else is already
/// queued, then commits the whole batch with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };

        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    // Control commands must observe every append queued before them.
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    // A failed batch is cut from the file before anyone is answered.
    let result = wal.append_batch(batch.iter().map(|(event, _)| event));

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        warn!(error = %e, batch = batch.len(), "WAL group commit failed");
    }

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// Reservation store and interval scheduler for one tenant.
///
/// Lock order: `catalog` first, then device locks in ascending id order.
/// Reservation writes take only device locks; device and device-type writes
/// also take `catalog`.
pub struct Engine {
    pub(super) devices: DashMap<Ulid, SharedDeviceState>,
    pub(super) device_types: DashMap<Ulid, DeviceType>,
    /// Reservation id → device id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    pub(super) catalog: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

impl DeviceDirectory for Engine {
    fn exists(&self, device_id: &Ulid) -> bool {
        self.devices.contains_key(device_id)
    }
}

/// Apply a reservation event to the device(s) it touches. `target` is the
/// device named by the event; `source` is the previous device of a moved
/// reservation and `None` otherwise.
fn apply_reservation_event(
    target: &mut DeviceState,
    source: Option<&mut DeviceState>,
    event: &Event,
    index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::ReservationCreated { reservation } => {
            target.insert_reservation(reservation.clone());
            index.insert(reservation.id, reservation.device_id);
        }
        Event::ReservationUpdated { reservation, .. } => {
            match source {
                Some(prev) => prev.remove_reservation(reservation.id),
                None => target.remove_reservation(reservation.id),
            };
            target.insert_reservation(reservation.clone());
            index.insert(reservation.id, reservation.device_id);
        }
        Event::ReservationDeleted { id, .. } => {
            target.remove_reservation(*id);
            index.remove(id);
        }
        Event::DeviceUpdated {
            name,
            device_type_id,
            at,
            ..
        } => {
            target.name = name.clone();
            target.device_type_id = *device_type_id;
            target.modified_at = *at;
        }
        Event::DeviceTypeCreated { .. }
        | Event::DeviceTypeDeleted { .. }
        | Event::DeviceCreated { .. }
        | Event::DeviceDeleted { .. } => {}
    }
}

/// Rebuild in-memory state from WAL events. Events that reference a device
/// missing at that point in the log are skipped.
fn replay_into(
    events: &[Event],
    devices: &mut HashMap<Ulid, DeviceState>,
    device_types: &DashMap<Ulid, DeviceType>,
    index: &DashMap<Ulid, Ulid>,
) {
    for event in events {
        match event {
            Event::DeviceTypeCreated { device_type } => {
                device_types.insert(device_type.id, device_type.clone());
            }
            Event::DeviceTypeDeleted { id } => {
                device_types.remove(id);
            }
            Event::DeviceCreated {
                id,
                name,
                device_type_id,
                at,
            } => {
                devices.insert(*id, DeviceState::new(*id, name.clone(), *device_type_id, *at));
            }
            Event::DeviceDeleted { id } => {
                if let Some(state) = devices.remove(id) {
                    for r in &state.reservations {
                        index.remove(&r.id);
                    }
                }
            }
            Event::ReservationUpdated {
                previous_device_id,
                reservation,
            } if *previous_device_id != reservation.device_id => {
                let Some(mut prev) = devices.remove(previous_device_id) else {
                    warn!(device_id = %previous_device_id, "replay: moved reservation from unknown device");
                    continue;
                };
                match devices.get_mut(&reservation.device_id) {
                    Some(target) => apply_reservation_event(target, Some(&mut prev), event, index),
                    None => warn!(device_id = %reservation.device_id, "replay: moved reservation to unknown device"),
                }
                devices.insert(*previous_device_id, prev);
            }
            other => {
                let Some(device_id) = other.device_id() else {
                    continue;
                };
                match devices.get_mut(&device_id) {
                    Some(target) => apply_reservation_event(target, None, other, index),
                    None => warn!(%device_id, "replay: event for unknown device skipped"),
                }
            }
        }
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (events, valid_len) = Wal::replay_prefix(&wal_path)?;
        let wal = Wal::open_at(&wal_path, valid_len)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let device_types = DashMap::new();
        let reservation_index = DashMap::new();
        let mut devices = HashMap::new();
        replay_into(&events, &mut devices, &device_types, &reservation_index);

        let engine = Self {
            devices: devices
                .into_iter()
                .map(|(id, state)| (id, Arc::new(RwLock::new(state))))
                .collect(),
            device_types,
            reservation_index,
            catalog: Mutex::new(()),
            wal_tx,
            notify,
        };
        tracing::info!(
            path = %wal_path.display(),
            events = events.len(),
            devices = engine.devices.len(),
            reservations = engine.reservation_index.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub(super) fn device_state(&self, id: &Ulid) -> Result<SharedDeviceState, EngineError> {
        self.devices
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::DeviceNotFound(*id))
    }

    pub(super) fn device_for_reservation(&self, id: &Ulid) -> Result<Ulid, EngineError> {
        self.reservation_index
            .get(id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*id))
    }

    /// WAL-append + apply + notify while the caller holds the device lock.
    pub(super) async fn persist_and_apply(
        &self,
        target: &mut DeviceState,
        source: Option<&mut DeviceState>,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_reservation_event(target, source, event, &self.reservation_index);
        self.publish(event);
        Ok(())
    }

    pub(super) fn publish(&self, event: &Event) {
        if let Event::ReservationUpdated {
            previous_device_id,
            reservation,
        } = event
            && *previous_device_id != reservation.device_id
        {
            self.notify.send(*previous_device_id, event);
        }
        if let Some(device_id) = event.device_id() {
            self.notify.send(device_id, event);
        }
    }

    /// Committed events touching `device_id`, from now on.
    pub fn subscribe(&self, device_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(device_id)
    }
}
