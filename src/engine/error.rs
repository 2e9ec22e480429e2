use thiserror::Error;
use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid interval: start {start} must be before end {end}")]
    InvalidInterval { start: Ms, end: Ms },
    #[error("invalid duration: simulation_time must be positive, got {0}")]
    InvalidDuration(i64),
    #[error("device not found: {0}")]
    DeviceNotFound(Ulid),
    #[error("device type not found: {0}")]
    DeviceTypeNotFound(Ulid),
    #[error("reservation not found: {0}")]
    NotFound(Ulid),
    #[error("no reservation is active right now")]
    NoCurrentReservation,
    #[error("device {device_id} is already reserved by {reservation_id} in that window")]
    Conflict { device_id: Ulid, reservation_id: Ulid },
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("device type {0} is still used by a device")]
    DeviceTypeInUse(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

impl EngineError {
    /// HTTP-equivalent status class.
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::InvalidInterval { .. }
            | EngineError::InvalidDuration(_)
            | EngineError::LimitExceeded(_) => 400,
            EngineError::DeviceNotFound(_)
            | EngineError::DeviceTypeNotFound(_)
            | EngineError::NotFound(_)
            | EngineError::NoCurrentReservation => 404,
            EngineError::Conflict { .. }
            | EngineError::AlreadyExists(_)
            | EngineError::DeviceTypeInUse(_) => 409,
            EngineError::Wal(_) => 500,
        }
    }

    /// SQLSTATE reported over the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::InvalidInterval { .. }
            | EngineError::InvalidDuration(_)
            | EngineError::LimitExceeded(_) => "22023",
            EngineError::DeviceNotFound(_)
            | EngineError::DeviceTypeNotFound(_)
            | EngineError::NotFound(_)
            | EngineError::NoCurrentReservation => "P0002",
            EngineError::Conflict { .. } => "23P01",
            EngineError::AlreadyExists(_) => "23505",
            EngineError::DeviceTypeInUse(_) => "23503",
            EngineError::Wal(_) => "58030",
        }
    }
}
