//! Key pool events.

use crate::key::KeyStatus;
use reliapi_core::GatewayEvent;
use std::time::Instant;

/// Events emitted by the key pool manager.
#[derive(Debug, Clone)]
pub enum KeyPoolEvent {
    /// A key changed status (degraded, exhausted, or recovered).
    StatusChanged {
        key_id: String,
        provider: String,
        from: KeyStatus,
        to: KeyStatus,
        timestamp: Instant,
    },
    /// A provider pool has no active keys left.
    PoolExhausted {
        provider: String,
        timestamp: Instant,
    },
}

impl GatewayEvent for KeyPoolEvent {
    fn event_type(&self) -> &'static str {
        match self {
            KeyPoolEvent::StatusChanged { .. } => "status_changed",
            KeyPoolEvent::PoolExhausted { .. } => "pool_exhausted",
        }
    }

    fn timestamp(&self) -> Instant {
        match self {
            KeyPoolEvent::StatusChanged { timestamp, .. }
            | KeyPoolEvent::PoolExhausted { timestamp, .. } => *timestamp,
        }
    }
}
