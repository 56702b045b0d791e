//! Per-run event emission: append to the durable log, then fan out.
//!
//! The append is authoritative; the bus side is best-effort and lossy. A
//! failed append is logged and does not abort the operation that produced
//! the event (the orchestrator must not die because monitoring does).

use crate::bus::EventBus;
use crate::storage::Storage;
use choo_core::events::WireEvent;
use choo_core::types::RunId;
use std::sync::Arc;
use tracing::warn;

/// Event sink bound to one run.
#[derive(Debug, Clone)]
pub struct RunEvents {
    storage: Arc<Storage>,
    bus: EventBus,
    run_id: RunId,
}

impl RunEvents {
    pub fn new(storage: Arc<Storage>, bus: EventBus, run_id: RunId) -> Self {
        Self {
            storage,
            bus,
            run_id,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Persist the event, then broadcast it.
    pub async fn emit(&self, event: WireEvent) {
        if let Err(e) = self
            .storage
            .append_event(
                &self.run_id,
                &event.event_type,
                event.unit.as_deref(),
                event.payload.as_ref(),
            )
            .await
        {
            warn!(event_type = %event.event_type, error = %e, "failed to persist event");
        }
        self.bus.emit(event);
    }
}
