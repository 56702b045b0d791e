//! SSE fan-out hub.
//!
//! Each browser client gets a bounded queue (default 256). Broadcast is a
//! non-blocking send to every client: a full queue drops the event for that
//! client only, and the hub never blocks on a slow consumer.

use choo_core::events::WireEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Default per-client queue depth.
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

/// Fan-out hub over connected SSE clients.
#[derive(Debug)]
pub struct SseHub {
    clients: RwLock<HashMap<u64, mpsc::Sender<WireEvent>>>,
    next_id: AtomicU64,
    buffer: usize,
}

impl Default for SseHub {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_BUFFER)
    }
}

impl SseHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer,
        }
    }

    /// Register a client; the receiver drives its SSE response stream.
    pub fn register(&self) -> (u64, mpsc::Receiver<WireEvent>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(id, tx);
        }
        debug!(client = id, "sse client registered");
        (id, rx)
    }

    /// Drop a client; its queue closes and the response stream ends.
    pub fn unregister(&self, id: u64) {
        if let Ok(mut clients) = self.clients.write() {
            clients.remove(&id);
        }
        debug!(client = id, "sse client unregistered");
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().map(|c| c.len()).unwrap_or(0)
    }

    /// Non-blocking delivery to every client. Full queues drop the event for
    /// that client; closed queues are reaped.
    pub fn broadcast(&self, event: &WireEvent) {
        let mut dead = Vec::new();
        {
            let Ok(clients) = self.clients.read() else {
                return;
            };
            for (id, tx) in clients.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(client = id, event_type = %event.event_type, "sse client buffer full, dropping event");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            if let Ok(mut clients) = self.clients.write() {
                for id in dead {
                    clients.remove(&id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use choo_core::events::EventType;

    fn event(event_type: EventType) -> WireEvent {
        WireEvent::new(event_type)
    }

    #[tokio::test]
    async fn broadcast_reaches_registered_clients() {
        let hub = SseHub::new(8);
        let (_id1, mut rx1) = hub.register();
        let (_id2, mut rx2) = hub.register();

        hub.broadcast(&event(EventType::UnitStarted).with_unit("a"));

        assert_eq!(rx1.recv().await.unwrap().event_type, "unit.started");
        assert_eq!(rx2.recv().await.unwrap().event_type, "unit.started");
    }

    #[tokio::test]
    async fn full_client_drops_event_without_blocking_others() {
        let hub = SseHub::new(1);
        let (_full_id, mut full_rx) = hub.register();
        let (_ok_id, mut ok_rx) = hub.register();

        // Fill the first client's queue.
        hub.broadcast(&event(EventType::TaskStarted));
        // Its queue is now full; this one is dropped for it only.
        hub.broadcast(&event(EventType::TaskCompleted));

        assert_eq!(full_rx.recv().await.unwrap().event_type, "task.started");
        assert_eq!(ok_rx.recv().await.unwrap().event_type, "task.started");
        assert_eq!(ok_rx.recv().await.unwrap().event_type, "task.completed");

        // The full client never saw the dropped event.
        assert!(full_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_does_not_block_measurably() {
        let hub = SseHub::new(1);
        let (_id, _rx) = hub.register();
        hub.broadcast(&event(EventType::TaskStarted));

        let start = std::time::Instant::now();
        for _ in 0..1000 {
            hub.broadcast(&event(EventType::TaskCompleted));
        }
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unregister_closes_queue() {
        let hub = SseHub::new(8);
        let (id, mut rx) = hub.register();
        assert_eq!(hub.client_count(), 1);

        hub.unregister(id);
        assert_eq!(hub.client_count(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_is_reaped_on_broadcast() {
        let hub = SseHub::new(8);
        let (_id, rx) = hub.register();
        drop(rx);

        hub.broadcast(&event(EventType::UnitCompleted));
        assert_eq!(hub.client_count(), 0);
    }
}
