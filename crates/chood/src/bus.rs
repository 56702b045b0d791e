//! In-process event bus.
//!
//! Emission is best-effort and lossy: the central dispatch buffer is bounded
//! (default 1000) and overflow drops the event with a logged warning.
//! Handlers must not rely on lossless delivery; the persisted event log is
//! the source of truth. When a web socket is attached, every dispatched
//! event is also relayed as a JSON line.

use choo_core::events::WireEvent;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

/// Default capacity of the central dispatch buffer.
pub const DEFAULT_BUS_CAPACITY: usize = 1000;

/// Bounded fan-out bus for wire events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::Sender<WireEvent>,
    subscribers: broadcast::Sender<WireEvent>,
}

impl EventBus {
    /// Create a bus with the given central buffer capacity and start its
    /// dispatch task.
    pub fn new(capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<WireEvent>(capacity);
        let (subscribers, _) = broadcast::channel::<WireEvent>(capacity);

        let fanout = subscribers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                // No receivers is fine; the DB already has the event.
                let _ = fanout.send(event);
            }
        });

        Self { tx, subscribers }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }

    /// Non-blocking emit; drops the event when the buffer is full.
    pub fn emit(&self, event: WireEvent) {
        if let Err(e) = self.tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    warn!(event_type = %event.event_type, "event bus full, dropping event");
                }
                mpsc::error::TrySendError::Closed(event) => {
                    debug!(event_type = %event.event_type, "event bus closed, dropping event");
                }
            }
        }
    }

    /// Subscribe to the fan-out side. Slow subscribers observe lag, never
    /// backpressure on the bus.
    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.subscribers.subscribe()
    }

    /// Relay every dispatched event to the web socket as newline-delimited
    /// JSON. Returns an error only when the initial connect fails; a broken
    /// pipe later just stops the relay (the web process keeps DB replay).
    pub async fn forward_to_socket(&self, socket_path: &Path) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(socket_path).await?;
        let mut rx = self.subscribe();

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Ok(mut line) = serde_json::to_string(&event) else {
                            continue;
                        };
                        line.push('\n');
                        if let Err(e) = stream.write_all(line.as_bytes()).await {
                            warn!(error = %e, "web socket relay closed");
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "web socket relay lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use choo_core::events::EventType;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn emit_reaches_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(WireEvent::new(EventType::UnitStarted).with_unit("alpha"));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "unit.started");
        assert_eq!(event.unit.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::new(16);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.emit(WireEvent::new(EventType::OrchCompleted));

        assert_eq!(rx1.recv().await.unwrap().event_type, "orch.completed");
        assert_eq!(rx2.recv().await.unwrap().event_type, "orch.completed");
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_block() {
        let bus = EventBus::new(2);
        for _ in 0..10 {
            bus.emit(WireEvent::new(EventType::TaskCompleted));
        }
        // Dispatch drains the buffer; a late subscriber simply misses them.
        let mut rx = bus.subscribe();
        bus.emit(WireEvent::new(EventType::OrchCompleted));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, "orch.completed");
    }

    #[tokio::test]
    async fn forward_to_socket_writes_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket_path = dir.path().join("web.sock");
        let listener = tokio::net::UnixListener::bind(&socket_path).unwrap();

        let bus = EventBus::new(16);
        bus.forward_to_socket(&socket_path).await.unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        bus.emit(WireEvent::new(EventType::UnitCompleted).with_unit("alpha"));

        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let parsed: WireEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.event_type, "unit.completed");
        assert_eq!(parsed.unit.as_deref(), Some("alpha"));
    }

    #[tokio::test]
    async fn forward_to_missing_socket_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let bus = EventBus::new(16);
        let result = bus.forward_to_socket(&dir.path().join("absent.sock")).await;
        assert!(result.is_err());
    }
}
