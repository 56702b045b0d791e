//! Unix-socket ingress: newline-delimited JSON events from the orchestrator.
//!
//! One orchestrator connection at a time. Lines are capped at 1 MiB;
//! malformed JSON is logged and skipped without aborting the stream. Each
//! valid event updates the live state and fans out to SSE subscribers. The
//! socket file is unlinked before bind (stale files from unclean shutdown)
//! and removed again on stop.

use crate::web::sse::SseHub;
use crate::web::state::SharedState;
use choo_core::events::WireEvent;
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum accepted line length.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Socket path: `$XDG_RUNTIME_DIR/choo/web.sock`, else `~/.choo/web.sock`.
pub fn socket_path() -> PathBuf {
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join("choo").join("web.sock");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".choo")
        .join("web.sock")
}

/// Ingress listener bound to a socket path.
#[derive(Debug)]
pub struct SocketIngress {
    path: PathBuf,
    listener: UnixListener,
}

impl SocketIngress {
    /// Bind, creating the parent directory with mode `0700` and unlinking
    /// any stale socket file first.
    pub fn bind(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            let mut builder = std::fs::DirBuilder::new();
            builder.recursive(true);
            {
                use std::os::unix::fs::DirBuilderExt;
                builder.mode(0o700);
            }
            builder.create(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        info!(path = %path.display(), "socket ingress listening");
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Accept orchestrator connections until cancelled, then unlink the
    /// socket file.
    pub async fn run(self, state: SharedState, hub: Arc<SseHub>, cancel: CancellationToken) {
        loop {
            let stream = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
                () = cancel.cancelled() => break,
            };

            state.write().await.connected = true;
            info!("orchestrator connected");

            handle_connection(stream, &state, &hub, &cancel).await;

            // State is preserved across disconnects; only the flag drops.
            state.write().await.connected = false;
            info!("orchestrator disconnected");

            if cancel.is_cancelled() {
                break;
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(error = %e, "socket file already gone");
        }
    }
}

async fn handle_connection(
    stream: UnixStream,
    state: &SharedState,
    hub: &Arc<SseHub>,
    cancel: &CancellationToken,
) {
    let mut lines = FramedRead::new(stream, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    loop {
        let line = tokio::select! {
            line = lines.next() => line,
            () = cancel.cancelled() => return,
        };

        match line {
            Some(Ok(line)) => dispatch_line(&line, state, hub).await,
            Some(Err(e)) => {
                // Oversized or broken frame; skip it, keep the stream.
                warn!(error = %e, "dropping unreadable line");
            }
            None => return,
        }
    }
}

/// Parse one line and route it. Malformed JSON is logged and skipped.
async fn dispatch_line(line: &str, state: &SharedState, hub: &Arc<SseHub>) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<WireEvent>(line) {
        Ok(event) => {
            state.write().await.apply(&event);
            hub.broadcast(&event);
        }
        Err(e) => {
            warn!(error = %e, line_len = line.len(), "skipping malformed event line");
        }
    }
}
