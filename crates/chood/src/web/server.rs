//! HTTP surface: embedded dashboard, state/graph snapshots, SSE stream.
//!
//! Local-only; the listener binds 127.0.0.1 and carries no authentication.

use crate::web::sse::SseHub;
use crate::web::state::{SharedState, StateResponse};
use axum::{
    extract::State,
    http::header,
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        Html, IntoResponse,
    },
    routing::get,
    Json, Router,
};
use futures_util::stream::Stream;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub live: SharedState,
    pub hub: Arc<SseHub>,
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/state", get(get_state))
        .route("/api/graph", get(get_graph))
        .route("/api/events", get(stream_events))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server on 127.0.0.1.
pub async fn start_server(
    state: AppState,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("dashboard listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

/// GET / - embedded dashboard page.
async fn index() -> impl IntoResponse {
    Html(include_str!("../../static/index.html"))
}

/// GET /api/state - live state snapshot with per-status summary.
async fn get_state(State(state): State<AppState>) -> impl IntoResponse {
    let live = state.live.read().await;
    Json(StateResponse::snapshot(&live))
}

/// GET /api/graph - dependency graph; empty until a run announces one.
async fn get_graph(State(state): State<AppState>) -> impl IntoResponse {
    let live = state.live.read().await;
    Json(live.graph.clone())
}

/// GET /api/events - SSE stream of forwarded orchestrator events.
async fn stream_events(
    State(state): State<AppState>,
) -> ([(header::HeaderName, &'static str); 2], Sse<impl Stream<Item = Result<SseEvent, Infallible>>>)
{
    let (client_id, rx) = state.hub.register();
    let hub = Arc::clone(&state.hub);

    let stream = futures_util::stream::unfold(
        (rx, hub, client_id),
        |(mut rx, hub, client_id)| async move {
            match rx.recv().await {
                Some(event) => {
                    let data = serde_json::to_string(&event).unwrap_or_default();
                    let sse = SseEvent::default().event(&event.event_type).data(data);
                    Some((Ok(sse), (rx, hub, client_id)))
                }
                None => {
                    hub.unregister(client_id);
                    None
                }
            }
        },
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::web::state;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use choo_core::events::{EventType, WireEvent};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_app() -> (Router, AppState) {
        let app_state = AppState {
            live: state::shared(),
            hub: Arc::new(SseHub::new(8)),
        };
        (create_router(app_state.clone()), app_state)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn index_serves_dashboard() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn state_endpoint_reports_waiting_when_no_run() {
        let (app, _) = test_app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/state")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["connected"], false);
        // Absence of runs renders as pending, not success.
        assert_eq!(json["status"], "waiting");
        assert_eq!(json["summary"]["total"], 0);
    }

    #[tokio::test]
    async fn graph_endpoint_empty_until_received() {
        let (app, app_state) = test_app();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/graph")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["nodes"].as_array().unwrap().len(), 0);
        assert_eq!(json["edges"].as_array().unwrap().len(), 0);

        // Feed a graph through the live state and re-read.
        let event = WireEvent::new(EventType::OrchStarted).with_payload(&serde_json::json!({
            "unit_count": 1,
            "parallelism": 1,
            "graph": {
                "nodes": [{"id": "a", "level": 0}],
                "edges": [],
                "levels": [["a"]],
            },
        }));
        app_state.live.write().await.apply(&event);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/graph")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["nodes"][0]["id"], "a");
    }

    #[tokio::test]
    async fn events_endpoint_is_event_stream() {
        let (app, app_state) = test_app();

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/events")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .map(|v| v.to_str().unwrap_or("")),
            Some("text/event-stream")
        );
        assert_eq!(
            response
                .headers()
                .get(header::CACHE_CONTROL)
                .map(|v| v.to_str().unwrap_or("")),
            Some("no-cache")
        );
        assert_eq!(app_state.hub.client_count(), 1);
    }
}
