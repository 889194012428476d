use axum::{
    Router,
    extract::State as AxumState,
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::{Stream, stream};
use serde::Serialize;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;

use crate::state::{AppState, StateView};

#[derive(Serialize)]
struct HealthCheck {
    message: String,
}

pub async fn new_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/state", get(state))
        .route("/state/stream", get(state_stream))
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn state(AxumState(app_state): AxumState<AppState>) -> Json<StateView> {
    Json(app_state.snapshot())
}

async fn state_stream(
    AxumState(app_state): AxumState<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app_state.updates.subscribe();

    let initial = app_state.snapshot();
    let initial_json = serde_json::to_string(&initial).unwrap_or_else(|_| "{}".to_string());
    let initial_event = stream::once(async { Ok(Event::default().data(initial_json)) });

    let update_stream = async_stream::stream! {
        let mut rx = rx;
        loop {
            match rx.recv().await {
                Ok(view) => {
                    match serde_json::to_string(&view) {
                        Ok(json) => yield Ok(Event::default().data(json)),
                        Err(err) => {
                            tracing::warn!("failed to serialize state for SSE: {}", err);
                            yield Ok(Event::default().data("{\"error\":\"serialization_failed\"}"));
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("stream lagged by {} updates, sending current state", n);
                    match serde_json::to_string(&app_state.snapshot()) {
                        Ok(json) => yield Ok(Event::default().data(json)),
                        Err(err) => {
                            tracing::warn!("failed to serialize state after lag: {}", err);
                            yield Ok(Event::default().data("{\"error\":\"serialization_failed\"}"));
                        }
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::error!("state channel closed, ending SSE stream");
                    break;
                }
            }
        }
    };

    let combined = initial_event.chain(update_stream);
    Sse::new(combined).keep_alive(KeepAlive::default())
}

async fn healthz(AxumState(app_state): AxumState<AppState>) -> Response {
    let ready = !app_state.snapshot().namespaces.is_empty();
    if !ready {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthCheck {
                message: "waiting for namespace state".into(),
            }),
        )
            .into_response();
    }
    (
        StatusCode::OK,
        Json(HealthCheck {
            message: "ready".into(),
        }),
    )
        .into_response()
}
