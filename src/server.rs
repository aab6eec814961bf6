//! Optional JSON control API over a running session.

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::error::ScanError;
use crate::session::SessionHandle;

pub const DEFAULT_BIND: &str = "127.0.0.1:8080";

#[derive(Clone)]
pub struct AppState {
    session: SessionHandle,
}

/// Reply to the pause/resume/stop actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControlReply {
    pub paused: bool,
    /// False when the request did not change anything.
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShuffleReply {
    pub remaining: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReply {
    pub error: String,
}

pub fn router(session: SessionHandle) -> Router {
    let api = Router::new()
        .route("/status", get(get_status))
        .route("/results", get(get_results))
        .route("/pause", post(post_pause))
        .route("/resume", post(post_resume))
        .route("/shuffle", post(post_shuffle))
        .route("/stop", post(post_stop))
        .with_state(AppState { session });

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Serves the control API until the session's notification channel closes.
pub async fn serve(bind: &str, session: SessionHandle) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "control API listening");
    let mut done = session.subscribe();
    axum::serve(listener, router(session))
        .with_graceful_shutdown(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                match done.recv().await {
                    Ok(crate::types::Notification::Finished(_)) | Err(RecvError::Closed) => break,
                    _ => {}
                }
            }
        })
        .await?;
    Ok(())
}

fn error_response(err: ScanError) -> Response {
    let status = match err {
        ScanError::NotPaused | ScanError::ProbingFinished => StatusCode::CONFLICT,
        ScanError::SessionClosed => StatusCode::GONE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %err, "control request failed");
    }
    (
        status,
        Json(ErrorReply {
            error: err.to_string(),
        }),
    )
        .into_response()
}

async fn get_status(State(app): State<AppState>) -> Response {
    match app.session.snapshot().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_results(State(app): State<AppState>) -> Response {
    match app.session.ranked().await {
        Ok(ranked) => (StatusCode::OK, Json(ranked)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn post_pause(State(app): State<AppState>) -> impl IntoResponse {
    let changed = app.session.pause();
    Json(ControlReply {
        paused: app.session.is_paused(),
        changed,
    })
}

async fn post_resume(State(app): State<AppState>) -> impl IntoResponse {
    let changed = app.session.resume();
    Json(ControlReply {
        paused: app.session.is_paused(),
        changed,
    })
}

async fn post_shuffle(State(app): State<AppState>) -> Response {
    match app.session.shuffle().await {
        Ok(remaining) => (StatusCode::OK, Json(ShuffleReply { remaining })).into_response(),
        Err(e) => error_response(e),
    }
}

async fn post_stop(State(app): State<AppState>) -> impl IntoResponse {
    let changed = !app.session.is_stopped();
    app.session.stop();
    (
        StatusCode::ACCEPTED,
        Json(ControlReply {
            paused: app.session.is_paused(),
            changed,
        }),
    )
}
