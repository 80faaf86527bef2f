//! Small HTTP front door of the node.
//!
//! - `GET /`: liveness text
//! - `GET /api/v1/health`: health summary
//! - `GET /api/v1/listen/{job_id}`: Server-Sent Events of one run's updates
//!
//! Everything under `/api` requires `Authorization: Bearer <node psk>`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Json, Router,
};
use futures::stream::{self, BoxStream};
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::context::AgentContext;
use crate::node::{health_report, AgentSnapshot};
use crate::protocol::{BuildUpdateMessage, UpdateKind};

#[derive(Clone)]
pub struct DashboardState {
    pub ctx: AgentContext,
    pub snapshot: watch::Receiver<AgentSnapshot>,
    pub started_at: Instant,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/listen/{job_id}", get(listen_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_psk));

    Router::new()
        .route("/", get(index_handler))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    tracing::info!(addr = %addr, "Starting HTTP server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind HTTP server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
    {
        tracing::error!(error = %e, "HTTP server failed");
    }
}

async fn require_psk(State(state): State<DashboardState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| !state.ctx.config.psk.is_empty() && token == state.ctx.config.psk);

    if !authorized {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    next.run(request).await
}

async fn index_handler() -> &'static str {
    "iglu-scheduler is running"
}

async fn health_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let snapshot = state.snapshot.borrow().clone();
    Json(health_report(&state.ctx, &snapshot, state.started_at))
}

fn to_event(message: &BuildUpdateMessage) -> Option<Result<Event, Infallible>> {
    let name = match message.kind {
        UpdateKind::Log => "log",
        UpdateKind::Status => "status",
    };
    Event::default().event(name).json_data(message).ok().map(Ok)
}

async fn listen_handler(
    State(state): State<DashboardState>,
    Path(job_id): Path<String>,
) -> Response {
    let run_state = &state.ctx.run_state;
    // Subscribe before reading so no update falls between the two.
    let updates = run_state.subscribe(&job_id);

    let record = match run_state.get(&job_id).await {
        Ok(Some(record)) => record,
        Ok(None) => {
            drop(updates);
            run_state.unsubscribe(&job_id);
            return (StatusCode::NOT_FOUND, "Unknown build").into_response();
        }
        Err(e) => {
            tracing::warn!(job_id = %job_id, error = %e, "Failed to read run record");
            drop(updates);
            run_state.unsubscribe(&job_id);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Store unavailable").into_response();
        }
    };

    let terminal = record.status.is_terminal();
    let initial = BuildUpdateMessage {
        kind: UpdateKind::Status,
        build_id: job_id.clone(),
        data: record,
    };
    let head = stream::iter(to_event(&initial));

    let events: BoxStream<'static, Result<Event, Infallible>> = if terminal {
        drop(updates);
        run_state.unsubscribe(&job_id);
        Box::pin(head)
    } else {
        let tail = BroadcastStream::new(updates)
            .filter_map(|update| update.ok())
            .filter_map(|message| to_event(&message));
        Box::pin(head.chain(tail))
    };

    Sse::new(events)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping"))
        .into_response()
}
