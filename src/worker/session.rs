//! Supervision of one build once its container has started.
//!
//! The session resolves the builder's address, waits for it to become
//! healthy, streams the build configuration in over a WebSocket and relays
//! every inbound frame into the run's log until the builder closes the
//! stream. It never finalizes the run itself: the outcome is reported back
//! to the agent, which owns the container's lifecycle.

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::context::AgentContext;
use crate::error::{Result, SchedulerError};
use crate::run_state::BuildUpdate;
use crate::scheduler::job::RunStatus;
use crate::store::CoordinationStoreExt;
use crate::worker::health;

pub const HEALTHCHECK_PATH: &str = "/api/v1/healthcheck";
pub const BUILD_PATH: &str = "/api/v1/build";

type BuildStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Identifies the build a session supervises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    pub job_id: String,
    pub builder_id: i64,
    pub container_name: String,
}

/// How a build stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub status: RunStatus,
    /// `None` when the stream ended without a close frame
    pub close_code: Option<u16>,
    pub frames: usize,
}

#[derive(Debug)]
pub enum SessionReport {
    /// The stream never opened; the container must be torn down
    StartupFailed(SchedulerError),
    Closed(SessionOutcome),
}

/// Normal closure is the only successful ending of a build.
pub fn status_for_close(code: Option<u16>) -> RunStatus {
    match code {
        Some(code) if code == u16::from(CloseCode::Normal) => RunStatus::Success,
        _ => RunStatus::Failed,
    }
}

/// Run the startup sequence and then the stream read loop.
///
/// `abort` interrupts the startup sequence only; once the stream is open the
/// builder decides how it ends.
pub async fn run(ctx: AgentContext, request: SessionRequest, abort: CancellationToken) -> SessionReport {
    let stream = tokio::select! {
        _ = abort.cancelled() => {
            return SessionReport::StartupFailed(SchedulerError::Runtime(format!(
                "container {} exited before the build stream opened",
                request.container_name
            )));
        }
        result = open(&ctx, &request) => result,
    };

    match stream {
        Ok(stream) => SessionReport::Closed(read_frames(&ctx, &request, stream).await),
        Err(e) => SessionReport::StartupFailed(e),
    }
}

async fn open(ctx: &AgentContext, request: &SessionRequest) -> Result<BuildStream> {
    let container = &ctx.config.container;
    let info = ctx.runtime.inspect(&request.container_name).await?;
    let endpoint = info
        .endpoint(&container.network, container.builder_port)
        .ok_or_else(|| {
            SchedulerError::Runtime(format!(
                "container {} has no address on network {}",
                request.container_name, container.network
            ))
        })?;
    debug!(job_id = %request.job_id, endpoint = %endpoint, "Resolved builder endpoint");

    let client = health::probe_client()?;
    health::wait_until_healthy(
        &client,
        &endpoint.http_url(HEALTHCHECK_PATH),
        &request.container_name,
        &ctx.config.health,
    )
    .await?;

    ctx.run_state
        .publish_build_update(&request.job_id, BuildUpdate::status(RunStatus::Starting))
        .await?;

    let config = ctx
        .store
        .build_config(request.builder_id)
        .await?
        .ok_or(SchedulerError::BuildConfigMissing(request.builder_id))?;

    let (mut stream, _) = connect_async(endpoint.ws_url(BUILD_PATH)).await?;
    stream
        .send(Message::Text(build_config_frame(config).to_string()))
        .await?;
    info!(job_id = %request.job_id, endpoint = %endpoint, "Build stream open");

    ctx.run_state
        .publish_build_update(&request.job_id, BuildUpdate::status(RunStatus::Running))
        .await?;
    Ok(stream)
}

fn build_config_frame(config: Value) -> Value {
    json!({ "type": "build_config", "data": config })
}

async fn read_frames(ctx: &AgentContext, request: &SessionRequest, mut stream: BuildStream) -> SessionOutcome {
    let mut frames = 0;
    let close_code = loop {
        let line = match stream.next().await {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
            Some(Ok(Message::Close(frame))) => break frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(job_id = %request.job_id, error = %e, "Build stream failed");
                break None;
            }
            None => break None,
        };

        frames += 1;
        if let Err(e) = ctx
            .run_state
            .publish_build_update(&request.job_id, BuildUpdate::Log(line))
            .await
        {
            warn!(job_id = %request.job_id, error = %e, "Failed to record build log");
        }
    };

    let status = status_for_close(close_code);
    info!(
        job_id = %request.job_id,
        close_code = ?close_code,
        frames,
        status = %status,
        "Build stream closed"
    );
    SessionOutcome {
        status,
        close_code,
        frames,
    }
}
