use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use iglu_scheduler::config::{
    ContainerConfig, ControllerConfig, HealthCheckConfig, NodeConfig, StoreConfig,
};
use iglu_scheduler::context::AgentContext;
use iglu_scheduler::controller::{
    ControllerClient, HttpController, NodeCredentials, RegistrationRequest,
};
use iglu_scheduler::dashboard::{run_dashboard, DashboardState};
use iglu_scheduler::naming::CONTAINER_PREFIX;
use iglu_scheduler::node::{decode_channel_message, Agent, AgentEvent};
use iglu_scheduler::protocol::{HealthReport, BUILD_CHANNEL, NODE_CHANNEL};
use iglu_scheduler::runtime::{ContainerRuntime, DockerCli};
use iglu_scheduler::shutdown::{cancel_when_closed, install_shutdown_handler};
use iglu_scheduler::store::RedisStore;
use iglu_scheduler::worker::lifecycle;

#[derive(Parser, Debug)]
#[command(name = "iglu-scheduler")]
#[command(version)]
#[command(about = "Build node agent: claims fleet jobs and runs them in builder containers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Register with the controller and start building
    Server(ServerArgs),

    /// Query the health of a running node
    Status(ClientArgs),
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Port of the node's HTTP surface
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Address advertised to the controller
    #[arg(long, env = "INTERFACE", default_value = "localhost")]
    interface: String,

    /// Pre-shared key of this node (random when unset)
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    auth_token: Option<String>,

    #[arg(long, env = "NODE_NAME", default_value = "scheduler")]
    node_name: String,

    /// Maximum number of concurrent builds
    #[arg(long, env = "MAX_BUILDS", default_value = "5")]
    max_builds: usize,

    /// Base URL of the controller, e.g. http://localhost:3000
    #[arg(long, env = "CONTROLLER_URL")]
    controller_url: String,

    #[arg(long, env = "CONTROLLER_REGISTRATION_KEY", hide_env_values = true)]
    controller_registration_key: String,

    #[arg(long, env = "REDIS_HOST")]
    redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value = "6379")]
    redis_port: u16,

    #[arg(long, env = "REDIS_USER", default_value = "default")]
    redis_user: String,

    #[arg(long, env = "REDIS_PASSWORD", default_value = "", hide_env_values = true)]
    redis_password: String,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "LOGGER_FORMAT", default_value = "pretty")]
    log_format: LogFormat,

    /// Override the detected native architecture
    #[arg(long, env = "NODE_ARCH")]
    arch: Option<String>,

    /// Accept jobs for the architectures in --cross-arches
    #[arg(long, env = "CROSS_BUILD")]
    cross_build: bool,

    #[arg(long, env = "CROSS_ARCHES", value_delimiter = ',')]
    cross_arches: Vec<String>,

    /// Seconds an unanswered claim keeps a job reserved
    #[arg(long, env = "CLAIM_TIMEOUT_SECS", default_value = "60")]
    claim_timeout_secs: u64,

    #[arg(long, env = "BUILDER_IMAGE")]
    builder_image: Option<String>,

    #[arg(long, env = "DOCKER_NETWORK")]
    docker_network: Option<String>,

    /// Reach builders through published localhost ports
    #[arg(long, env = "PUBLISH_PORTS")]
    publish_ports: bool,

    #[arg(long, env = "PRIVILEGED")]
    privileged: bool,

    #[arg(long, env = "HEALTHCHECK_ATTEMPTS", default_value = "10")]
    healthcheck_attempts: u32,

    #[arg(long, env = "HEALTHCHECK_DELAY_MS", default_value = "1000")]
    healthcheck_delay_ms: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Node address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:3000")]
    addr: String,

    /// Pre-shared key of the node
    #[arg(long, env = "AUTH_TOKEN", hide_env_values = true)]
    token: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Status(client) => handle_status(&client).await?,
    }

    Ok(())
}

fn init_logging(level: &str, format: &LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn build_config(args: &ServerArgs, psk: String) -> Result<NodeConfig, Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    if args.max_builds == 0 {
        return Err("--max-builds must be at least 1".into());
    }

    let defaults = ContainerConfig::default();
    let container = ContainerConfig {
        image: args.builder_image.clone().unwrap_or(defaults.image),
        network: args.docker_network.clone().unwrap_or(defaults.network),
        log_level: args.log_level.to_uppercase(),
        privileged: args.privileged,
        publish_ports: args.publish_ports || defaults.publish_ports,
        ..defaults
    };

    Ok(NodeConfig {
        node_name: args.node_name.clone(),
        psk,
        listen_addr,
        advertise_address: args.interface.clone(),
        max_builds: args.max_builds,
        arch: args
            .arch
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string()),
        cross_build: args.cross_build,
        cross_arches: args.cross_arches.clone(),
        claim_timeout: Duration::from_secs(args.claim_timeout_secs),
        container,
        health: HealthCheckConfig {
            attempts: args.healthcheck_attempts,
            delay: Duration::from_millis(args.healthcheck_delay_ms),
        },
        store: StoreConfig {
            host: args.redis_host.clone(),
            port: args.redis_port,
            user: args.redis_user.clone(),
            password: args.redis_password.clone(),
        },
        controller: ControllerConfig {
            url: args.controller_url.clone(),
            registration_key: args.controller_registration_key.clone(),
        },
    })
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging(&args.log_level, &args.log_format);

    let psk = args
        .auth_token
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let config = build_config(&args, psk)?;

    // Register with the controller; everything afterwards is keyed by the
    // node id it hands out.
    let controller = HttpController::new(&config.controller.url, &config.controller.registration_key)?;
    let registration = controller
        .register(&RegistrationRequest {
            node_name: config.node_name.clone(),
            node_psk: config.psk.clone(),
            node_address: config.advertise_address.clone(),
            node_port: config.listen_addr.port(),
            node_version: env!("CARGO_PKG_VERSION").to_string(),
            node_arch: config.arch.clone(),
            node_os: std::env::consts::OS.to_string(),
            node_max_jobs: config.max_builds,
        })
        .await?;
    let node_id = registration.node_id;
    let controller = controller.with_credentials(NodeCredentials {
        node_id: node_id.clone(),
        psk: config.psk.clone(),
    });

    tracing::info!(
        node_id = %node_id,
        node_name = %config.node_name,
        listen_addr = %config.listen_addr,
        max_builds = config.max_builds,
        arch = %config.arch,
        cross_arches = ?config.cross_arches,
        "Node registered with controller"
    );

    let store = Arc::new(RedisStore::connect(&config.store).await?);
    let mut messages = store.subscribe(&[BUILD_CHANNEL, NODE_CHANNEL]).await?;

    let runtime = Arc::new(DockerCli::new(CONTAINER_PREFIX));
    let mut runtime_events = runtime.events().await?;

    let listen_addr = config.listen_addr;
    let ctx = AgentContext::new(
        node_id.clone(),
        config,
        store,
        runtime.clone(),
        Arc::new(controller),
    );

    let shutdown = install_shutdown_handler();
    let mut agent = Agent::new(ctx.clone(), shutdown.clone());
    if let Err(e) = agent.restore().await {
        tracing::warn!(error = %e, "Failed to restore persisted queue");
    }

    let tx = agent.sender();
    cancel_when_closed(shutdown.clone(), "channel subscription", async move {
        while let Some((channel, payload)) = messages.recv().await {
            if let Some(event) = decode_channel_message(&channel, &payload) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    });

    let tx = agent.sender();
    cancel_when_closed(shutdown.clone(), "runtime events", async move {
        while let Some(event) = runtime_events.recv().await {
            if tx.send(AgentEvent::Runtime(event)).await.is_err() {
                return;
            }
        }
    });

    // Containers from an earlier incarnation are stopped once the event
    // stream is live, so their termination reaches the orphan path.
    tokio::spawn(async move {
        match lifecycle::reconcile(runtime.as_ref(), &node_id).await {
            Ok(0) => {}
            Ok(stopped) => tracing::info!(stopped, "Stopped leftover builder containers"),
            Err(e) => tracing::warn!(error = %e, "Failed to list leftover containers"),
        }
    });

    let dashboard_state = DashboardState {
        ctx,
        snapshot: agent.snapshot(),
        started_at: agent.started_at(),
    };
    let dashboard_shutdown = shutdown.clone();
    tokio::spawn(async move {
        run_dashboard(listen_addr, dashboard_state, dashboard_shutdown).await;
    });

    agent.run().await;
    tracing::info!("Node stopped");
    Ok(())
}

// =============================================================================
// Client Handlers
// =============================================================================

async fn handle_status(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/v1/health", client.addr.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .get(url)
        .bearer_auth(&client.token)
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(format!("Node returned {}", response.status()).into());
    }
    let report: HealthReport = response.json().await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => {
            println!("Node:     {}", report.node_id);
            println!("Status:   {}", report.status);
            println!("Version:  {}", report.version);
            println!("Platform: {}/{}", report.os, report.arch);
            println!("Uptime:   {}s", report.uptime);
            println!("Running:  {}", report.running);
            println!("Queued:   {}", report.queued);
        }
    }
    Ok(())
}
