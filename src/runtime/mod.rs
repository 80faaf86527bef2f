//! Container runtime client.
//!
//! The runtime is the only place jobs actually execute. Everything the agent
//! knows about a running job flows back through the runtime's event stream
//! (see [`events`]), correlated by container name.
//!
//! - [`ContainerRuntime`]: start/stop/inspect/list/events
//! - [`DockerCli`]: implementation driving the `docker` CLI

pub mod docker;
pub mod events;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

pub use docker::DockerCli;
pub use events::RuntimeEvent;

/// Everything needed to launch one builder container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub network_mode: String,
    pub privileged: bool,
    /// Container port to publish on a free localhost port, for platforms
    /// where container IPs are not routable from the host.
    pub publish_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedContainer {
    pub id: String,
    /// Host port bound when `publish_port` was requested
    pub host_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    /// Network name → container IP on that network
    pub networks: HashMap<String, String>,
    /// Container port → published host port
    pub published_ports: HashMap<u16, u16>,
}

impl ContainerInfo {
    /// How the agent reaches the builder listening on `port`.
    ///
    /// A published localhost port wins over the network IP: when one exists
    /// the container IP is not routable from the host.
    pub fn endpoint(&self, network: &str, port: u16) -> Option<ContainerEndpoint> {
        if let Some(host_port) = self.published_ports.get(&port) {
            return Some(ContainerEndpoint::new("127.0.0.1", *host_port));
        }
        self.networks
            .get(network)
            .filter(|ip| !ip.is_empty())
            .map(|ip| ContainerEndpoint::new(ip.clone(), port))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub state: String,
}

/// Network address of a builder's HTTP/WebSocket server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEndpoint {
    pub host: String,
    pub port: u16,
}

impl ContainerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", self.host, self.port, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}:{}{}", self.host, self.port, path)
    }
}

impl fmt::Display for ContainerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. Fails with
    /// [`SchedulerError::NameConflict`](crate::error::SchedulerError::NameConflict)
    /// if the name is taken, rather than attaching to a stale container.
    async fn start(&self, spec: &ContainerSpec) -> Result<StartedContainer>;

    /// Stop a container. Absent or already stopped containers are not an error.
    async fn stop(&self, name: &str) -> Result<()>;

    async fn inspect(&self, name: &str) -> Result<ContainerInfo>;

    /// Containers whose name carries the fleet prefix, running or not.
    async fn list(&self) -> Result<Vec<ContainerSummary>>;

    /// Runtime-wide container event stream.
    async fn events(&self) -> Result<mpsc::Receiver<RuntimeEvent>>;
}
