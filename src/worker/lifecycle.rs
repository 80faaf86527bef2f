//! Mapping of the runtime's event stream onto per-job container phases.
//!
//! Only events for containers this node owns are considered: the runtime
//! event stream is shared with every other workload on the host.

use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::naming::ContainerName;
use crate::runtime::{ContainerRuntime, ContainerSpec, RuntimeEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    Start,
    Die,
    Stop,
}

impl LifecycleAction {
    fn parse(action: &str) -> Option<Self> {
        match action {
            "start" => Some(LifecycleAction::Start),
            "die" => Some(LifecycleAction::Die),
            "stop" => Some(LifecycleAction::Stop),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleAction::Die | LifecycleAction::Stop)
    }
}

/// A runtime event concerning one of this node's builder containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub action: LifecycleAction,
    pub name: ContainerName,
    pub container_id: String,
}

/// Keep only start/die/stop events of containers named for `node_id`.
pub fn classify(event: &RuntimeEvent, node_id: &str) -> Option<LifecycleEvent> {
    if !event.is_container() {
        return None;
    }
    let action = LifecycleAction::parse(&event.action)?;
    let name = ContainerName::parse(event.container_name()?).ok()?;
    if !name.is_owned_by(node_id) {
        return None;
    }
    Some(LifecycleEvent {
        action,
        name,
        container_id: event.actor.id.clone(),
    })
}

/// Container definition for one job's builder.
pub fn container_spec(config: &NodeConfig, name: &ContainerName) -> ContainerSpec {
    let container = &config.container;
    ContainerSpec {
        name: name.to_string(),
        image: container.image.clone(),
        env: vec![("LOG_LEVEL".to_string(), container.log_level.clone())],
        network_mode: container.network.clone(),
        privileged: container.privileged,
        publish_port: container.publish_ports.then_some(container.builder_port),
    }
}

/// Stop every container left behind by an earlier run of this node.
///
/// The registry starts empty, so each of these is an orphan; its termination
/// event reports the run as failed. Returns the number of containers stopped.
pub async fn reconcile(runtime: &dyn ContainerRuntime, node_id: &str) -> Result<usize> {
    let mut stopped = 0;
    for container in runtime.list().await? {
        let Ok(name) = ContainerName::parse(&container.name) else {
            continue;
        };
        if !name.is_owned_by(node_id) {
            continue;
        }
        info!(container = %name, state = %container.state, "Stopping leftover builder container");
        match runtime.stop(&container.name).await {
            Ok(()) => stopped += 1,
            Err(e) => warn!(container = %name, error = %e, "Failed to stop leftover container"),
        }
    }
    Ok(stopped)
}
