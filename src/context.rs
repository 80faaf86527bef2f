use std::sync::Arc;

use crate::config::NodeConfig;
use crate::controller::ControllerClient;
use crate::run_state::RunState;
use crate::runtime::ContainerRuntime;
use crate::store::CoordinationStore;

/// Shared handles every component of the agent works against.
///
/// Built once at startup and cloned into spawned tasks. Tests build it from
/// in-memory fakes.
#[derive(Clone)]
pub struct AgentContext {
    pub node_id: String,
    pub config: Arc<NodeConfig>,
    pub store: Arc<dyn CoordinationStore>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub controller: Arc<dyn ControllerClient>,
    pub run_state: Arc<RunState>,
}

impl AgentContext {
    pub fn new(
        node_id: impl Into<String>,
        config: NodeConfig,
        store: Arc<dyn CoordinationStore>,
        runtime: Arc<dyn ContainerRuntime>,
        controller: Arc<dyn ControllerClient>,
    ) -> Self {
        let node_id = node_id.into();
        let run_state = Arc::new(RunState::new(
            node_id.clone(),
            store.clone(),
            controller.clone(),
        ));
        Self {
            node_id,
            config: Arc::new(config),
            store,
            runtime,
            controller,
            run_state,
        }
    }
}
