use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::NodeConfig;
use crate::protocol::{
    BuildChannelMessage, BuildMessage, ClaimMessage, ClaimResponse, ClaimResult, QueueMessage,
};
use crate::scheduler::queue::LocalQueue;
use crate::scheduler::registry::Registry;

/// What the agent should do with a message from the `build` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Nothing to do; the reason is for logging only
    Ignore(&'static str),
    /// Send a claim request for the job
    Apply { job_id: String, builder_id: i64 },
    /// Drop the job from the queue or stop its container
    Cancel { job_id: String },
    /// The claim was approved; append to the local queue and dispatch
    Enqueue { job_id: String, builder_id: i64 },
}

/// Local view the engine needs to decide on a broadcast job.
#[derive(Debug, Clone, Copy)]
pub struct NodeLoad<'a> {
    pub queue: &'a LocalQueue,
    pub registry: &'a Registry,
    pub max_builds: usize,
}

impl NodeLoad<'_> {
    fn at_capacity(&self) -> bool {
        self.registry.len() >= self.max_builds
    }

    fn holds(&self, job_id: &str) -> bool {
        self.queue.contains(job_id) || self.registry.contains(job_id)
    }
}

/// Decides which broadcast jobs this node competes for and turns controller
/// approvals into queue entries.
///
/// Never touches run records: admission only ever produces queue entries.
#[derive(Debug)]
pub struct ClaimEngine {
    node_id: String,
    native_arch: String,
    cross_arches: Vec<String>,
    /// Jobs a claim request was sent for
    requested: HashMap<String, PendingClaim>,
    /// After this long without an answer a claim no longer blocks a new one
    claim_timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
struct PendingClaim {
    builder_id: i64,
    sent_at: Instant,
}

impl ClaimEngine {
    pub fn new(node_id: impl Into<String>, config: &NodeConfig) -> Self {
        let cross_arches = if config.cross_build {
            config.cross_arches.clone()
        } else {
            Vec::new()
        };
        Self {
            node_id: node_id.into(),
            native_arch: config.arch.clone(),
            cross_arches,
            requested: HashMap::new(),
            claim_timeout: config.claim_timeout,
        }
    }

    fn supports_arch(&self, arch: &str) -> bool {
        arch == self.native_arch || self.cross_arches.iter().any(|a| a == arch)
    }

    pub fn on_message(&mut self, msg: &BuildChannelMessage, load: NodeLoad<'_>) -> Admission {
        if msg.sender == self.node_id {
            return Admission::Ignore("own message");
        }
        if !msg.is_addressed_to(&self.node_id) {
            return Admission::Ignore("addressed to another node");
        }

        match &msg.body {
            BuildMessage::Queue(QueueMessage::Add {
                job_id,
                builder_id,
                arch,
            }) => self.on_add(job_id, *builder_id, arch, load),
            BuildMessage::Queue(QueueMessage::Cancel { job_id }) => {
                self.forget(job_id);
                Admission::Cancel {
                    job_id: job_id.clone(),
                }
            }
            BuildMessage::Claim(ClaimMessage::ClaimResponse(resp)) => self.on_claim_response(resp),
            BuildMessage::Claim(ClaimMessage::Claim(_)) => Admission::Ignore("claim request echo"),
        }
    }

    fn on_add(&mut self, job_id: &str, builder_id: i64, arch: &str, load: NodeLoad<'_>) -> Admission {
        if !self.supports_arch(arch) {
            return Admission::Ignore("unsupported architecture");
        }
        if load.at_capacity() {
            return Admission::Ignore("at capacity");
        }
        if load.holds(job_id) {
            return Admission::Ignore("already claimed");
        }
        if let Some(pending) = self.requested.get(job_id) {
            if pending.sent_at.elapsed() < self.claim_timeout {
                return Admission::Ignore("already claimed");
            }
            debug!(job_id = %job_id, "Claim went unanswered, applying again");
        }

        self.requested.insert(
            job_id.to_string(),
            PendingClaim {
                builder_id,
                sent_at: Instant::now(),
            },
        );
        debug!(job_id = %job_id, builder_id, "Applying for job");
        Admission::Apply {
            job_id: job_id.to_string(),
            builder_id,
        }
    }

    /// Handle a controller answer, from the channel or inline in the apply
    /// reply. Only the first approval of a requested job enqueues it.
    pub fn on_claim_response(&mut self, resp: &ClaimResponse) -> Admission {
        if !self.requested.contains_key(&resp.job_id) {
            return Admission::Ignore("response for a job not requested");
        }
        match resp.result {
            ClaimResult::Denied => {
                self.requested.remove(&resp.job_id);
                Admission::Ignore("claim denied")
            }
            ClaimResult::Approved => {
                let builder_id = self
                    .requested
                    .remove(&resp.job_id)
                    .map_or(resp.builder_id, |pending| pending.builder_id);
                Admission::Enqueue {
                    job_id: resp.job_id.clone(),
                    builder_id,
                }
            }
        }
    }

    /// Drop an outstanding claim, e.g. after the request failed or the job
    /// was cancelled. A late approval is then treated as foreign.
    pub fn forget(&mut self, job_id: &str) -> bool {
        self.requested.remove(job_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::ContainerName;
    use crate::scheduler::job::QueueEntry;
    use crate::scheduler::registry::RegistryEntry;

    const NODE: &str = "node-1";

    fn engine() -> ClaimEngine {
        let config = NodeConfig::new("test", 2).with_cross_arch("s390x");
        ClaimEngine::new(NODE, &config)
    }

    fn add(job_id: &str, arch: &str) -> BuildChannelMessage {
        BuildChannelMessage {
            sender: "controller".to_string(),
            target: None,
            body: BuildMessage::Queue(QueueMessage::Add {
                job_id: job_id.to_string(),
                builder_id: 7,
                arch: arch.to_string(),
            }),
        }
    }

    fn response(job_id: &str, result: ClaimResult) -> BuildChannelMessage {
        BuildChannelMessage {
            sender: "controller".to_string(),
            target: Some(NODE.to_string()),
            body: BuildMessage::Claim(ClaimMessage::ClaimResponse(ClaimResponse {
                job_id: job_id.to_string(),
                builder_id: 7,
                result,
            })),
        }
    }

    fn native() -> &'static str {
        std::env::consts::ARCH
    }

    fn load<'a>(queue: &'a LocalQueue, registry: &'a Registry) -> NodeLoad<'a> {
        NodeLoad {
            queue,
            registry,
            max_builds: 2,
        }
    }

    #[test]
    fn applies_for_native_and_cross_arch() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut engine = engine();

        assert_eq!(
            engine.on_message(&add("a", native()), load(&queue, &registry)),
            Admission::Apply {
                job_id: "a".to_string(),
                builder_id: 7
            }
        );
        assert!(matches!(
            engine.on_message(&add("b", "s390x"), load(&queue, &registry)),
            Admission::Apply { .. }
        ));
        assert_eq!(
            engine.on_message(&add("c", "mips-unknown"), load(&queue, &registry)),
            Admission::Ignore("unsupported architecture")
        );
    }

    #[test]
    fn cross_arches_need_cross_build() {
        let mut config = NodeConfig::new("test", 2).with_cross_arch("s390x");
        config.cross_build = false;
        let mut engine = ClaimEngine::new(NODE, &config);
        let (queue, registry) = (LocalQueue::new(), Registry::new());

        assert!(matches!(
            engine.on_message(&add("a", "s390x"), load(&queue, &registry)),
            Admission::Ignore(_)
        ));
    }

    #[test]
    fn ignores_own_and_foreign_targets() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut engine = engine();

        let mut msg = add("a", native());
        msg.sender = NODE.to_string();
        assert_eq!(
            engine.on_message(&msg, load(&queue, &registry)),
            Admission::Ignore("own message")
        );

        let mut msg = add("a", native());
        msg.target = Some("node-2".to_string());
        assert!(matches!(
            engine.on_message(&msg, load(&queue, &registry)),
            Admission::Ignore(_)
        ));
        assert!(!engine.requested.contains_key("a"));
    }

    #[test]
    fn no_claim_at_capacity() {
        let queue = LocalQueue::new();
        let mut registry = Registry::new();
        for job in ["r1", "r2"] {
            registry.insert(RegistryEntry::new(&ContainerName::new(1, job, NODE).unwrap()));
        }
        let mut engine = engine();

        assert_eq!(
            engine.on_message(&add("a", native()), load(&queue, &registry)),
            Admission::Ignore("at capacity")
        );
    }

    #[test]
    fn no_second_claim_for_known_jobs() {
        let mut queue = LocalQueue::new();
        queue.push(QueueEntry::new("queued", 7));
        let registry = Registry::new();
        let mut engine = engine();

        assert!(matches!(
            engine.on_message(&add("a", native()), load(&queue, &registry)),
            Admission::Apply { .. }
        ));
        assert_eq!(
            engine.on_message(&add("a", native()), load(&queue, &registry)),
            Admission::Ignore("already claimed")
        );
        assert_eq!(
            engine.on_message(&add("queued", native()), load(&queue, &registry)),
            Admission::Ignore("already claimed")
        );
    }

    #[test]
    fn unanswered_claim_expires() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut config = NodeConfig::new("test", 2);
        config.claim_timeout = Duration::ZERO;
        let mut engine = ClaimEngine::new(NODE, &config);

        for _ in 0..2 {
            assert!(matches!(
                engine.on_message(&add("a", native()), load(&queue, &registry)),
                Admission::Apply { .. }
            ));
        }
        assert_eq!(
            engine.on_message(&response("a", ClaimResult::Approved), load(&queue, &registry)),
            Admission::Enqueue {
                job_id: "a".to_string(),
                builder_id: 7
            }
        );
    }

    #[test]
    fn approval_enqueues_once() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut engine = engine();
        engine.on_message(&add("a", native()), load(&queue, &registry));

        assert_eq!(
            engine.on_message(&response("a", ClaimResult::Approved), load(&queue, &registry)),
            Admission::Enqueue {
                job_id: "a".to_string(),
                builder_id: 7
            }
        );
        assert!(matches!(
            engine.on_message(&response("a", ClaimResult::Approved), load(&queue, &registry)),
            Admission::Ignore(_)
        ));
    }

    #[test]
    fn denied_and_foreign_responses_are_noops() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut engine = engine();
        engine.on_message(&add("a", native()), load(&queue, &registry));

        assert_eq!(
            engine.on_message(&response("a", ClaimResult::Denied), load(&queue, &registry)),
            Admission::Ignore("claim denied")
        );
        assert!(!engine.requested.contains_key("a"));
        assert!(matches!(
            engine.on_message(&response("zzz", ClaimResult::Approved), load(&queue, &registry)),
            Admission::Ignore(_)
        ));
    }

    #[test]
    fn cancel_forgets_outstanding_claim() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut engine = engine();
        engine.on_message(&add("a", native()), load(&queue, &registry));

        let cancel = BuildChannelMessage {
            sender: "controller".to_string(),
            target: None,
            body: BuildMessage::Queue(QueueMessage::Cancel {
                job_id: "a".to_string(),
            }),
        };
        assert_eq!(
            engine.on_message(&cancel, load(&queue, &registry)),
            Admission::Cancel {
                job_id: "a".to_string()
            }
        );
        assert!(matches!(
            engine.on_message(&response("a", ClaimResult::Approved), load(&queue, &registry)),
            Admission::Ignore(_)
        ));
    }

    #[test]
    fn claim_echo_is_ignored() {
        let (queue, registry) = (LocalQueue::new(), Registry::new());
        let mut engine = engine();
        let msg = BuildChannelMessage {
            sender: "node-2".to_string(),
            target: None,
            body: BuildMessage::Claim(ClaimMessage::Claim(crate::protocol::ClaimRequest {
                builder_id: 1,
                job_id: "a".to_string(),
            })),
        };
        assert_eq!(
            engine.on_message(&msg, load(&queue, &registry)),
            Admission::Ignore("claim request echo")
        );
    }
}
