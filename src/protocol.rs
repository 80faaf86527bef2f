//! Typed messages exchanged over the coordination store's pub/sub channels.
//!
//! Every channel carries the same JSON envelope:
//!
//! ```json
//! {"type": "...", "sender": "...", "target": null, "data": {...}}
//! ```
//!
//! Payloads are validated once, here, into tagged unions. The rest of the
//! crate only ever matches on the typed form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::{RunRecord, RunStatus};

/// Job broadcast and claim protocol
pub const BUILD_CHANNEL: &str = "build";
/// Targeted node control (health checks, deregistration)
pub const NODE_CHANNEL: &str = "node";
/// Fan-out of run record changes
pub const BUILD_UPDATES_CHANNEL: &str = "build_updates";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    sender: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    fn parse(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| SchedulerError::InvalidMessage(format!("malformed envelope: {e}")))
    }

    fn data<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            SchedulerError::InvalidMessage(format!("malformed {} payload: {e}", self.kind))
        })
    }
}

/// Payload of `type: queue` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueMessage {
    Add {
        job_id: String,
        builder_id: i64,
        arch: String,
    },
    Cancel {
        job_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimResult {
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub builder_id: i64,
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub job_id: String,
    pub builder_id: i64,
    pub result: ClaimResult,
}

/// Payload of `type: claim` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaimMessage {
    /// Node → controller request, echoed on the channel; not node-relevant
    Claim(ClaimRequest),
    ClaimResponse(ClaimResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildMessage {
    Queue(QueueMessage),
    Claim(ClaimMessage),
}

/// A validated message from the `build` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildChannelMessage {
    pub sender: String,
    /// `None` addresses every node
    pub target: Option<String>,
    pub body: BuildMessage,
}

impl BuildChannelMessage {
    pub fn parse(payload: &str) -> Result<Self> {
        let envelope = Envelope::parse(payload)?;
        let body = match envelope.kind.as_str() {
            "queue" => BuildMessage::Queue(envelope.data()?),
            "claim" => BuildMessage::Claim(envelope.data()?),
            other => {
                return Err(SchedulerError::InvalidMessage(format!(
                    "unknown build message type {other}"
                )))
            }
        };
        Ok(Self {
            sender: envelope.sender,
            target: envelope.target,
            body,
        })
    }

    pub fn to_payload(&self) -> Result<String> {
        let (kind, data) = match &self.body {
            BuildMessage::Queue(q) => ("queue", serde_json::to_value(q)?),
            BuildMessage::Claim(c) => ("claim", serde_json::to_value(c)?),
        };
        Ok(serde_json::to_string(&Envelope {
            kind: kind.to_string(),
            sender: self.sender.clone(),
            target: self.target.clone(),
            data,
        })?)
    }

    /// Whether this node should look at the message at all.
    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.sender != node_id && self.target.as_deref().map_or(true, |t| t == node_id)
    }
}

/// Health summary returned on the control channel and the HTTP surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub uptime: u64,
    pub version: String,
    pub arch: String,
    pub os: String,
    pub node_id: String,
    pub running: usize,
    pub queued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    HealthCheck,
    Deregister,
    HealthResponse(HealthReport),
}

/// A validated message from the `node` control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChannelMessage {
    pub sender: String,
    pub target: Option<String>,
    pub command: NodeCommand,
}

impl NodeChannelMessage {
    pub fn parse(payload: &str) -> Result<Self> {
        let envelope = Envelope::parse(payload)?;
        let command = match envelope.kind.as_str() {
            "health_check" => NodeCommand::HealthCheck,
            "deregister" => NodeCommand::Deregister,
            "health_response" => NodeCommand::HealthResponse(envelope.data()?),
            other => {
                return Err(SchedulerError::InvalidMessage(format!(
                    "unknown node message type {other}"
                )))
            }
        };
        Ok(Self {
            sender: envelope.sender,
            target: envelope.target,
            command,
        })
    }

    pub fn to_payload(&self) -> Result<String> {
        let (kind, data) = match &self.command {
            NodeCommand::HealthCheck => ("health_check", Value::Null),
            NodeCommand::Deregister => ("deregister", Value::Null),
            NodeCommand::HealthResponse(report) => {
                ("health_response", serde_json::to_value(report)?)
            }
        };
        Ok(serde_json::to_string(&Envelope {
            kind: kind.to_string(),
            sender: self.sender.clone(),
            target: self.target.clone(),
            data,
        })?)
    }

    /// Control messages must be explicitly targeted at this node.
    pub fn is_addressed_to(&self, node_id: &str) -> bool {
        self.sender != node_id && self.target.as_deref() == Some(node_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateKind {
    Log,
    Status,
}

/// Message published on `build_updates` after every run record change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildUpdateMessage {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    pub build_id: String,
    pub data: RunRecord,
}

/// State-transition notification sent to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateNotification {
    pub job_id: String,
    pub old_state: RunStatus,
    pub new_state: RunStatus,
    pub timestamp: DateTime<Utc>,
}
