//! Container identity.
//!
//! The container name is the only key correlating runtime events with a job:
//!
//! ```text
//! <prefix>_<builder_config_id>_<job_id>_<node_id>
//! ```
//!
//! Every consumer parses names through [`ContainerName::parse`] so the field
//! order is defined in exactly one place.

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SchedulerError};

pub const CONTAINER_PREFIX: &str = "iglu-builder";

const SEPARATOR: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerName {
    builder_id: i64,
    job_id: String,
    node_id: String,
}

impl ContainerName {
    pub fn new(builder_id: i64, job_id: &str, node_id: &str) -> Result<Self> {
        if builder_id < 0 {
            return Err(SchedulerError::InvalidContainerName(format!(
                "negative builder id {builder_id}"
            )));
        }
        validate_field("job_id", job_id)?;
        validate_field("node_id", node_id)?;
        Ok(Self {
            builder_id,
            job_id: job_id.to_string(),
            node_id: node_id.to_string(),
        })
    }

    /// Parse a runtime-reported name. A leading `/` (as docker reports it in
    /// `inspect`) is accepted.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.strip_prefix('/').unwrap_or(raw);
        let invalid = || SchedulerError::InvalidContainerName(raw.to_string());

        let mut parts = raw.split(SEPARATOR);
        let (Some(prefix), Some(builder), Some(job), Some(node), None) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(invalid());
        };

        if prefix != CONTAINER_PREFIX {
            return Err(invalid());
        }
        let builder_id = builder.parse::<i64>().map_err(|_| invalid())?;
        Self::new(builder_id, job, node).map_err(|_| invalid())
    }

    pub fn builder_id(&self) -> i64 {
        self.builder_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.node_id() == node_id
    }
}

fn validate_field(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(SchedulerError::InvalidContainerName(format!(
            "{field} is empty"
        )));
    }
    if value.contains(SEPARATOR) || value.contains('/') {
        return Err(SchedulerError::InvalidContainerName(format!(
            "{field} contains a reserved character: {value}"
        )));
    }
    Ok(())
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{CONTAINER_PREFIX}{SEPARATOR}{}{SEPARATOR}{}{SEPARATOR}{}",
            self.builder_id, self.job_id, self.node_id
        )
    }
}

impl FromStr for ContainerName {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
