use std::collections::HashMap;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Result, SchedulerError};
use crate::runtime::{
    ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary, RuntimeEvent,
    StartedContainer,
};

const EVENT_BUFFER: usize = 256;

/// Drives the local container runtime through the `docker` CLI.
///
/// Builders run detached with `--rm`, so a container disappears as soon as it
/// exits and a stopped job never leaves a stale name behind.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
    name_prefix: String,
}

impl DockerCli {
    pub fn new(name_prefix: impl Into<String>) -> Self {
        Self {
            binary: "docker".to_string(),
            name_prefix: name_prefix.into(),
        }
    }

    async fn docker(&self, args: &[String]) -> Result<Output> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let output = self
            .docker(&[
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                name.to_string(),
            ])
            .await?;
        Ok(output.status.success())
    }

    /// Arguments for `docker run`, given an already allocated host port.
    pub fn run_args(spec: &ContainerSpec, host_port: Option<u16>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--rm".to_string(),
            format!("--name={}", spec.name),
            format!("--network={}", spec.network_mode),
        ];

        if spec.privileged {
            args.push("--privileged".to_string());
        }

        if let (Some(container_port), Some(host_port)) = (spec.publish_port, host_port) {
            args.push(format!("--publish=127.0.0.1:{host_port}:{container_port}"));
        }

        for (key, value) in &spec.env {
            args.push(format!("--env={key}={value}"));
        }

        args.push(spec.image.clone());
        args
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// Reserve a free ephemeral port on the loopback interface.
fn free_local_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[derive(Debug, Deserialize)]
struct InspectState {
    #[serde(rename = "Running", default)]
    running: bool,
}

#[derive(Debug, Deserialize)]
struct InspectNetwork {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
}

#[derive(Debug, Deserialize)]
struct InspectPortBinding {
    #[serde(rename = "HostPort", default)]
    host_port: String,
}

#[derive(Debug, Deserialize)]
struct InspectNetworkSettings {
    #[serde(rename = "Networks", default)]
    networks: HashMap<String, InspectNetwork>,
    #[serde(rename = "Ports", default)]
    ports: Option<HashMap<String, Option<Vec<InspectPortBinding>>>>,
}

#[derive(Debug, Deserialize)]
struct InspectOutput {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "State")]
    state: InspectState,
    #[serde(rename = "NetworkSettings")]
    network_settings: InspectNetworkSettings,
}

impl From<InspectOutput> for ContainerInfo {
    fn from(raw: InspectOutput) -> Self {
        let networks = raw
            .network_settings
            .networks
            .into_iter()
            .map(|(name, net)| (name, net.ip_address))
            .collect();

        // "3000/tcp" -> [{"HostIp": "127.0.0.1", "HostPort": "49153"}]
        let published_ports = raw
            .network_settings
            .ports
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let container_port = key.split('/').next()?.parse::<u16>().ok()?;
                let host_port = bindings?
                    .iter()
                    .find_map(|b| b.host_port.parse::<u16>().ok())?;
                Some((container_port, host_port))
            })
            .collect();

        Self {
            id: raw.id,
            name: raw.name.trim_start_matches('/').to_string(),
            running: raw.state.running,
            networks,
            published_ports,
        }
    }
}

/// Parse the output of `docker inspect --format '{{json .}}'`.
pub fn parse_inspect(raw: &str) -> Result<ContainerInfo> {
    let parsed: InspectOutput = serde_json::from_str(raw.trim())?;
    Ok(parsed.into())
}

#[derive(Debug, Deserialize)]
struct PsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "State", default)]
    state: String,
}

/// Parse the line-per-container output of `docker ps --format '{{json .}}'`.
pub fn parse_ps(raw: &str) -> Vec<ContainerSummary> {
    raw.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<PsLine>(line) {
            Ok(ps) => Some(ContainerSummary {
                id: ps.id,
                name: ps.names,
                state: ps.state,
            }),
            Err(e) => {
                tracing::warn!(line, error = %e, "Unparseable container list line");
                None
            }
        })
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn start(&self, spec: &ContainerSpec) -> Result<StartedContainer> {
        if self.exists(&spec.name).await? {
            return Err(SchedulerError::NameConflict(spec.name.clone()));
        }

        let host_port = match spec.publish_port {
            Some(_) => Some(free_local_port()?),
            None => None,
        };

        let args = Self::run_args(spec, host_port);
        tracing::info!(name = %spec.name, image = %spec.image, network = %spec.network_mode, "Starting container");

        let output = self.docker(&args).await?;
        if !output.status.success() {
            let stderr = stderr_of(&output);
            if stderr.contains("Conflict") || stderr.contains("already in use") {
                return Err(SchedulerError::NameConflict(spec.name.clone()));
            }
            return Err(SchedulerError::Runtime(format!(
                "docker run {} failed: {}",
                spec.name, stderr
            )));
        }

        let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        tracing::debug!(name = %spec.name, container_id = %id, host_port = ?host_port, "Container started");
        Ok(StartedContainer { id, host_port })
    }

    async fn stop(&self, name: &str) -> Result<()> {
        let output = self
            .docker(&["stop".to_string(), name.to_string()])
            .await?;
        if output.status.success() {
            tracing::info!(name, "Container stopped");
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if stderr.contains("No such container") || stderr.contains("is not running") {
            tracing::debug!(name, "Container already gone, nothing to stop");
            return Ok(());
        }
        Err(SchedulerError::Runtime(format!(
            "docker stop {name} failed: {stderr}"
        )))
    }

    async fn inspect(&self, name: &str) -> Result<ContainerInfo> {
        let output = self
            .docker(&[
                "inspect".to_string(),
                "--type".to_string(),
                "container".to_string(),
                "--format".to_string(),
                "{{json .}}".to_string(),
                name.to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Err(SchedulerError::Runtime(format!(
                "docker inspect {name} failed: {}",
                stderr_of(&output)
            )));
        }
        parse_inspect(&String::from_utf8_lossy(&output.stdout))
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let output = self
            .docker(&[
                "ps".to_string(),
                "--all".to_string(),
                "--no-trunc".to_string(),
                format!("--filter=name={}", self.name_prefix),
                "--format".to_string(),
                "{{json .}}".to_string(),
            ])
            .await?;
        if !output.status.success() {
            return Err(SchedulerError::Runtime(format!(
                "docker ps failed: {}",
                stderr_of(&output)
            )));
        }
        Ok(parse_ps(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn events(&self) -> Result<mpsc::Receiver<RuntimeEvent>> {
        let mut child = Command::new(&self.binary)
            .args(["events", "--filter", "type=container", "--format", "{{json .}}"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            SchedulerError::Runtime("docker events produced no stdout".to_string())
        })?;

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            // Owning the child here ties its lifetime to the stream
            let _child = child;
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match RuntimeEvent::parse(&line) {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => tracing::debug!(line, "Ignoring unparseable runtime event"),
                    },
                    Ok(None) => {
                        tracing::error!("Runtime event stream closed");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Runtime event stream failed");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            name: "iglu-builder_1_j_n".to_string(),
            image: "ghcr.io/iglu-sh/iglu-builder:latest".to_string(),
            env: vec![("LOG_LEVEL".to_string(), "DEBUG".to_string())],
            network_mode: "iglu-nw".to_string(),
            privileged: false,
            publish_port: None,
        }
    }

    #[test]
    fn run_args_basic() {
        let args = DockerCli::run_args(&spec(), None);
        assert_eq!(
            args,
            vec![
                "run",
                "-d",
                "--rm",
                "--name=iglu-builder_1_j_n",
                "--network=iglu-nw",
                "--env=LOG_LEVEL=DEBUG",
                "ghcr.io/iglu-sh/iglu-builder:latest",
            ]
        );
    }

    #[test]
    fn run_args_privileged_with_published_port() {
        let mut spec = spec();
        spec.privileged = true;
        spec.publish_port = Some(3000);
        let args = DockerCli::run_args(&spec, Some(49200));
        assert!(args.contains(&"--privileged".to_string()));
        assert!(args.contains(&"--publish=127.0.0.1:49200:3000".to_string()));
        assert_eq!(args.last().unwrap(), "ghcr.io/iglu-sh/iglu-builder:latest");
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_local_port().unwrap(), 0);
    }

    #[test]
    fn parse_inspect_extracts_network_and_ports() {
        let raw = r#"{
            "Id": "4f2c",
            "Name": "/iglu-builder_1_j_n",
            "State": {"Status": "running", "Running": true},
            "NetworkSettings": {
                "Networks": {"iglu-nw": {"IPAddress": "172.18.0.3"}},
                "Ports": {"3000/tcp": [{"HostIp": "127.0.0.1", "HostPort": "49153"}], "22/tcp": null}
            }
        }"#;
        let info = parse_inspect(raw).unwrap();
        assert_eq!(info.id, "4f2c");
        assert_eq!(info.name, "iglu-builder_1_j_n");
        assert!(info.running);
        assert_eq!(info.networks.get("iglu-nw").map(String::as_str), Some("172.18.0.3"));
        assert_eq!(info.published_ports.get(&3000), Some(&49153));
        assert!(!info.published_ports.contains_key(&22));
    }

    #[test]
    fn parse_inspect_tolerates_null_ports() {
        let raw = r#"{"Id":"x","Name":"/n","State":{"Running":false},
            "NetworkSettings":{"Networks":{},"Ports":null}}"#;
        let info = parse_inspect(raw).unwrap();
        assert!(!info.running);
        assert!(info.published_ports.is_empty());
    }

    #[test]
    fn parse_ps_skips_bad_lines() {
        let raw = "{\"ID\":\"a1\",\"Names\":\"iglu-builder_1_j_n\",\"State\":\"running\"}\n\nnot json\n";
        let list = parse_ps(raw);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].name, "iglu-builder_1_j_n");
        assert_eq!(list[0].state, "running");
    }
}
