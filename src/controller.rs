//! Client for the controller's REST surface.
//!
//! - `POST /api/v1/node/register`: one-shot registration, returns the node id
//! - `POST /api/v1/node/job/apply`: claim request for a broadcast job
//! - `POST /api/v1/tasks/state/inform`: run state transition notification

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};
use crate::protocol::{ClaimMessage, ClaimRequest, ClaimResponse, StateNotification};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const NODE_ID_HEADER: &str = "X-Node-Id";
const NODE_PSK_HEADER: &str = "X-Node-Psk";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub node_name: String,
    pub node_psk: String,
    pub node_address: String,
    pub node_port: u16,
    pub node_version: String,
    pub node_arch: String,
    pub node_os: String,
    pub node_max_jobs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResponse {
    pub node_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ControllerClient: Send + Sync {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse>;

    /// Apply for a job. The authoritative answer arrives as a `claim_response`
    /// on the build channel; a controller may also answer inline, in which
    /// case the parsed response is returned.
    async fn apply(&self, request: &ClaimRequest) -> Result<Option<ClaimResponse>>;

    async fn inform(&self, notification: &StateNotification) -> Result<()>;
}

/// Node credentials attached to every post-registration request.
#[derive(Debug, Clone, Default)]
pub struct NodeCredentials {
    pub node_id: String,
    pub psk: String,
}

#[derive(Debug, Clone)]
pub struct HttpController {
    base_url: String,
    registration_key: String,
    credentials: NodeCredentials,
    http: reqwest::Client,
}

impl HttpController {
    pub fn new(base_url: impl Into<String>, registration_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            registration_key: registration_key.into(),
            credentials: NodeCredentials::default(),
            http,
        })
    }

    /// Attach the identity returned by registration.
    pub fn with_credentials(mut self, credentials: NodeCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(NODE_ID_HEADER, &self.credentials.node_id)
            .header(NODE_PSK_HEADER, &self.credentials.psk)
    }
}

fn check_status(response: &reqwest::Response, what: &str) -> Result<()> {
    let status = response.status();
    if !status.is_success() {
        return Err(SchedulerError::Controller(format!(
            "{what} returned {status}"
        )));
    }
    Ok(())
}

#[async_trait]
impl ControllerClient for HttpController {
    async fn register(&self, request: &RegistrationRequest) -> Result<RegistrationResponse> {
        let response = self
            .http
            .post(self.url("/api/v1/node/register"))
            .header(reqwest::header::AUTHORIZATION, &self.registration_key)
            .json(request)
            .send()
            .await?;
        check_status(&response, "registration")?;
        Ok(response.json().await?)
    }

    async fn apply(&self, request: &ClaimRequest) -> Result<Option<ClaimResponse>> {
        let response = self
            .authed(self.http.post(self.url("/api/v1/node/job/apply")))
            .json(&ClaimMessage::Claim(request.clone()))
            .send()
            .await?;
        check_status(&response, "claim request")?;

        let body = response.text().await?;
        match serde_json::from_str::<ClaimMessage>(&body) {
            Ok(ClaimMessage::ClaimResponse(resp)) => Ok(Some(resp)),
            _ => Ok(None),
        }
    }

    async fn inform(&self, notification: &StateNotification) -> Result<()> {
        let response = self
            .authed(self.http.post(self.url("/api/v1/tasks/state/inform")))
            .json(notification)
            .send()
            .await?;
        check_status(&response, "state notification")
    }
}
