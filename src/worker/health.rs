use std::time::Duration;

use tracing::debug;

use crate::config::HealthCheckConfig;
use crate::error::{Result, SchedulerError};

/// Upper bound on a single probe, independent of the delay between probes.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

pub fn probe_client() -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?)
}

/// Poll `url` until it answers 2xx, at most `config.attempts` times with
/// `config.delay` between attempts.
pub async fn wait_until_healthy(
    client: &reqwest::Client,
    url: &str,
    name: &str,
    config: &HealthCheckConfig,
) -> Result<()> {
    for attempt in 1..=config.attempts {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!(container = %name, attempt, "Builder healthy");
                return Ok(());
            }
            Ok(response) => {
                debug!(container = %name, attempt, status = %response.status(), "Builder not ready");
            }
            Err(e) => {
                debug!(container = %name, attempt, error = %e, "Builder not reachable");
            }
        }
        if attempt < config.attempts {
            tokio::time::sleep(config.delay).await;
        }
    }

    Err(SchedulerError::HealthCheckTimeout {
        name: name.to_string(),
        attempts: config.attempts,
    })
}
