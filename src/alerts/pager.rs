// Pager provider module
// Alert create, identifier lookup, close, and heartbeat calls against
// the primary paging provider's v2 alerts API
//
// Numan Thabit 2025 Nov

use anyhow::{anyhow, bail, Context, Result};
use backoff::{future::retry, ExponentialBackoff};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::info;

const ALERT_API_PATH: &str = "/v2/alerts";

/// Incident payload for alert creation
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub message: String,
    pub description: String,
    pub priority: String,
    pub entity: String,
    pub alias: String,
    pub tags: Vec<String>,
    /// unix epoch seconds at creation
    pub timestamp: u64,
}

impl Incident {
    pub fn new(component: &str, alias: &str, msg: &str, desc: &str, priority: &str) -> Self {
        let priority = if super::ALLOWED_PRIORITIES.contains(&priority) {
            priority
        } else {
            super::DEFAULT_PRIORITY
        };
        Self {
            message: msg.to_string(),
            description: desc.to_string(),
            priority: priority.to_string(),
            entity: component.to_string(),
            alias: alias.to_string(),
            tags: vec!["ops-monitor".to_string(), component.to_string()],
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AlertCreateResponse {
    #[serde(default)]
    request_id: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct AlertGetData {
    #[serde(default)]
    alert_id: String,
}

#[derive(Debug, Deserialize)]
struct AlertGetResponse {
    #[serde(default)]
    data: AlertGetData,
}

#[derive(Debug, Serialize)]
struct AlertCloseRequest {
    user: String,
    source: String,
    note: String,
}

/// Client for the primary pager provider. All calls retry twice with
/// exponential waits bounded between 4s and 64s over a 5s per-request
/// timeout.
#[derive(Clone)]
pub struct PagerClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl PagerClient {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self> {
        if api_key.is_empty() {
            bail!("pager provider api key must not be empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build HTTP client for pager provider")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            http,
        })
    }

    fn retry_policy() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(4),
            max_interval: Duration::from_secs(64),
            // two retries at most before the elapsed cap cuts the loop
            max_elapsed_time: Some(Duration::from_secs(13)),
            multiplier: 2.0,
            // no jitter, the waits stay at exactly 4s then 8s
            randomization_factor: 0.0,
            ..ExponentialBackoff::default()
        }
    }

    async fn retry_request<T, F, Fut>(&self, label: &'static str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry(Self::retry_policy(), || {
            let fut = operation();
            async move { fut.await.map_err(backoff::Error::transient) }
        })
        .await
        .map_err(|err| anyhow!("{label} failed after retries: {err}"))
    }

    /// Creates an alert and returns the provider's request id. The stable
    /// alert id is only available later through [`PagerClient::alert_id`].
    pub async fn create_alert(&self, incident: &Incident) -> Result<String> {
        let url = format!("{}{ALERT_API_PATH}", self.base_url);
        info!(entity = %incident.entity, alias = %incident.alias, "create pager alert");

        let resp: AlertCreateResponse = self
            .retry_request("pager_create_alert", || async {
                let response = self
                    .http
                    .post(&url)
                    .header(reqwest::header::AUTHORIZATION, &self.api_key)
                    .json(incident)
                    .send()
                    .await
                    .context("send alert create request")?;
                if response.status().as_u16() > 300 {
                    bail!(
                        "create pager alert returns incorrect status code {}",
                        response.status()
                    );
                }
                response
                    .json::<AlertCreateResponse>()
                    .await
                    .context("decode alert create response")
            })
            .await?;

        Ok(resp.request_id)
    }

    /// Resolves the stable alert id for a previously acknowledged request.
    pub async fn alert_id(&self, request_id: &str) -> Result<String> {
        let url = format!("{}{ALERT_API_PATH}/requests/{request_id}", self.base_url);

        let response = self
            .http
            .get(&url)
            .header(reqwest::header::AUTHORIZATION, &self.api_key)
            .send()
            .await
            .context("send alert id lookup request")?;
        if response.status().as_u16() > 300 {
            bail!(
                "get pager alert returns incorrect status code {}",
                response.status()
            );
        }
        let resp: AlertGetResponse = response
            .json()
            .await
            .context("decode alert id lookup response")?;
        if resp.data.alert_id.is_empty() {
            bail!("pager alert id not yet available for request {request_id}");
        }
        Ok(resp.data.alert_id)
    }

    /// Closes an alert by its stable id.
    pub async fn close_alert(&self, component: &str, alert_id: &str) -> Result<()> {
        let url = format!(
            "{}{ALERT_API_PATH}/{alert_id}/close?identifierType=id",
            self.base_url
        );
        let body = AlertCloseRequest {
            user: "pulsar sentinel".to_string(),
            source: component.to_string(),
            note: format!("*automatically resolved the alert* (alertId) {alert_id}"),
        };

        self.retry_request("pager_close_alert", || async {
            let response = self
                .http
                .post(&url)
                .header(reqwest::header::AUTHORIZATION, &self.api_key)
                .json(&body)
                .send()
                .await
                .context("send alert close request")?;
            if response.status().as_u16() > 300 {
                bail!(
                    "close pager alert returns incorrect status code {}",
                    response.status()
                );
            }
            Ok(())
        })
        .await
    }
}

/// Sends a heartbeat ping to the provider-supplied URL. Any status above
/// 300 is a failure.
pub async fn heartbeat(url: &str, api_key: &str) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .context("build HTTP client for heartbeat")?;

    let mut request = http.get(url);
    if !api_key.is_empty() {
        request = request.header(reqwest::header::AUTHORIZATION, api_key);
    }
    let response = request.send().await.context("send heartbeat request")?;
    info!(status = %response.status(), "heartbeat provider status");
    if response.status().as_u16() > 300 {
        bail!(
            "heartbeat provider returns incorrect status code {}",
            response.status()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_priority_falls_back_to_default() {
        let incident = Incident::new("comp", "alias", "msg", "desc", "P9");
        assert_eq!(incident.priority, "P2");
        let incident = Incident::new("comp", "alias", "msg", "desc", "P1");
        assert_eq!(incident.priority, "P1");
    }

    #[test]
    fn incident_tags_carry_component() {
        let incident = Incident::new("cluster-a", "cluster-a", "msg", "desc", "P2");
        assert_eq!(incident.tags, vec!["ops-monitor", "cluster-a"]);
        assert_eq!(incident.entity, "cluster-a");
    }

    #[test]
    fn empty_api_key_rejected() {
        assert!(PagerClient::new("https://pager.example.com", "").is_err());
    }
}
