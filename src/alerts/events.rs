// Secondary pager module
// Trigger and resolve calls against the events-API pager provider,
// deduplicated by the incident alias
//
// Numan Thabit 2025 Nov

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

const EVENTS_API_URL: &str = "https://events.pagerduty.com/v2/enqueue";

const ACTION_TRIGGER: &str = "trigger";
const ACTION_RESOLVE: &str = "resolve";

#[derive(Debug, Serialize)]
struct EventPayload {
    summary: String,
    source: String,
    severity: String,
    component: String,
}

#[derive(Debug, Serialize)]
struct Event {
    routing_key: String,
    dedup_key: String,
    event_action: String,
    payload: EventPayload,
}

#[derive(Debug, Deserialize)]
struct EventResponse {
    #[serde(default)]
    status: String,
    #[serde(default)]
    dedup_key: String,
}

/// Client for the secondary, events-API pager provider.
#[derive(Clone)]
pub struct EventsClient {
    routing_key: String,
    http: reqwest::Client,
}

impl EventsClient {
    pub fn new(routing_key: &str) -> Result<Self> {
        if routing_key.is_empty() {
            bail!("events provider routing key must not be empty");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("build HTTP client for events provider")?;
        Ok(Self {
            routing_key: routing_key.to_string(),
            http,
        })
    }

    /// Dispatches a trigger event keyed by the alias for dedup. Returns
    /// the provider's dedup key.
    pub async fn trigger(&self, component: &str, alias: &str, summary: &str) -> Result<String> {
        self.send_event(ACTION_TRIGGER, alias, component, &format!("{component}:{summary}"))
            .await
    }

    /// Dispatches a resolve event for a previously triggered alias.
    pub async fn resolve(&self, component: &str, alias: &str) -> Result<()> {
        self.send_event(
            ACTION_RESOLVE,
            alias,
            component,
            &format!("{component}: auto resolved"),
        )
        .await?;
        Ok(())
    }

    async fn send_event(
        &self,
        action: &str,
        dedup_key: &str,
        component: &str,
        summary: &str,
    ) -> Result<String> {
        let event = Event {
            routing_key: self.routing_key.clone(),
            dedup_key: dedup_key.to_string(),
            event_action: action.to_string(),
            payload: EventPayload {
                summary: summary.to_string(),
                source: "pulsar-sentinel".to_string(),
                severity: "critical".to_string(),
                component: component.to_string(),
            },
        };

        let response = self
            .http
            .post(EVENTS_API_URL)
            .json(&event)
            .send()
            .await
            .context("send pager event")?;
        if !response.status().is_success() {
            bail!(
                "events provider returns incorrect status code {}",
                response.status()
            );
        }

        let resp: EventResponse = response.json().await.context("decode pager event response")?;
        info!(status = %resp.status, dedup_key = %resp.dedup_key, action, "pager event sent");
        Ok(resp.dedup_key)
    }
}
