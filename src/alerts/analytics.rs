// Usage analytics module
// Fire-and-forget event reporting to the analytics ingestion endpoint
//
// Numan Thabit 2025 Nov

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub enum EventKind {
    AppStart,
    Heartbeat,
    IncidentCreated,
    IncidentCleared,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::AppStart => "app-start",
            EventKind::Heartbeat => "heartbeat",
            EventKind::IncidentCreated => "incident-created",
            EventKind::IncidentCleared => "incident-cleared",
        }
    }
}

#[derive(Debug, Serialize)]
struct AnalyticsEvent {
    event_type: String,
    cluster: String,
    name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    component: String,
    time: u64,
}

/// Optional analytics sink. Event delivery is best effort on a detached
/// task, a failed delivery never surfaces beyond a debug line.
#[derive(Clone)]
pub struct AnalyticsClient {
    api_key: String,
    ingestion_url: String,
    cluster: String,
    http: reqwest::Client,
}

impl AnalyticsClient {
    pub fn new(api_key: &str, ingestion_url: &str, cluster: &str) -> Result<Self> {
        if api_key.is_empty() || ingestion_url.is_empty() {
            bail!("analytics sink requires an api key and an ingestion url");
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build HTTP client for analytics sink")?;
        Ok(Self {
            api_key: api_key.to_string(),
            ingestion_url: ingestion_url.to_string(),
            cluster: cluster.to_string(),
            http,
        })
    }

    /// Queues one event for delivery without blocking the caller.
    pub fn event(&self, kind: EventKind, component: &str) {
        let event = AnalyticsEvent {
            event_type: kind.as_str().to_string(),
            cluster: self.cluster.clone(),
            name: self.cluster.clone(),
            component: component.to_string(),
            time: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        };
        let http = self.http.clone();
        let url = self.ingestion_url.clone();
        let api_key = self.api_key.clone();
        tokio::spawn(async move {
            let result = http
                .post(&url)
                .header("x-insert-key", api_key)
                .json(&event)
                .send()
                .await;
            if let Err(err) = result {
                debug!(error = %err, "analytics event delivery failed");
            }
        });
    }
}
