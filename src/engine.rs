// Engine module
// The one value owning every shared registry: metrics, incidents,
// outlier buckets, messaging clients, and the admin HTTP client.
// Probe loops receive it by Arc instead of reaching for globals
//
// Numan Thabit 2025 Nov

use crate::alerts::{AnalyticsClient, ChatNotifier, EventsClient, PagerClient};
use crate::config::{Config, TokenSource};
use crate::incident::IncidentManager;
use crate::messaging::ClientCache;
use crate::metrics::Metrics;
use crate::probes::partition::PartitionTopic;
use crate::stats::OutlierBuckets;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::warn;

const PAGER_BASE_URL: &str = "https://api.opsgenie.com";

pub struct Engine {
    pub cfg: Config,
    pub token: TokenSource,
    pub metrics: Metrics,
    pub incidents: IncidentManager,
    pub outliers: OutlierBuckets,
    pub clients: ClientCache,
    /// partition probe objects cached per topic full name
    pub partitions: RwLock<HashMap<String, Arc<PartitionTopic>>>,
    http: reqwest::Client,
}

impl Engine {
    pub fn new(cfg: Config) -> Result<Arc<Self>> {
        let token = cfg.token_source();

        let mut http_builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .user_agent("pulsar-sentinel");
        if !cfg.trust_store.is_empty() {
            let pem = std::fs::read(&cfg.trust_store)
                .with_context(|| format!("error opening cert file {}", cfg.trust_store))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .with_context(|| format!("parse trust store certificate {}", cfg.trust_store))?;
            http_builder = http_builder.add_root_certificate(cert);
        }
        let http = http_builder.build().context("build admin HTTP client")?;

        let chat = ChatNotifier::new(&cfg.slack_config.alert_url, cfg.slack_config.verbose)?;

        let pager = if cfg.ops_genie_config.alert_key.is_empty() {
            None
        } else {
            Some(PagerClient::new(
                PAGER_BASE_URL,
                &cfg.ops_genie_config.alert_key,
            )?)
        };

        let events = if cfg.pager_duty_config.integration_key.is_empty() {
            None
        } else {
            Some(EventsClient::new(&cfg.pager_duty_config.integration_key)?)
        };

        let analytics = if cfg.analytics_config.api_key.is_empty() {
            None
        } else {
            match AnalyticsClient::new(
                &cfg.analytics_config.api_key,
                &cfg.analytics_config.ingestion_url,
                &cfg.name,
            ) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(error = %err, "analytics sink disabled");
                    None
                }
            }
        };

        let incidents = IncidentManager::new(pager, events, chat, analytics, cfg.k8s_config.enabled);

        Ok(Arc::new(Self {
            clients: ClientCache::new(&cfg.trust_store),
            incidents,
            metrics: Metrics::new(),
            outliers: OutlierBuckets::new(),
            partitions: RwLock::new(HashMap::new()),
            token,
            http,
            cfg,
        }))
    }

    /// The Pulsar cluster name this monitor reports under.
    pub fn cluster_name(&self) -> &str {
        if self.cfg.cluster_name.is_empty() {
            &self.cfg.name
        } else {
            &self.cfg.cluster_name
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Admin REST GET with the bearer token evaluated for this call.
    pub async fn admin_get(&self, url: &str, token: &TokenSource) -> Result<reqwest::Response> {
        let mut request = self.http.get(url);
        if let Some(token) = token.token().await? {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .with_context(|| format!("admin GET {url}"))
    }

    /// Admin REST PUT with a plain-text body.
    pub async fn admin_put(
        &self,
        url: &str,
        token: &TokenSource,
        body: String,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(body);
        if let Some(token) = token.token().await? {
            request = request.bearer_auth(token);
        }
        request
            .send()
            .await
            .with_context(|| format!("admin PUT {url}"))
    }
}
