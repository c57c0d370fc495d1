// Configuration management module
// This file handles loading and parsing of configuration settings
// from a JSON or YAML runtime file and the process environment
//
// Numan Thabit 2025 Nov

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

static OAUTH_HTTP: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

/// Prometheus exposition and push-proxy set up
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PrometheusConfig {
    /// listen address for the /metrics endpoint, e.g. ":8089"
    pub port: String,
    pub expose_metrics: bool,
    #[serde(rename = "prometheusProxyURL", alias = "prometheusProxyUrl")]
    pub prometheus_proxy_url: String,
    #[serde(rename = "prometheusProxyAPIKey", alias = "prometheusProxyApiKey")]
    pub prometheus_proxy_api_key: String,
}

/// Chat webhook configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SlackConfig {
    pub alert_url: String,
    /// when set, every verbose alert is forwarded to the webhook unconditionally
    pub verbose: bool,
}

/// Primary pager provider configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OpsGenieConfig {
    pub heartbeat_url: String,
    pub heartbeat_key: String,
    pub alert_key: String,
    pub interval_seconds: u64,
}

/// Secondary pager provider, events API flavor
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PagerDutyConfig {
    pub integration_key: String,
}

/// Usage analytics sink, fire and forget
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AnalyticsConfig {
    pub api_key: String,
    pub ingestion_url: String,
}

/// Alert escalation thresholds. Either threshold can be disabled with 0.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertPolicy {
    /// first evaluation to count continuous failures
    pub ceiling: u32,
    /// second evaluation for the moving window
    pub moving_window_seconds: u64,
    pub ceiling_in_moving_window: u32,
}

/// General website endpoint monitor
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteConfig {
    pub headers: std::collections::HashMap<String, String>,
    pub url: String,
    pub name: String,
    pub interval_seconds: u64,
    pub response_seconds: u64,
    pub status_code: u16,
    pub retries: u32,
    #[serde(alias = "AlertPolicy")]
    pub alert_policy: AlertPolicy,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct SitesConfig {
    pub sites: Vec<SiteConfig>,
}

/// One cluster under the admin REST monitor
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct OpsClusterConfig {
    pub name: String,
    pub url: String,
    #[serde(alias = "AlertPolicy")]
    pub alert_policy: AlertPolicy,
}

/// Admin REST monitor over a list of clusters
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct PulsarAdminConfig {
    #[serde(alias = "Token")]
    pub token: String,
    pub clusters: Vec<OpsClusterConfig>,
    pub interval_seconds: u64,
}

/// Topic pub/sub latency probe target
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TopicConfig {
    pub name: String,
    /// used for broker monitoring if specified
    pub cluster_name: String,
    pub token: String,
    pub trust_store: String,
    pub number_of_partitions: usize,
    pub latency_budget_ms: u64,
    pub pulsar_url: String,
    pub admin_url: String,
    pub topic_name: String,
    pub output_topic: String,
    pub interval_seconds: u64,
    pub expected_msg: String,
    pub payload_sizes: Vec<String>,
    #[serde(rename = "numberOfMessages")]
    pub num_of_messages: usize,
    #[serde(alias = "AlertPolicy")]
    pub alert_policy: AlertPolicy,
    pub downtime_tracker_disabled: bool,
}

/// WebSocket pub/sub latency probe target
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketConfig {
    pub name: String,
    pub token: String,
    /// can be used for alert de-dupe
    pub cluster: String,
    pub latency_budget_ms: u64,
    pub producer_url: String,
    pub consumer_url: String,
    pub topic_name: String,
    pub interval_seconds: u64,
    pub scheme: String,
    pub port: String,
    pub subscription: String,
    pub url_query_params: String,
    #[serde(alias = "AlertPolicy")]
    pub alert_policy: AlertPolicy,
}

/// Orchestrator namespace monitor, in-cluster deployments only
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sClusterConfig {
    pub enabled: bool,
    pub pulsar_namespace: String,
    #[serde(alias = "AlertPolicy")]
    pub alert_policy: AlertPolicy,
}

/// In-cluster broker sweep configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokersConfig {
    pub broker_test_required: bool,
    #[serde(rename = "inclusterRestURL", alias = "inclusterRestUrl")]
    pub incluster_rest_url: String,
    pub interval_seconds: u64,
    #[serde(alias = "AlertPolicy")]
    pub alert_policy: AlertPolicy,
}

/// OAuth2 client-credentials token provider
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenOAuthConfig {
    #[serde(rename = "tokenURL", alias = "tokenUrl")]
    pub token_url: String,
    #[serde(rename = "clientID", alias = "clientId")]
    pub client_id: String,
    pub client_secret: String,
    pub audience: String,
}

/// Top-level runtime configuration
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// monitor instance name, mandatory
    pub name: String,
    /// Pulsar cluster name when `name` cannot double as the cluster name
    pub cluster_name: String,
    #[serde(rename = "tokenOAuthConfig")]
    pub token_oauth_config: Option<TokenOAuthConfig>,
    /// file path to a Pulsar JWT, takes precedence over `token` and is
    /// re-read on every use so on-disk rotation is honored
    pub token_file_path: String,
    pub token: String,
    pub trust_store: String,
    pub brokers_config: BrokersConfig,
    pub k8s_config: K8sClusterConfig,
    pub analytics_config: AnalyticsConfig,
    pub prometheus_config: PrometheusConfig,
    pub slack_config: SlackConfig,
    pub ops_genie_config: OpsGenieConfig,
    pub pager_duty_config: PagerDutyConfig,
    #[serde(rename = "pulsarAdminRestConfig")]
    pub pulsar_admin_config: PulsarAdminConfig,
    pub pulsar_topic_config: Vec<TopicConfig>,
    pub sites_config: SitesConfig,
    pub web_socket_config: Vec<WebSocketConfig>,
}

impl Config {
    /// Load the runtime configuration from a file. The format is
    /// autodetected: JSON when the first non-whitespace byte is `{`,
    /// YAML otherwise.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to load configuration file {}", path.display()))?;
        Self::parse(&bytes)
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let cfg: Config = if has_json_prefix(bytes) {
            serde_json::from_slice(bytes).context("parse JSON configuration")?
        } else {
            serde_yaml::from_slice(bytes).context("parse YAML configuration")?
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            bail!("a valid `name` in the configuration must be specified");
        }
        for topic in &self.pulsar_topic_config {
            url::Url::parse(&topic.pulsar_url)
                .with_context(|| format!("invalid pulsarUrl {}", topic.pulsar_url))?;
        }
        for cluster in &self.pulsar_admin_config.clusters {
            url::Url::parse(&cluster.url)
                .with_context(|| format!("invalid admin cluster url {}", cluster.url))?;
        }
        Ok(())
    }

    /// The process-wide token source built from the configured provider.
    pub fn token_source(&self) -> TokenSource {
        if let Some(oauth) = &self.token_oauth_config {
            return TokenSource::OAuth {
                cfg: oauth.clone(),
                cached: Arc::new(Mutex::new(None)),
            };
        }
        if !self.token_file_path.is_empty() {
            return TokenSource::File(PathBuf::from(&self.token_file_path));
        }
        if !self.token.is_empty() {
            let token = std::env::var("PulsarToken")
                .ok()
                .filter(|t| !t.trim().is_empty())
                .map(|t| t.trim_end_matches('\n').to_string())
                .unwrap_or_else(|| self.token.clone());
            return TokenSource::Fixed(token);
        }
        TokenSource::Disabled
    }
}

/// Supplier of the Pulsar JWT, evaluated at every use
#[derive(Clone)]
pub enum TokenSource {
    /// token fetched from an OAuth2 client-credentials endpoint,
    /// cached until shortly before expiry
    OAuth {
        cfg: TokenOAuthConfig,
        cached: Arc<Mutex<Option<(String, Instant)>>>,
    },
    /// token re-read from disk on every call
    File(PathBuf),
    Fixed(String),
    Disabled,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

impl TokenSource {
    /// Produce the current token, or None when authentication is disabled.
    pub async fn token(&self) -> Result<Option<String>> {
        match self {
            TokenSource::Disabled => Ok(None),
            TokenSource::Fixed(token) => Ok(Some(token.clone())),
            TokenSource::File(path) => {
                let token = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("read token file {}", path.display()))?;
                Ok(Some(token.trim().to_string()))
            }
            TokenSource::OAuth { cfg, cached } => {
                let mut guard = cached.lock().await;
                if let Some((token, expires_at)) = guard.as_ref() {
                    if *expires_at > Instant::now() {
                        return Ok(Some(token.clone()));
                    }
                }
                let resp: OAuthTokenResponse = OAUTH_HTTP
                    .post(&cfg.token_url)
                    .form(&[
                        ("grant_type", "client_credentials"),
                        ("client_id", cfg.client_id.as_str()),
                        ("client_secret", cfg.client_secret.as_str()),
                        ("audience", cfg.audience.as_str()),
                    ])
                    .send()
                    .await
                    .context("request OAuth2 client-credentials token")?
                    .error_for_status()
                    .context("OAuth2 token endpoint returned failure")?
                    .json()
                    .await
                    .context("decode OAuth2 token response")?;
                let ttl = Duration::from_secs(resp.expires_in.saturating_sub(60).max(30));
                *guard = Some((resp.access_token.clone(), Instant::now() + ttl));
                Ok(Some(resp.access_token))
            }
        }
    }

    /// Per-probe token override. A non-empty literal shadows the
    /// process-wide source.
    pub fn with_override(&self, token: &str) -> TokenSource {
        if token.is_empty() {
            self.clone()
        } else {
            TokenSource::Fixed(token.to_string())
        }
    }
}

/// Interval with a guard default when the configured value is zero.
pub fn duration_or(config_secs: u64, default_secs: u64) -> Duration {
    if config_secs == 0 {
        Duration::from_secs(default_secs)
    } else {
        Duration::from_secs(config_secs)
    }
}

/// Millisecond variant of [`duration_or`].
pub fn duration_ms_or(config_ms: u64, default_ms: u64) -> Duration {
    if config_ms == 0 {
        Duration::from_millis(default_ms)
    } else {
        Duration::from_millis(config_ms)
    }
}

fn has_json_prefix(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .map(|b| *b == b'{')
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const JSON_CFG: &str = r#"
    {
        "name": "unit-cluster",
        "prometheusConfig": {"port": ":8081", "exposeMetrics": true},
        "pulsarTopicConfig": [
            {
                "name": "latency-test",
                "pulsarUrl": "pulsar://broker.example.com:6650",
                "topicName": "persistent://mytenant/local/latency",
                "latencyBudgetMs": 360,
                "numberOfMessages": 5,
                "payloadSizes": ["15B"],
                "AlertPolicy": {"ceiling": 3, "movingWindowSeconds": 600, "ceilingInMovingWindow": 5}
            }
        ]
    }"#;

    const YAML_CFG: &str = r#"
name: unit-cluster
prometheusConfig:
  port: ":8080"
  exposeMetrics: true
webSocketConfig:
  - name: ws-test
    cluster: unit-cluster
    scheme: "wss://"
    port: "8001"
    topicName: persistent/mytenant/local/ws
"#;

    #[test]
    fn json_autodetected_by_prefix() {
        let cfg = Config::parse(JSON_CFG.as_bytes()).unwrap();
        assert_eq!(cfg.prometheus_config.port, ":8081");
        let topic = &cfg.pulsar_topic_config[0];
        assert_eq!(topic.latency_budget_ms, 360);
        assert_eq!(topic.num_of_messages, 5);
        assert_eq!(topic.alert_policy.ceiling, 3);
        assert_eq!(topic.alert_policy.moving_window_seconds, 600);
    }

    #[test]
    fn yaml_fallback_when_not_json() {
        let cfg = Config::parse(YAML_CFG.as_bytes()).unwrap();
        assert_eq!(cfg.prometheus_config.port, ":8080");
        assert_eq!(cfg.web_socket_config.len(), 1);
        assert_eq!(cfg.web_socket_config[0].scheme, "wss://");
    }

    #[test]
    fn missing_name_is_fatal() {
        assert!(Config::parse(b"{\"token\": \"abc\"}").is_err());
    }

    #[test]
    fn leading_whitespace_still_json() {
        let cfg = Config::parse(b"  \n\t {\"name\": \"x\"}").unwrap();
        assert_eq!(cfg.name, "x");
    }

    #[test]
    fn interval_guard_defaults() {
        assert_eq!(duration_or(0, 60), Duration::from_secs(60));
        assert_eq!(duration_or(15, 60), Duration::from_secs(15));
        assert_eq!(duration_ms_or(0, 2400), Duration::from_millis(2400));
    }

    #[tokio::test]
    async fn token_override_shadows_base() {
        let base = TokenSource::Fixed("base-token".to_string());
        let same = base.with_override("");
        let shadowed = base.with_override("probe-token");
        assert_eq!(same.token().await.unwrap().as_deref(), Some("base-token"));
        assert_eq!(
            shadowed.token().await.unwrap().as_deref(),
            Some("probe-token")
        );
    }
}
