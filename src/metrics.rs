// Metrics and observability module
// This file handles lazy registration and updates of the monitor's
// Prometheus series and the exposition endpoint
//
// Numan Thabit 2025 Nov

use anyhow::{bail, Context, Result};
use axum::{
    body::Body,
    http::StatusCode,
    response::Response,
    routing::get,
    Router,
};
use prometheus::{
    GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, Opts,
};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{error, info};

pub const FUNC_TOPIC_SUBSYSTEM: &str = "func_topic";
pub const PUBSUB_SUBSYSTEM: &str = "pubsub";
pub const WEBSOCKET_SUBSYSTEM: &str = "websocket";
pub const K8S_BROKER_SUBSYSTEM: &str = "k8s_broker";
pub const K8S_BOOKKEEPER_SUBSYSTEM: &str = "k8s_bookkeeper";
pub const K8S_ZOOKEEPER_SUBSYSTEM: &str = "k8s_zookeeper";
pub const K8S_PROXY_SUBSYSTEM: &str = "k8s_proxy";
pub const K8S_UNDEFINED_SUBSYSTEM: &str = "k8s_undefined";

/// Description of one series keyed by (namespace, subsystem, name).
#[derive(Debug, Clone)]
pub struct MetricOpts {
    pub namespace: &'static str,
    pub subsystem: &'static str,
    pub name: &'static str,
    pub help: &'static str,
}

impl MetricOpts {
    fn key(&self) -> String {
        format!("{}-{}-{}", self.namespace, self.subsystem, self.name)
    }

    fn full_name(&self) -> String {
        format!("{}_{}_{}", self.namespace, self.subsystem, self.name)
    }
}

/// Rest api tenant counts
pub fn tenants_gauge_opt() -> MetricOpts {
    MetricOpts {
        namespace: "pulsar",
        subsystem: "tenant",
        name: "size",
        help: "Pulsar rest api tenant counts",
    }
}

/// Offline pods counter per orchestrator workload kind
pub fn offline_pod_gauge_opt(subsystem: &'static str, help: &'static str) -> MetricOpts {
    MetricOpts {
        namespace: "pulsar",
        subsystem,
        name: "offline_counter",
        help,
    }
}

/// Hosting site latency gauge
pub fn site_latency_gauge_opt() -> MetricOpts {
    MetricOpts {
        namespace: "website",
        subsystem: "webendpoint",
        name: "latency_ms",
        help: "website endpoint monitor and latency in ms",
    }
}

/// Pulsar message latency gauge for a probe subsystem
pub fn msg_latency_gauge_opt(subsystem: &'static str, help: &'static str) -> MetricOpts {
    MetricOpts {
        namespace: "pulsar",
        subsystem,
        name: "latency_ms",
        help,
    }
}

/// Monitor uptime heartbeat counter
pub fn heartbeat_counter_opt() -> MetricOpts {
    MetricOpts {
        namespace: "pulsar",
        subsystem: "monitor",
        name: "counter",
        help: "Pulsar cluster monitor heartbeat",
    }
}

/// Pub/sub downtime gauge
pub fn pubsub_downtime_gauge_opt() -> MetricOpts {
    MetricOpts {
        namespace: "pulsar",
        subsystem: "pubsub",
        name: "downtime_seconds",
        help: "Pulsar pubsub downtime in seconds",
    }
}

/// Gauge option based on the probe name or subsystem
pub fn gauge_type(name_type: &str) -> MetricOpts {
    if name_type == FUNC_TOPIC_SUBSYSTEM || name_type.starts_with("func_topic") {
        return msg_latency_gauge_opt(
            FUNC_TOPIC_SUBSYSTEM,
            "Pulsar function input output topic latency in ms",
        );
    }
    if name_type == WEBSOCKET_SUBSYSTEM {
        return msg_latency_gauge_opt(
            WEBSOCKET_SUBSYSTEM,
            "Pulsar websocket pubsub topic latency in ms",
        );
    }
    msg_latency_gauge_opt(PUBSUB_SUBSYSTEM, "Pulsar pubsub message latency in ms")
}

/// Offline pods gauge option per orchestrator workload kind
pub fn offline_pods_counter(subsystem: &str) -> MetricOpts {
    match subsystem {
        K8S_BOOKKEEPER_SUBSYSTEM => offline_pod_gauge_opt(
            K8S_BOOKKEEPER_SUBSYSTEM,
            "Pulsar k8s cluster bookkeeper pods offline counter",
        ),
        K8S_BROKER_SUBSYSTEM => offline_pod_gauge_opt(
            K8S_BROKER_SUBSYSTEM,
            "Pulsar k8s cluster broker pods offline counter",
        ),
        K8S_PROXY_SUBSYSTEM => offline_pod_gauge_opt(
            K8S_PROXY_SUBSYSTEM,
            "Pulsar k8s cluster proxy pods offline counter",
        ),
        K8S_ZOOKEEPER_SUBSYSTEM => offline_pod_gauge_opt(
            K8S_ZOOKEEPER_SUBSYSTEM,
            "Pulsar k8s cluster zookeeper pods offline counter",
        ),
        _ => offline_pod_gauge_opt(
            K8S_UNDEFINED_SUBSYSTEM,
            "Pulsar k8s cluster undefined pods offline counter",
        ),
    }
}

/// Lazily registered metric series, one per (namespace, subsystem, name),
/// each carrying a `device` label for the cluster.
#[derive(Default)]
pub struct Metrics {
    gauges: RwLock<HashMap<String, GaugeVec>>,
    counters: RwLock<HashMap<String, IntCounterVec>>,
    histograms: RwLock<HashMap<String, HistogramVec>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a gauge reading, registering the series on first use.
    /// Re-registration is idempotent and reuses the existing series.
    pub fn gauge(&self, opt: &MetricOpts, cluster: &str, num: f64) {
        let key = opt.key();
        {
            let guard = self.gauges.read().unwrap();
            if let Some(metric) = guard.get(&key) {
                metric.with_label_values(&[cluster]).set(num);
                return;
            }
        }
        let mut guard = self.gauges.write().unwrap();
        let metric = guard.entry(key).or_insert_with(|| {
            let vec = GaugeVec::new(
                Opts::new(opt.full_name(), opt.help.to_string()),
                &["device"],
            )
            .unwrap();
            // AlreadyReg from a concurrent registration is benign
            let _ = prometheus::default_registry().register(Box::new(vec.clone()));
            vec
        });
        metric.with_label_values(&[cluster]).set(num);
    }

    /// Integer convenience wrapper over [`Metrics::gauge`].
    pub fn gauge_int(&self, opt: &MetricOpts, cluster: &str, num: i64) {
        self.gauge(opt, cluster, num as f64);
    }

    /// Increments a counter, registering the series on first use.
    pub fn counter_inc(&self, opt: &MetricOpts, cluster: &str) {
        let key = opt.key();
        {
            let guard = self.counters.read().unwrap();
            if let Some(metric) = guard.get(&key) {
                metric.with_label_values(&[cluster]).inc();
                return;
            }
        }
        let mut guard = self.counters.write().unwrap();
        let metric = guard.entry(key).or_insert_with(|| {
            let vec = IntCounterVec::new(
                Opts::new(opt.full_name(), opt.help.to_string()),
                &["device"],
            )
            .unwrap();
            let _ = prometheus::default_registry().register(Box::new(vec.clone()));
            vec
        });
        metric.with_label_values(&[cluster]).inc();
    }

    /// Records a latency on both the gauge and its `_hst` distribution.
    pub fn latency_sum(&self, opt: &MetricOpts, cluster: &str, latency: Duration) {
        let ms = latency.as_millis() as f64;
        self.gauge(opt, cluster, ms);

        let key = opt.key();
        {
            let guard = self.histograms.read().unwrap();
            if let Some(metric) = guard.get(&key) {
                metric.with_label_values(&[cluster]).observe(ms);
                return;
            }
        }
        let mut guard = self.histograms.write().unwrap();
        let metric = guard.entry(key).or_insert_with(|| {
            let vec = HistogramVec::new(
                HistogramOpts::new(format!("{}_hst", opt.full_name()), opt.help.to_string())
                    .buckets(prometheus::exponential_buckets(5.0, 2.0, 14).unwrap()),
                &["device"],
            )
            .unwrap();
            let _ = prometheus::default_registry().register(Box::new(vec.clone()));
            vec
        });
        metric.with_label_values(&[cluster]).observe(ms);
    }
}

/// HTTP router exposing /metrics and a liveness endpoint.
pub fn metrics_router() -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

/// Prometheus metrics endpoint
async fn metrics_endpoint() -> Response {
    use prometheus::{Encoder, TextEncoder};

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    let status = match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => StatusCode::OK,
        Err(err) => {
            buffer = format!("metrics encoding error: {err}").into_bytes();
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };

    Response::builder()
        .status(status)
        .header(axum::http::header::CONTENT_TYPE, encoder.format_type())
        .body(Body::from(buffer))
        .unwrap_or_else(|_| {
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("failed to build metrics response"))
                .unwrap()
        })
}

/// Scrapes the local exposition endpoint and keeps only the pulsar series.
async fn scrape_local(http: &reqwest::Client, port: &str) -> Result<String> {
    let url = format!("http://localhost{port}/metrics");
    let response = http
        .get(&url)
        .send()
        .await
        .with_context(|| format!("scrape self's prometheus {url}"))?;

    if response.status() != reqwest::StatusCode::OK {
        bail!(
            "scrape self's prometheus {url} response status code {}",
            response.status()
        );
    }

    let body = response
        .text()
        .await
        .with_context(|| format!("scrape self's prometheus {url} read response body"))?;

    let filtered: Vec<&str> = body.lines().filter(|l| l.contains("pulsar")).collect();
    Ok(filtered.join("\n"))
}

/// Pushes the scraped exposition body to the configured push proxy.
pub async fn push_to_prometheus_proxy(
    http: &reqwest::Client,
    port: &str,
    proxy_url: &str,
    auth_key: &str,
) -> Result<()> {
    let data = scrape_local(http, port).await?;

    let response = http
        .post(proxy_url)
        .header(reqwest::header::AUTHORIZATION, auth_key)
        .body(data)
        .send()
        .await
        .with_context(|| format!("push to prometheus proxy {proxy_url}"))?;

    if response.status() != reqwest::StatusCode::OK {
        bail!(
            "push to prometheus proxy {proxy_url} error status code {}",
            response.status()
        );
    }
    Ok(())
}

/// Daemon loop that scrapes and pushes metrics to the push proxy every 10s.
pub fn spawn_push_proxy_loop(cfg: &crate::config::Config) {
    let prom = cfg.prometheus_config.clone();
    if prom.prometheus_proxy_url.is_empty() || !prom.expose_metrics {
        info!("this process is not configured to push metrics to a prometheus proxy");
        return;
    }
    let proxy_instance_url = format!("{}/{}", prom.prometheus_proxy_url, cfg.name);
    info!(url = %proxy_instance_url, "push to prometheus proxy");

    tokio::spawn(async move {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(50))
            .build()
            .expect("build push proxy HTTP client");
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            if let Err(err) = push_to_prometheus_proxy(
                &http,
                &prom.port,
                &proxy_instance_url,
                &prom.prometheus_proxy_api_key,
            )
            .await
            {
                error!(error = %err, "prometheus proxy push failed");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_registration_is_idempotent() {
        let metrics = Metrics::new();
        let opt = MetricOpts {
            namespace: "unit",
            subsystem: "registry",
            name: "gauge_a",
            help: "unit test gauge",
        };
        metrics.gauge(&opt, "cluster-x", 1.0);
        metrics.gauge(&opt, "cluster-x", 5.0);
        metrics.gauge(&opt, "cluster-y", 7.0);
        let guard = metrics.gauges.read().unwrap();
        assert_eq!(guard.len(), 1, "one series per (ns, subsystem, name)");
        let vec = guard.get("unit-registry-gauge_a").unwrap();
        assert_eq!(vec.with_label_values(&["cluster-x"]).get(), 5.0);
        assert_eq!(vec.with_label_values(&["cluster-y"]).get(), 7.0);
    }

    #[test]
    fn latency_sum_registers_gauge_and_histogram() {
        let metrics = Metrics::new();
        let opt = MetricOpts {
            namespace: "unit",
            subsystem: "registry",
            name: "latency_ms",
            help: "unit test latency",
        };
        metrics.latency_sum(&opt, "cluster-x", Duration::from_millis(42));
        metrics.latency_sum(&opt, "cluster-x", Duration::from_millis(58));
        assert_eq!(metrics.gauges.read().unwrap().len(), 1);
        assert_eq!(metrics.histograms.read().unwrap().len(), 1);
        let gauges = metrics.gauges.read().unwrap();
        let vec = gauges.get("unit-registry-latency_ms").unwrap();
        assert_eq!(vec.with_label_values(&["cluster-x"]).get(), 58.0);
    }

    #[test]
    fn gauge_type_by_subsystem_name() {
        assert_eq!(gauge_type("websocket").subsystem, WEBSOCKET_SUBSYSTEM);
        assert_eq!(gauge_type("func_topic-orders").subsystem, FUNC_TOPIC_SUBSYSTEM);
        assert_eq!(gauge_type("anything-else").subsystem, PUBSUB_SUBSYSTEM);
    }

    #[test]
    fn offline_counter_per_kind() {
        assert_eq!(
            offline_pods_counter(K8S_ZOOKEEPER_SUBSYSTEM).subsystem,
            K8S_ZOOKEEPER_SUBSYSTEM
        );
        assert_eq!(
            offline_pods_counter("something").subsystem,
            K8S_UNDEFINED_SUBSYSTEM
        );
    }
}
