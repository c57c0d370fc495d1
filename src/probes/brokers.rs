// Broker sweep probe module
// Queries each broker's health endpoint and samples per-topic stats to
// spot brokers that answer the listing but fail real work
//
// Numan Thabit 2025 Nov

use crate::config::{TokenSource, TopicConfig};
use crate::engine::Engine;
use crate::util::{single_slash_join, topic_fn_to_url};
use anyhow::{bail, Result};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info};

/// Up to this many sampled topic-stats calls per broker.
const SAMPLED_TOPICS: usize = 3;

/// Nested namespace/bundle/domain/topic map returned by the broker-stats
/// topics endpoint.
type BrokerTopicsMap = HashMap<String, HashMap<String, HashMap<String, HashMap<String, serde_json::Value>>>>;

/// Gets the list of broker addresses for the cluster.
pub async fn get_brokers(
    engine: &Engine,
    rest_base_url: &str,
    cluster_name: &str,
    token: &TokenSource,
) -> Result<Vec<String>> {
    let brokers_url = single_slash_join(rest_base_url, &format!("admin/v2/brokers/{cluster_name}"));
    let response = engine.admin_get(&brokers_url, token).await?;
    if response.status().as_u16() > 300 {
        bail!(
            "failed to get a list of brokers, returns incorrect status code {}",
            response.status()
        );
    }
    let brokers: Vec<String> = response.json().await?;
    Ok(brokers)
}

fn with_http_scheme(addr: &str) -> String {
    if addr.starts_with("http") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

/// Topic full names currently served by one broker.
async fn broker_topics(engine: &Engine, broker_url: &str, token: &TokenSource) -> Result<Vec<String>> {
    let topic_stats_url = single_slash_join(&with_http_scheme(broker_url), "admin/v2/broker-stats/topics");

    let response = engine.admin_get(&topic_stats_url, token).await?;
    if response.status() != StatusCode::OK {
        bail!(
            "GET broker topic stats {topic_stats_url} response status code {}",
            response.status()
        );
    }

    let namespaces: BrokerTopicsMap = response.json().await?;
    let mut topics = Vec::new();
    for bundles in namespaces.values() {
        for domains in bundles.values() {
            for topic_map in domains.values() {
                topics.extend(topic_map.keys().cloned());
            }
        }
    }
    Ok(topics)
}

/// One broker's health endpoint must answer the literal body `ok`.
async fn broker_health_check(engine: &Engine, broker: &str, token: &TokenSource) -> Result<()> {
    let broker_url = single_slash_join(&with_http_scheme(broker), "admin/v2/brokers/health");
    let response = engine.admin_get(&broker_url, token).await?;
    if response.status() != StatusCode::OK {
        bail!(
            "GET broker healthcheck {broker_url} response status code {}",
            response.status()
        );
    }
    let body = response.text().await?;
    if body != "ok" {
        bail!("broker healthcheck {broker_url} status is not ok but {body}");
    }
    Ok(())
}

/// Queries a single topic's stats endpoint.
async fn query_topic_stats(engine: &Engine, url: &str, token: &TokenSource) -> Result<()> {
    let response = engine.admin_get(url, token).await?;
    if response.status() != StatusCode::OK {
        bail!(
            "GET broker topic stats {url} response status code {}",
            response.status()
        );
    }
    Ok(())
}

/// Evaluates every broker's health. A broker is failed when its health
/// check fails or two sampled topic-stats calls fail. Returns the failed
/// broker count.
pub async fn evaluate_brokers(
    engine: &Engine,
    url_prefix: &str,
    cluster_name: &str,
    token: &TokenSource,
) -> Result<usize> {
    let brokers = get_brokers(engine, url_prefix, cluster_name, token).await?;
    info!(?brokers, "a list of brokers");

    let mut failed_brokers = 0;
    let mut error_str = String::new();

    for broker in &brokers {
        if let Err(err) = broker_health_check(engine, broker, token).await {
            error_str.push_str(";;");
            error_str.push_str(&err.to_string());
            failed_brokers += 1;
            continue;
        }

        let topics = match broker_topics(engine, broker, token).await {
            Ok(topics) => topics,
            Err(err) => {
                error_str.push_str(";;");
                error_str.push_str(&err.to_string());
                failed_brokers += 1;
                continue;
            }
        };

        // subtract the healthcheck topic from the sample budget
        let required_count = SAMPLED_TOPICS.min(topics.len().saturating_sub(1));
        let mut count = 0;
        let mut failure_count = 0;
        for topic in &topics {
            if topic.ends_with("/healthcheck") {
                continue;
            }
            let route = match topic_fn_to_url(topic) {
                Ok(route) => route,
                Err(err) => {
                    error!(topic = %topic, error = %err, "skip malformed topic name");
                    continue;
                }
            };
            let url = single_slash_join(
                &single_slash_join(url_prefix, "/admin/v2/"),
                &format!("{route}/stats"),
            );
            if let Err(err) = query_topic_stats(engine, &url, token).await {
                error_str.push_str(";;");
                error_str.push_str(&err.to_string());
                failure_count += 1;
            }
            count += 1;

            if failure_count > 1 {
                failed_brokers += 1;
                break;
            }
            if count >= required_count {
                break;
            }
        }
        info!(
            broker = %broker,
            sampled = count,
            failed = failure_count,
            "broker topic stats sample finished"
        );
    }

    info!(
        cluster = cluster_name,
        failed = failed_brokers,
        total = brokers.len(),
        "broker sweep finished"
    );
    if !error_str.is_empty() {
        error!(cluster = cluster_name, errors = %error_str, "broker sweep errors");
    }
    Ok(failed_brokers)
}

/// Evaluates and reports the health of all brokers behind a topic's
/// cluster.
pub async fn test_brokers(engine: &Arc<Engine>, cfg: &TopicConfig) {
    if cfg.cluster_name.is_empty() {
        return;
    }
    let component = format!("{}-brokers", cfg.cluster_name);
    let token = engine.token.with_override(&cfg.token);

    let rest_url = if cfg.admin_url.is_empty() {
        engine.cfg.brokers_config.incluster_rest_url.clone()
    } else {
        cfg.admin_url.clone()
    };
    if rest_url.is_empty() {
        return;
    }

    match evaluate_brokers(engine, &rest_url, &cfg.cluster_name, &token).await {
        Ok(0) => {
            info!(component = %component, "broker test has successfully passed");
            engine.incidents.clear_incident(&component).await;
        }
        Ok(failed) => {
            let err_msg = format!("cluster {component} has {failed} unhealthy brokers");
            error!("{err_msg}");
            engine
                .incidents
                .report_incident(
                    &component,
                    &component,
                    "brokers are unhealthy reported by pulsar-sentinel",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
        }
        Err(err) => {
            // the broker list itself was unobtainable, the failure count
            // is indeterminate so this notifies without escalating
            let err_msg = format!("cluster {component} Pulsar brokers test failed, error message: {err}");
            error!("{err_msg}");
            engine.incidents.chat().alert(&err_msg).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_prefixed_once() {
        assert_eq!(with_http_scheme("10.0.0.5:8080"), "http://10.0.0.5:8080");
        assert_eq!(with_http_scheme("http://b:8080"), "http://b:8080");
        assert_eq!(with_http_scheme("https://b:8443"), "https://b:8443");
    }

    #[test]
    fn topics_map_flattens() {
        let raw = r#"
        {
            "mytenant/local": {
                "0x00000000_0xffffffff": {
                    "persistent": {
                        "persistent://mytenant/local/topic-a": {},
                        "persistent://mytenant/local/topic-b": {}
                    }
                }
            }
        }"#;
        let parsed: BrokerTopicsMap = serde_json::from_str(raw).unwrap();
        let mut topics = Vec::new();
        for bundles in parsed.values() {
            for domains in bundles.values() {
                for topic_map in domains.values() {
                    topics.extend(topic_map.keys().cloned());
                }
            }
        }
        topics.sort();
        assert_eq!(
            topics,
            vec![
                "persistent://mytenant/local/topic-a",
                "persistent://mytenant/local/topic-b"
            ]
        );
    }
}
