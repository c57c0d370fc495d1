// WebSocket probe module
// Round-trips one base64-encoded payload through the messaging
// WebSocket interface over a producer and consumer connection pair
//
// Numan Thabit 2025 Nov

use crate::config::{duration_ms_or, TokenSource, WebSocketConfig};
use crate::engine::Engine;
use crate::metrics::{gauge_type, WEBSOCKET_SUBSYSTEM};
use crate::probes::pubsub::{DEFAULT_LATENCY_BUDGET_MS, FAILED_LATENCY};
use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

const OVERALL_TIMEOUT: Duration = Duration::from_secs(30);

const WS_API_PATH: &str = "/ws/v2/";

const DEFAULT_SUBSCRIPTION: &str = "ws-latency-subscription";

/// Message format produced over the messaging WebSocket interface
#[derive(Debug, Serialize)]
struct ProducedMessage {
    payload: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, String>,
}

/// Message frame delivered to the socket consumer
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    payload: String,
    message_id: String,
}

/// Acknowledgment frame for a received message
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AckMessage {
    message_id: String,
}

/// Producer and consumer endpoints for one probe target. Explicit URLs
/// win, otherwise both are assembled from scheme, cluster, port, topic,
/// and subscription.
pub fn resolve_urls(cfg: &WebSocketConfig) -> (String, String) {
    let producer_url = if cfg.producer_url.starts_with("ws") {
        cfg.producer_url.clone()
    } else {
        format!(
            "{}{}:{}{WS_API_PATH}producer/{}",
            cfg.scheme, cfg.cluster, cfg.port, cfg.topic_name
        )
    };

    let consumer_url = if cfg.consumer_url.starts_with("ws") {
        cfg.consumer_url.clone()
    } else {
        let subscription = if cfg.subscription.is_empty() {
            DEFAULT_SUBSCRIPTION
        } else {
            &cfg.subscription
        };
        format!(
            "{}{}:{}{WS_API_PATH}consumer/{}/{}",
            cfg.scheme, cfg.cluster, cfg.port, cfg.topic_name, subscription
        )
    };

    if cfg.url_query_params.is_empty() {
        (producer_url, consumer_url)
    } else {
        (
            format!("{producer_url}?{}", cfg.url_query_params),
            format!("{consumer_url}?{}", cfg.url_query_params),
        )
    }
}

/// Some gateway implementations authenticate through a token query
/// parameter rather than the Authorization header.
fn token_as_url_query_param(url: &str, token: &str) -> String {
    if url.ends_with("?token=") {
        format!("{url}{token}")
    } else {
        url.to_string()
    }
}

/// One produce and consume round trip over the WebSocket interface.
pub async fn ws_latency_test(
    producer_url: &str,
    consumer_url: &str,
    token: &TokenSource,
) -> Result<Duration> {
    let token_value = token.token().await?.unwrap_or_default();
    let prod_url = token_as_url_query_param(producer_url, &token_value);
    let cons_url = token_as_url_query_param(consumer_url, &token_value);

    let auth_header = if token_value.is_empty() {
        None
    } else {
        Some(
            HeaderValue::from_str(&format!("Bearer {token_value}"))
                .context("build Authorization header")?,
        )
    };

    let mut prod_request = prod_url
        .as_str()
        .into_client_request()
        .context("build producer WebSocket request")?;
    let mut cons_request = cons_url
        .as_str()
        .into_client_request()
        .context("build consumer WebSocket request")?;
    if let Some(header) = &auth_header {
        prod_request.headers_mut().insert(AUTHORIZATION, header.clone());
        cons_request.headers_mut().insert(AUTHORIZATION, header.clone());
    }

    let (prod_conn, _) = connect_async(prod_request)
        .await
        .context("dial producer WebSocket endpoint")?;
    let (cons_conn, _) = connect_async(cons_request)
        .await
        .context("dial consumer WebSocket endpoint")?;

    let (mut prod_write, mut prod_read) = prod_conn.split();
    let (mut cons_write, mut cons_read) = cons_conn.split();

    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let message_text = format!("test websocket lantecy {now_ms}");

    let (complete_tx, mut complete_rx) = tokio::sync::mpsc::channel::<Instant>(1);
    let (error_tx, mut error_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(2);

    // consumer listener, acks every frame and completes on payload match
    let expected = message_text.clone();
    let consumer_task = tokio::spawn(async move {
        loop {
            let frame = match cons_read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    let _ = error_tx.send(anyhow!("ws consumer read error: {err}")).await;
                    return;
                }
                None => {
                    let _ = error_tx
                        .send(anyhow!("ws consumer connection closed"))
                        .await;
                    return;
                }
            };

            let msg: ReceivedMessage = match serde_json::from_str(&frame) {
                Ok(msg) => msg,
                Err(err) => {
                    let _ = error_tx
                        .send(anyhow!("ws consumer frame decode error: {err}"))
                        .await;
                    return;
                }
            };
            let decoded = match BASE64.decode(&msg.payload) {
                Ok(bytes) => bytes,
                Err(err) => {
                    let _ = error_tx
                        .send(anyhow!("ws consumer payload decode error: {err}"))
                        .await;
                    return;
                }
            };

            let ack = AckMessage {
                message_id: msg.message_id,
            };
            let ack_text = serde_json::to_string(&ack).unwrap_or_default();
            if let Err(err) = cons_write.send(Message::Text(ack_text)).await {
                let _ = error_tx
                    .send(anyhow!("ws consumer failed to ack message: {err}"))
                    .await;
                return;
            }

            if decoded == expected.as_bytes() {
                let _ = complete_tx.send(Instant::now()).await;
                return;
            }
        }
    });

    // producer responses are informational only
    let producer_task = tokio::spawn(async move {
        match prod_read.next().await {
            Some(Ok(frame)) => debug!(?frame, "websocket producer received response"),
            Some(Err(err)) => debug!(error = %err, "websocket producer received benign error"),
            None => {}
        }
    });

    let encoded = BASE64.encode(message_text.as_bytes());
    let produced = ProducedMessage {
        payload: encoded,
        properties: HashMap::new(),
    };
    let sent_time = Instant::now();
    prod_write
        .send(Message::Text(
            serde_json::to_string(&produced).context("encode produced message")?,
        ))
        .await
        .context("send message over producer WebSocket")?;

    let outcome = tokio::select! {
        Some(received_time) = complete_rx.recv() => Ok(received_time.duration_since(sent_time)),
        Some(err) = error_rx.recv() => Err(err),
        _ = tokio::time::sleep(OVERALL_TIMEOUT) => {
            Err(anyhow!("timed out without receiving the expect message"))
        }
    };

    consumer_task.abort();
    producer_task.abort();
    outcome
}

/// Tests one cluster's WebSocket pub/sub latency and reports the result.
pub async fn test_ws_latency(engine: &Arc<Engine>, cfg: &WebSocketConfig) {
    let token = engine.token.with_override(&cfg.token);
    let expected_latency = duration_ms_or(cfg.latency_budget_ms, 2 * DEFAULT_LATENCY_BUDGET_MS);
    let (producer_url, consumer_url) = resolve_urls(cfg);

    let result = ws_latency_test(&producer_url, &consumer_url, &token).await;
    let gauge_opt = gauge_type(WEBSOCKET_SUBSYSTEM);

    match result {
        Err(err) => {
            error!(
                cluster = %cfg.cluster,
                test = %cfg.name,
                error = %err,
                "websocket latency test Pulsar error"
            );
            engine
                .metrics
                .latency_sum(&gauge_opt, &cfg.cluster, FAILED_LATENCY);
        }
        Ok(latency) if latency > expected_latency => {
            engine.outliers.add(&cfg.cluster, latency.as_millis() as f64);
            let err_msg = format!(
                "cluster {}, {} websocket test message latency {latency:?} over the budget {expected_latency:?}",
                cfg.cluster, cfg.name
            );
            error!("{err_msg}");
            engine
                .incidents
                .report_incident(
                    &cfg.name,
                    &cfg.cluster,
                    "websocket persisted latency test failure",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
            engine.metrics.latency_sum(&gauge_opt, &cfg.cluster, latency);
        }
        Ok(latency) => {
            let (stddev, mean, within_six_sigma) =
                engine.outliers.push(&cfg.cluster, latency.as_millis() as f64);
            if !within_six_sigma && stddev > 0.0 && mean > 0.0 {
                let err_msg = format!(
                    "cluster {}, websocket test message latency {latency:?} over six standard deviation {stddev} ms and mean is {mean} ms",
                    cfg.cluster
                );
                error!("{err_msg}");
                engine
                    .incidents
                    .report_incident(
                        &cfg.name,
                        &cfg.cluster,
                        "websocket persisted latency test failure",
                        &err_msg,
                        &cfg.alert_policy,
                    )
                    .await;
            } else {
                info!(
                    latency = ?latency,
                    budget = ?expected_latency,
                    topic = %cfg.topic_name,
                    cluster = %cfg.cluster,
                    "websocket pubsub succeeded"
                );
                engine.incidents.clear_incident(&cfg.name).await;
            }
            engine.metrics.latency_sum(&gauge_opt, &cfg.cluster, latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws_cfg() -> WebSocketConfig {
        WebSocketConfig {
            name: "ws-test".to_string(),
            cluster: "useast.example.com".to_string(),
            scheme: "wss://".to_string(),
            port: "8001".to_string(),
            topic_name: "persistent/mytenant/local/ws-topic".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn urls_assembled_from_parts() {
        let (producer, consumer) = resolve_urls(&ws_cfg());
        assert_eq!(
            producer,
            "wss://useast.example.com:8001/ws/v2/producer/persistent/mytenant/local/ws-topic"
        );
        assert_eq!(
            consumer,
            "wss://useast.example.com:8001/ws/v2/consumer/persistent/mytenant/local/ws-topic/ws-latency-subscription"
        );
    }

    #[test]
    fn explicit_urls_win() {
        let mut cfg = ws_cfg();
        cfg.producer_url = "ws://gateway/p".to_string();
        cfg.consumer_url = "wss://gateway/c".to_string();
        let (producer, consumer) = resolve_urls(&cfg);
        assert_eq!(producer, "ws://gateway/p");
        assert_eq!(consumer, "wss://gateway/c");
    }

    #[test]
    fn query_params_appended_to_both() {
        let mut cfg = ws_cfg();
        cfg.subscription = "my-sub".to_string();
        cfg.url_query_params = "token=".to_string();
        let (producer, consumer) = resolve_urls(&cfg);
        assert!(producer.ends_with("?token="));
        assert!(consumer.ends_with("/my-sub?token="));
    }

    #[test]
    fn token_query_param_only_on_marker() {
        assert_eq!(
            token_as_url_query_param("ws://x/p?token=", "jwt"),
            "ws://x/p?token=jwt"
        );
        assert_eq!(token_as_url_query_param("ws://x/p", "jwt"), "ws://x/p");
    }
}
