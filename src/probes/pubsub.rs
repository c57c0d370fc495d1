// Pub/sub latency probe module
// Produces a batch of correlated payloads, receives them back on an
// exclusive subscription, and measures per-message end-to-end latency
// with in-order and out-of-distribution checks
//
// Numan Thabit 2025 Nov

use crate::config::{duration_ms_or, TokenSource, TopicConfig};
use crate::engine::Engine;
use crate::metrics::{gauge_type, pubsub_downtime_gauge_opt, PUBSUB_SUBSYSTEM};
use crate::payload::{all_msg_payloads, expected_message, get_message_id};
use crate::util::first_non_empty;
use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use pulsar::message::proto::command_subscribe::SubType;
use pulsar::{consumer::InitialPosition, producer, Consumer, ConsumerOptions};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use url::Url;

/// Default end-to-end latency budget in milliseconds.
pub const DEFAULT_LATENCY_BUDGET_MS: u64 = 2400;

/// Distinguished latency marking a failed measurement. Exposition keeps
/// emitting a data point during outages instead of a stale-data gap.
pub const FAILED_LATENCY: Duration = Duration::from_secs(100);

const SUBSCRIPTION_NAME: &str = "latency-measure";

const MSG_PREFIX: &str = "messageid";

/// Result of one message latency test.
#[derive(Debug, Clone, Copy)]
pub struct MsgResult {
    pub in_order_delivery: bool,
    pub latency: Duration,
}

#[derive(Debug, Clone, Copy, Default)]
struct MsgRecord {
    sent_time: Option<Instant>,
    latency: Duration,
    in_order: bool,
}

/// Measures the latency of a full produce and consume round trip for a
/// batch of payloads over one producer and one exclusive consumer.
#[allow(clippy::too_many_arguments)]
pub async fn pubsub_latency(
    engine: &Engine,
    token: &TokenSource,
    uri: &str,
    topic_name: &str,
    output_topic: &str,
    msg_prefix: &str,
    expected_suffix: &str,
    payloads: Vec<Vec<u8>>,
    max_payload_size: usize,
) -> Result<MsgResult> {
    let client = engine
        .clients
        .get(uri, token.token().await?)
        .await
        .context("get messaging client")?;

    let mut producer = match client.producer().with_topic(topic_name).build().await {
        Ok(producer) => producer,
        Err(err) => {
            // producer creation failing hints at an invalidated session
            engine.clients.evict(uri).await;
            return Err(anyhow!("create producer on {topic_name}: {err}"));
        }
    };

    // the same input topic unless a separate output topic is configured,
    // the two-topic case covers a Pulsar-function test
    let consumer_topic = first_non_empty(&[output_topic, topic_name]).to_string();
    let consumer: Consumer<Vec<u8>, _> = match client
        .consumer()
        .with_topic(consumer_topic.as_str())
        .with_subscription(SUBSCRIPTION_NAME)
        .with_subscription_type(SubType::Exclusive)
        .with_options(ConsumerOptions::default().with_initial_position(InitialPosition::Latest))
        .build()
        .await
    {
        Ok(consumer) => consumer,
        Err(err) => {
            engine.clients.evict(uri).await;
            return Err(anyhow!("subscribe to {consumer_topic}: {err}"));
        }
    };

    let (complete_tx, mut complete_rx) = tokio::sync::mpsc::channel::<MsgResult>(1);
    let (error_tx, mut error_rx) = tokio::sync::mpsc::channel::<anyhow::Error>(payloads.len() + 1);

    // key is the expected payload string, value the per-message record
    let sent_payloads: Arc<Mutex<HashMap<String, MsgRecord>>> =
        Arc::new(Mutex::new(HashMap::with_capacity(payloads.len())));

    let receive_timeout = Duration::from_secs((5 + max_payload_size as u64 / 102_400).max(10));
    let total_payloads = payloads.len();

    let consumer_map = sent_payloads.clone();
    let consumer_error_tx = error_tx.clone();
    let consumer_prefix = msg_prefix.to_string();
    let consumer_task = tokio::spawn(async move {
        let mut consumer = consumer;
        let mut received_count = total_payloads;
        let mut last_index: i64 = -1;
        while received_count > 0 {
            debug!(received_count, "wait to receive on message count");
            let msg = match tokio::time::timeout(receive_timeout, consumer.try_next()).await {
                Ok(Ok(Some(msg))) => msg,
                Ok(Ok(None)) => {
                    let _ = consumer_error_tx
                        .send(anyhow!("consumer stream closed by broker"))
                        .await;
                    return;
                }
                Ok(Err(err)) => {
                    let _ = consumer_error_tx
                        .send(anyhow!("consumer receive error: {err}"))
                        .await;
                    return;
                }
                Err(_) => {
                    let _ = consumer_error_tx
                        .send(anyhow!(
                            "consumer receive timed out after {receive_timeout:?}"
                        ))
                        .await;
                    return;
                }
            };

            let received_time = Instant::now();
            let received_str = String::from_utf8_lossy(&msg.deserialize()).into_owned();
            let current_index = get_message_id(&consumer_prefix, &received_str);

            {
                let mut map = consumer_map.lock().unwrap();
                if let Some(record) = map.get_mut(&received_str) {
                    received_count -= 1;
                    if let Some(sent) = record.sent_time {
                        record.latency = received_time.duration_since(sent);
                    }
                    if let Some(index) = current_index {
                        if index as i64 > last_index {
                            record.in_order = true;
                            last_index = index as i64;
                        }
                    }
                }
            }
            if let Err(err) = consumer.ack(&msg).await {
                debug!(error = %err, "consumer ack failed");
            }
            debug!(
                index = ?current_index,
                size = received_str.len(),
                "consumer received message"
            );
        }

        // successful case, all messages received
        let (total, in_order) = {
            let map = consumer_map.lock().unwrap();
            map.values().fold(
                (Duration::ZERO, true),
                |(total, in_order), r| (total + r.latency, in_order && r.in_order),
            )
        };
        let mean_ms = total.as_millis() as u64 / total_payloads as u64;
        let _ = complete_tx
            .send(MsgResult {
                latency: Duration::from_millis(mean_ms),
                in_order_delivery: in_order,
            })
            .await;
    });

    for payload in &payloads {
        let payload_str = String::from_utf8_lossy(payload).into_owned();
        let expected = expected_message(&payload_str, expected_suffix);
        {
            let mut map = sent_payloads.lock().unwrap();
            map.insert(
                expected,
                MsgRecord {
                    sent_time: Some(Instant::now()),
                    ..Default::default()
                },
            );
        }

        match producer
            .send_non_blocking(producer::Message {
                payload: payload.clone(),
                ..Default::default()
            })
            .await
        {
            Ok(receipt) => {
                let receipt_error_tx = error_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = receipt.await {
                        let _ = receipt_error_tx
                            .send(anyhow!("message publish not acknowledged: {err}"))
                            .await;
                    }
                });
            }
            Err(err) => {
                let _ = error_tx.send(anyhow!("message publish failed: {err}")).await;
            }
        }
    }

    let overall_timeout = Duration::from_secs(5 * total_payloads as u64);
    let outcome = tokio::select! {
        Some(result) = complete_rx.recv() => Ok(result),
        Some(err) = error_rx.recv() => Err(err),
        _ = tokio::time::sleep(overall_timeout) => {
            Err(anyhow!("latency measure not received after timeout"))
        }
    };

    consumer_task.abort();
    outcome
}

/// Runs the configured topic test: single-partition targets measure
/// pub/sub latency, partitioned targets fan out per-partition consumers.
pub async fn test_topic(engine: &Arc<Engine>, cfg: &TopicConfig) {
    if cfg.number_of_partitions < 2 {
        test_topic_latency(engine, cfg).await;
    } else {
        crate::probes::partition::test_partition_topic(engine, cfg).await;
    }
}

/// Generic message delivery and latency test against one topic.
pub async fn test_topic_latency(engine: &Arc<Engine>, cfg: &TopicConfig) {
    let cluster_name = match cluster_name_of(&cfg.pulsar_url) {
        Ok(name) => name,
        Err(err) => {
            error!(url = %cfg.pulsar_url, error = %err, "invalid pulsar URL in topic config");
            return;
        }
    };
    let token = engine.token.with_override(&cfg.token);

    let expected_latency = duration_ms_or(cfg.latency_budget_ms, DEFAULT_LATENCY_BUDGET_MS);
    let (payloads, max_payload_size) =
        all_msg_payloads(MSG_PREFIX, &cfg.payload_sizes, cfg.num_of_messages);
    info!(
        messages = payloads.len(),
        topic = %cfg.topic_name,
        cluster = %cluster_name,
        budget = ?expected_latency,
        "send messages for latency measurement"
    );

    let result = pubsub_latency(
        engine,
        &token,
        &cfg.pulsar_url,
        &cfg.topic_name,
        &cfg.output_topic,
        MSG_PREFIX,
        &cfg.expected_msg,
        payloads,
        max_payload_size,
    )
    .await;

    let test_name = first_non_empty(&[&cfg.name, PUBSUB_SUBSYSTEM]).to_string();
    let gauge_opt = gauge_type(&test_name);

    match result {
        Err(err) => {
            let err_msg =
                format!("cluster {cluster_name}, {test_name} latency test Pulsar error: {err}");
            error!("{err_msg}");
            let created = engine
                .incidents
                .report_incident(
                    &cluster_name,
                    &cluster_name,
                    "persisted latency test failure",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
            if created && is_downtime_reporting(cfg) {
                engine.metrics.gauge(
                    &pubsub_downtime_gauge_opt(),
                    &cluster_name,
                    cfg.interval_seconds as f64,
                );
            }
            // keep the gauge emitting the sentinel during the outage
            engine
                .metrics
                .gauge(&gauge_opt, &cluster_name, FAILED_LATENCY.as_millis() as f64);
        }
        Ok(result) if !result.in_order_delivery => {
            error!(
                cluster = %cluster_name,
                test = %test_name,
                "test Pulsar message received out of order"
            );
            record_latency(engine, &gauge_opt, &cluster_name, result.latency);
        }
        Ok(result) if result.latency > expected_latency => {
            engine
                .outliers
                .add(&cluster_name, result.latency.as_micros() as f64);
            let err_msg = format!(
                "cluster {cluster_name}, {test_name} test message latency {:?} over the budget {:?}",
                result.latency, expected_latency
            );
            error!("{err_msg}");
            let created = engine
                .incidents
                .report_incident(
                    &cluster_name,
                    &cluster_name,
                    "persisted latency test failure",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
            if created && is_downtime_reporting(cfg) {
                engine.metrics.gauge(
                    &pubsub_downtime_gauge_opt(),
                    &cluster_name,
                    cfg.interval_seconds as f64,
                );
            }
            record_latency(engine, &gauge_opt, &cluster_name, result.latency);
        }
        Ok(result) => {
            let (stddev, mean, within_six_sigma) = engine
                .outliers
                .push(&cluster_name, result.latency.as_micros() as f64);
            if !within_six_sigma && stddev > 0.0 && mean > 0.0 {
                // out-of-distribution samples log but never page
                error!(
                    cluster = %cluster_name,
                    test = %test_name,
                    latency = ?result.latency,
                    stddev_us = stddev,
                    mean_us = mean,
                    "test message latency over six standard deviations from the mean"
                );
            } else {
                info!(
                    cluster = %cluster_name,
                    topic = %cfg.topic_name,
                    test = %test_name,
                    "latency test passed"
                );
                engine.incidents.clear_incident(&cluster_name).await;
                if is_downtime_reporting(cfg) {
                    engine
                        .metrics
                        .gauge(&pubsub_downtime_gauge_opt(), &cluster_name, 0.0);
                }
            }
            record_latency(engine, &gauge_opt, &cluster_name, result.latency);
        }
    }
}

fn record_latency(
    engine: &Engine,
    opt: &crate::metrics::MetricOpts,
    cluster: &str,
    latency: Duration,
) {
    if latency < FAILED_LATENCY {
        engine.metrics.latency_sum(opt, cluster, latency);
    }
}

/// Downtime is only meaningful for single-partition targets that name
/// their cluster explicitly.
fn is_downtime_reporting(cfg: &TopicConfig) -> bool {
    !cfg.downtime_tracker_disabled && cfg.number_of_partitions <= 1 && !cfg.cluster_name.is_empty()
}

/// Host part of the broker URL, used as the tracker component and the
/// metric device label.
pub fn cluster_name_of(pulsar_url: &str) -> Result<String> {
    let url = Url::parse(pulsar_url).with_context(|| format!("parse pulsar URL {pulsar_url}"))?;
    url.host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| anyhow!("pulsar URL {pulsar_url} carries no host"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_name_is_url_host() {
        assert_eq!(
            cluster_name_of("pulsar+ssl://useast.cloud.example.com:6651").unwrap(),
            "useast.cloud.example.com"
        );
        assert!(cluster_name_of("not a url").is_err());
    }

    #[test]
    fn downtime_reporting_guards() {
        let mut cfg = TopicConfig {
            cluster_name: "east".to_string(),
            number_of_partitions: 1,
            ..Default::default()
        };
        assert!(is_downtime_reporting(&cfg));
        cfg.downtime_tracker_disabled = true;
        assert!(!is_downtime_reporting(&cfg));
        cfg.downtime_tracker_disabled = false;
        cfg.number_of_partitions = 4;
        assert!(!is_downtime_reporting(&cfg));
        cfg.number_of_partitions = 1;
        cfg.cluster_name = String::new();
        assert!(!is_downtime_reporting(&cfg));
    }

    #[test]
    fn mean_latency_truncates_to_milliseconds() {
        // integer-millisecond truncated arithmetic, sum / N remultiplied
        let latencies = [
            Duration::from_micros(1400),
            Duration::from_micros(1900),
            Duration::from_micros(2600),
        ];
        let total: Duration = latencies.iter().sum();
        let mean_ms = total.as_millis() as u64 / latencies.len() as u64;
        assert_eq!(Duration::from_millis(mean_ms), Duration::from_millis(1));
    }
}
