// Partition probe module
// Verifies a partitioned topic exists, fans one consumer out per
// partition, and measures aggregate delivery latency across them
//
// Numan Thabit 2025 Nov

use crate::config::{duration_ms_or, TokenSource, TopicConfig};
use crate::engine::Engine;
use crate::probes::pubsub::{cluster_name_of, DEFAULT_LATENCY_BUDGET_MS};
use crate::util::tokenize_topic_full_name;
use anyhow::{anyhow, bail, Context, Result};
use futures::TryStreamExt;
use pulsar::message::proto::command_subscribe::SubType;
use pulsar::{consumer::InitialPosition, producer, Consumer, ConsumerOptions, Pulsar, TokioExecutor};
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{error, info};

const PARTITION_SUFFIX: &str = "-partition-";

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(60);

const TEST_NAME: &str = "partition-topics-test";

/// Per-consumer verdict sent back over the completion channel.
#[derive(Debug)]
struct ConsumerSignal {
    matched: bool,
    err: Option<anyhow::Error>,
}

/// A partitioned topic availability test object, cached per topic.
pub struct PartitionTopic {
    pub number_of_partitions: usize,
    pub topic_fullname: String,
    tenant: String,
    namespace: String,
    topic_name: String,
    base_admin_url: String,
}

impl PartitionTopic {
    /// Builds the test object. Only persistent topics can be partitioned
    /// here.
    pub fn new(topic_fn: &str, admin_url: &str, num_of_partitions: usize) -> Result<Self> {
        let parts = tokenize_topic_full_name(topic_fn)?;
        if !parts.is_persistent {
            bail!("does not support non-persistent topic in partition topic test");
        }
        Ok(Self {
            number_of_partitions: num_of_partitions,
            topic_fullname: topic_fn.to_string(),
            tenant: parts.tenant,
            namespace: parts.namespace,
            topic_name: parts.topic,
            base_admin_url: admin_url.to_string(),
        })
    }

    /// Whether the partitioned topic is already present in the namespace.
    pub async fn exists(&self, engine: &Engine, token: &TokenSource) -> Result<bool> {
        let url = format!(
            "{}/admin/v2/persistent/{}/{}/partitioned",
            self.base_admin_url.trim_end_matches('/'),
            self.tenant,
            self.namespace
        );
        let response = engine.admin_get(&url, token).await?;
        if response.status() != StatusCode::OK {
            bail!(
                "GET partitioned topic list {url} response status code {}",
                response.status()
            );
        }
        let topics: Vec<String> = response
            .json()
            .await
            .context("decode partitioned topic list")?;
        let expected = format!(
            "persistent://{}/{}/{}",
            self.tenant, self.namespace, self.topic_name
        );
        Ok(topics.iter().any(|t| *t == expected))
    }

    /// Creates the partitioned topic. 204 is plain success, 409 covers
    /// the race where another monitor instance created it concurrently.
    pub async fn create(&self, engine: &Engine, token: &TokenSource) -> Result<()> {
        let url = format!(
            "{}/admin/v2/persistent/{}/{}/{}/partitions",
            self.base_admin_url.trim_end_matches('/'),
            self.tenant,
            self.namespace,
            self.topic_name
        );
        info!(url = %url, "create partition topic");
        let response = engine
            .admin_put(&url, token, self.number_of_partitions.to_string())
            .await?;
        let status = response.status();
        if status != StatusCode::NO_CONTENT && status != StatusCode::CONFLICT {
            bail!("CREATE partitioned topic {url} response status code {status}");
        }
        info!(
            topic = %self.topic_name,
            partitions = self.number_of_partitions,
            status = %status,
            "partition topic created"
        );
        Ok(())
    }

    /// Verifies existence of the partitioned topic, creating it when
    /// missing.
    pub async fn verify(&self, engine: &Engine, token: &TokenSource) -> Result<()> {
        if self.exists(engine, token).await? {
            info!(topic = %self.topic_fullname, "partitioned topic already exists");
            return Ok(());
        }
        self.create(engine, token).await
    }

    /// Sends one keyed message per partition and waits until every
    /// partition's consumer observed the payload. Returns the elapsed
    /// time since production started.
    pub async fn run(&self, client: Arc<Pulsar<TokioExecutor>>) -> Result<Duration> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let message = format!("partition topic test message {now_ms}");

        let (complete_tx, mut complete_rx) =
            tokio::sync::mpsc::channel::<ConsumerSignal>(self.number_of_partitions);

        info!(topic = %self.topic_fullname, "create a topic producer");
        let mut producer = client
            .producer()
            .with_topic(self.topic_fullname.as_str())
            .build()
            .await
            .context("create partition topic producer")?;

        // one consumer listening on each individual partition topic
        let mut consumer_tasks = Vec::with_capacity(self.number_of_partitions);
        for i in 0..self.number_of_partitions {
            let topic_name = format!("{}{PARTITION_SUFFIX}{i}", self.topic_fullname);
            info!(topic = %topic_name, "subscribe to partition topic");
            consumer_tasks.push(tokio::spawn(verify_message_by_consumer(
                client.clone(),
                topic_name,
                message.clone(),
                RECEIVE_TIMEOUT,
                complete_tx.clone(),
            )));
        }
        drop(complete_tx);

        // distinct keys route at least one message onto every partition
        let start = Instant::now();
        for i in 0..self.number_of_partitions {
            let send = producer
                .send_non_blocking(producer::Message {
                    payload: message.clone().into_bytes(),
                    partition_key: Some(format!("partitionkey{i}")),
                    ..Default::default()
                })
                .await;
            match send {
                Ok(receipt) => {
                    tokio::spawn(async move {
                        if let Err(err) = receipt.await {
                            error!(error = %err, "failed to send message over partition topic");
                        }
                    });
                }
                Err(err) => {
                    error!(error = %err, "failed to send message over partition topic");
                }
            }
        }

        let mut received_counter = 0;
        let mut successful_counter = 0;
        let timeout = tokio::time::sleep(RECEIVE_TIMEOUT);
        tokio::pin!(timeout);
        let outcome = 'wait: {
            while received_counter < self.number_of_partitions {
                tokio::select! {
                    signal = complete_rx.recv() => {
                        let Some(signal) = signal else { break };
                        received_counter += 1;
                        info!(received_counter, "partition consumer signaled");
                        if let Some(err) = signal.err {
                            error!(topic = %self.topic_fullname, error = %err, "partition receive error");
                        } else if signal.matched {
                            successful_counter += 1;
                        } else {
                            error!(topic = %self.topic_fullname, "failed to receive expected messages");
                        }
                        if successful_counter >= self.number_of_partitions {
                            break 'wait Ok(start.elapsed());
                        }
                    }
                    _ = &mut timeout => {
                        break 'wait Err(anyhow!(
                            "received {received_counter} msg with {successful_counter} successful delivery but timed out to receive all {} messages",
                            self.number_of_partitions
                        ));
                    }
                }
            }
            Err(anyhow!(
                "received {successful_counter} out of {} messages",
                self.number_of_partitions
            ))
        };

        for task in &consumer_tasks {
            task.abort();
        }
        outcome
    }
}

/// Subscribes to one partition topic from the earliest position and
/// signals whether the expected message showed up before the timeout.
async fn verify_message_by_consumer(
    client: Arc<Pulsar<TokioExecutor>>,
    topic_name: String,
    expected_message: String,
    receive_timeout: Duration,
    complete_tx: tokio::sync::mpsc::Sender<ConsumerSignal>,
) {
    let subscription = format!(
        "partition-sub{}",
        topic_name.rsplit('/').next().unwrap_or(&topic_name)
    );
    let consumer: Result<Consumer<Vec<u8>, _>, _> = client
        .consumer()
        .with_topic(topic_name.as_str())
        .with_subscription(subscription)
        .with_subscription_type(SubType::Exclusive)
        .with_batch_size(1)
        .with_options(ConsumerOptions::default().with_initial_position(InitialPosition::Earliest))
        .build()
        .await;

    let mut consumer = match consumer {
        Ok(consumer) => consumer,
        Err(err) => {
            error!(topic = %topic_name, error = %err, "failed to create partition topic consumer");
            let _ = complete_tx
                .send(ConsumerSignal {
                    matched: false,
                    err: Some(anyhow!("create consumer on {topic_name}: {err}")),
                })
                .await;
            return;
        }
    };

    let start = Instant::now();
    while start.elapsed() <= receive_timeout {
        let msg = match tokio::time::timeout(receive_timeout, consumer.try_next()).await {
            Ok(Ok(Some(msg))) => msg,
            Ok(Ok(None)) | Err(_) => {
                let _ = complete_tx
                    .send(ConsumerSignal {
                        matched: false,
                        err: Some(anyhow!("consumer receive timed out on {topic_name}")),
                    })
                    .await;
                return;
            }
            Ok(Err(err)) => {
                let _ = complete_tx
                    .send(ConsumerSignal {
                        matched: false,
                        err: Some(anyhow!("consumer receive error: {err}")),
                    })
                    .await;
                return;
            }
        };

        let payload = msg.deserialize();
        if let Err(err) = consumer.ack(&msg).await {
            error!(topic = %topic_name, error = %err, "partition consumer ack failed");
        }
        if payload == expected_message.as_bytes() {
            info!(topic = %topic_name, "expected message received");
            let _ = complete_tx
                .send(ConsumerSignal {
                    matched: true,
                    err: None,
                })
                .await;
            return;
        }
    }
    let _ = complete_tx
        .send(ConsumerSignal {
            matched: false,
            err: None,
        })
        .await;
}

/// Runs the partitioned-topic availability test for one configured topic.
pub async fn test_partition_topic(engine: &Arc<Engine>, cfg: &TopicConfig) {
    let cluster_name = match cluster_name_of(&cfg.pulsar_url) {
        Ok(name) => name,
        Err(err) => {
            error!(url = %cfg.pulsar_url, error = %err, "invalid pulsar URL in topic config");
            return;
        }
    };
    let component = format!("{cluster_name}-{TEST_NAME}");
    let token = engine.token.with_override(&cfg.token);

    let pt = match get_partition(engine, cfg, &token).await {
        Ok(pt) => pt,
        Err(err) => {
            let err_msg =
                format!("{component} failed to create PartitionTopic test object, error: {err}");
            engine
                .incidents
                .report_incident(
                    &component,
                    &component,
                    "persisted failure to create partition topic test client",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
            return;
        }
    };

    let client = match engine
        .clients
        .get(&cfg.pulsar_url, token.token().await.ok().flatten())
        .await
    {
        Ok(client) => client,
        Err(err) => {
            let err_msg = format!(
                "cluster {component}, {TEST_NAME} failed create Pulsar Client with error: {err}"
            );
            engine.incidents.chat().alert(&err_msg).await;
            engine
                .incidents
                .report_incident(
                    &component,
                    &component,
                    "partition topic test failure",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
            return;
        }
    };

    match pt.run(client).await {
        Err(err) => {
            let err_msg = format!(
                "cluster {component}, {TEST_NAME} partition topic test failed with Pulsar error: {err}"
            );
            engine.incidents.chat().alert(&err_msg).await;
            engine
                .incidents
                .report_incident(
                    &component,
                    &component,
                    "partition topic test failure",
                    &err_msg,
                    &cfg.alert_policy,
                )
                .await;
        }
        Ok(latency) => {
            let expected_latency = duration_ms_or(cfg.latency_budget_ms, DEFAULT_LATENCY_BUDGET_MS);
            if latency > expected_latency || latency.is_zero() {
                let err_msg = format!(
                    "cluster {component}, partition topic test message latency {latency:?} over the budget {expected_latency:?}"
                );
                engine.incidents.chat().alert(&err_msg).await;
                engine
                    .incidents
                    .report_incident(
                        &component,
                        &component,
                        "partition topic test has over budget latency",
                        &err_msg,
                        &cfg.alert_policy,
                    )
                    .await;
            } else {
                info!(
                    partitions = pt.number_of_partitions,
                    latency = ?latency,
                    "partition topics test successfully passed"
                );
                engine.incidents.clear_incident(&component).await;
            }
        }
    }
}

/// Cached per-topic partition test object, verified on every use.
async fn get_partition(
    engine: &Arc<Engine>,
    cfg: &TopicConfig,
    token: &TokenSource,
) -> Result<Arc<PartitionTopic>> {
    let cached = {
        let guard = engine.partitions.read().await;
        guard.get(&cfg.topic_name).cloned()
    };

    let pt = match cached {
        Some(pt) => pt,
        None => {
            if cfg.admin_url.is_empty() {
                // a partition test without an admin endpoint cannot verify
                bail!("missing adminUrl for partition topic test {}", cfg.topic_name);
            }
            let pt = Arc::new(PartitionTopic::new(
                &cfg.topic_name,
                &cfg.admin_url,
                cfg.number_of_partitions,
            )?);
            let mut guard = engine.partitions.write().await;
            guard
                .entry(cfg.topic_name.clone())
                .or_insert_with(|| pt.clone());
            pt
        }
    };

    pt.verify(engine, token).await?;
    Ok(pt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_persistent_topics() {
        let err = PartitionTopic::new(
            "non-persistent://tenant/ns/topic",
            "http://admin.example.com",
            4,
        );
        assert!(err.is_err());
    }

    #[test]
    fn partition_topic_parses_route() {
        let pt = PartitionTopic::new(
            "persistent://tenant/ns/parts",
            "http://admin.example.com:8080",
            4,
        )
        .unwrap();
        assert_eq!(pt.tenant, "tenant");
        assert_eq!(pt.namespace, "ns");
        assert_eq!(pt.topic_name, "parts");
        assert_eq!(pt.number_of_partitions, 4);
    }
}
