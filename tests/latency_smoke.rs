use std::sync::Arc;

use anyhow::Result;
use pulsar_sentinel::config::Config;
use pulsar_sentinel::engine::Engine;
use pulsar_sentinel::payload::all_msg_payloads;
use pulsar_sentinel::probes::pubsub::pubsub_latency;

fn required_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

#[tokio::test]
#[ignore]
async fn pubsub_latency_live_smoke() -> Result<()> {
    let pulsar_url = match required_env("TEST_PULSAR_URL") {
        Some(url) => url,
        None => return Ok(()),
    };

    let topic_name = match required_env("TEST_PULSAR_TOPIC") {
        Some(topic) => topic,
        None => return Ok(()),
    };

    let token = required_env("TEST_PULSAR_TOKEN").unwrap_or_default();

    let cfg_json = format!(
        r#"{{
            "name": "smoke-test",
            "token": "{token}",
            "pulsarTopicConfig": [
                {{
                    "pulsarUrl": "{pulsar_url}",
                    "topicName": "{topic_name}",
                    "latencyBudgetMs": 2400,
                    "numberOfMessages": 3,
                    "payloadSizes": ["15B"]
                }}
            ]
        }}"#
    );
    let cfg = Config::parse(cfg_json.as_bytes())?;
    let engine: Arc<Engine> = Engine::new(cfg)?;

    let (payloads, max_payload_size) = all_msg_payloads("messageid", &["15B".to_string()], 3);
    let result = pubsub_latency(
        &engine,
        &engine.token,
        &pulsar_url,
        &topic_name,
        "",
        "messageid",
        "",
        payloads,
        max_payload_size,
    )
    .await?;

    assert!(result.in_order_delivery);
    assert!(result.latency < pulsar_sentinel::probes::pubsub::FAILED_LATENCY);
    Ok(())
}
