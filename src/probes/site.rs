// Site probe module
// Plain HTTP endpoint monitor with latency gauge and expected status
// code verification
//
// Numan Thabit 2025 Nov

use crate::config::{duration_or, SiteConfig};
use crate::engine::Engine;
use crate::metrics::site_latency_gauge_opt;
use anyhow::{anyhow, bail, Context, Result};
use backoff::{future::retry, ExponentialBackoff};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// GETs the site once, with the configured retries, and verifies the
/// expected status code. Latency is recorded even for mismatches.
pub async fn monitor_site(engine: &Engine, site: &SiteConfig) -> Result<()> {
    let http = reqwest::Client::builder()
        .timeout(duration_or(site.response_seconds, 10))
        .build()
        .context("build HTTP client for site monitor")?;

    let retries_window = Duration::from_secs(4 + 8 * site.retries as u64);
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_secs(4),
        max_interval: Duration::from_secs(64),
        max_elapsed_time: Some(retries_window),
        multiplier: 2.0,
        // no jitter, the elapsed cap admits exactly the configured retries
        randomization_factor: 0.0,
        ..ExponentialBackoff::default()
    };

    let sent_time = Instant::now();
    let response = retry(policy, || async {
        let mut request = http.get(&site.url);
        for (key, value) in &site.headers {
            request = request.header(key, value);
        }
        request
            .send()
            .await
            .with_context(|| format!("site monitoring GET {}", site.url))
            .map_err(backoff::Error::transient)
    })
    .await
    .map_err(|err| anyhow!("site request failed after retries: {err}"))?;

    engine
        .metrics
        .latency_sum(&site_latency_gauge_opt(), &site.name, sent_time.elapsed());

    if response.status().as_u16() != site.status_code {
        bail!(
            "response statusCode {} unmatch expected {}",
            response.status(),
            site.status_code
        );
    }
    Ok(())
}

/// One monitoring round for a site, reporting failures as incidents.
pub async fn test_site(engine: &Arc<Engine>, site: &SiteConfig) {
    if let Err(err) = monitor_site(engine, site).await {
        let err_msg = format!("site monitoring {} error: {err}", site.url);
        let title = format!("persisted {} endpoint failure", site.name);
        error!("{err_msg}");
        engine.incidents.chat().alert(&err_msg).await;
        engine
            .incidents
            .report_incident(&site.name, &site.name, &title, &err_msg, &site.alert_policy)
            .await;
    }
}
