// Admin REST probe module
// Calls the tenants endpoint on each configured cluster and exports the
// tenant count as an availability signal
//
// Numan Thabit 2025 Nov

use crate::config::TokenSource;
use crate::engine::Engine;
use crate::metrics::tenants_gauge_opt;
use anyhow::{anyhow, Context, Result};
use backoff::{future::retry, ExponentialBackoff};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use url::Url;

/// Probes the tenants endpoint and returns the number of tenants on the
/// cluster. Retries twice with exponential waits bounded [4s, 64s].
pub async fn pulsar_admin_tenants(
    engine: &Engine,
    cluster_url: &str,
    token: &TokenSource,
) -> Result<usize> {
    let policy = ExponentialBackoff {
        initial_interval: Duration::from_secs(4),
        max_interval: Duration::from_secs(64),
        max_elapsed_time: Some(Duration::from_secs(13)),
        multiplier: 2.0,
        // no jitter, two deterministic retries at 4s and 8s
        randomization_factor: 0.0,
        ..ExponentialBackoff::default()
    };

    let tenants: Vec<String> = retry(policy, || async {
        let response = engine
            .admin_get(cluster_url, token)
            .await
            .map_err(backoff::Error::transient)?;
        if !response.status().is_success() {
            return Err(backoff::Error::transient(anyhow!(
                "tenants endpoint {cluster_url} returned status code {}",
                response.status()
            )));
        }
        response
            .json::<Vec<String>>()
            .await
            .context("decode tenants list")
            .map_err(backoff::Error::transient)
    })
    .await
    .map_err(|err| anyhow!("tenants query failed after retries: {err}"))?;

    Ok(tenants.len())
}

/// Sweeps the tenants endpoint of every configured cluster, exporting
/// counts and escalating persisted failures.
pub async fn pulsar_tenants(engine: Arc<Engine>) {
    let clusters = engine.cfg.pulsar_admin_config.clusters.clone();
    let token = engine
        .token
        .with_override(&engine.cfg.pulsar_admin_config.token);

    for cluster in &clusters {
        let cluster_name = match Url::parse(&cluster.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
        {
            Some(host) => host,
            None => {
                error!(url = %cluster.url, "invalid cluster URL in admin REST config");
                continue;
            }
        };
        let query_url = crate::util::single_slash_join(&cluster.url, "/admin/v2/tenants");

        match pulsar_admin_tenants(&engine, &query_url, &token).await {
            Err(err) => {
                let err_msg = format!("tenant-test failed on cluster {query_url} error: {err}");
                error!("{cluster_name}-pulsar-admin {err_msg}");
                engine
                    .incidents
                    .report_incident(
                        &cluster.name,
                        &cluster_name,
                        "persisted cluster tenants test failure",
                        &err_msg,
                        &cluster.alert_policy,
                    )
                    .await;
            }
            Ok(tenant_size) => {
                engine
                    .metrics
                    .gauge_int(&tenants_gauge_opt(), &cluster.name, tenant_size as i64);
                engine.incidents.clear_incident(&cluster.name).await;
                if tenant_size == 0 {
                    error!(cluster = %cluster.name, "pulsar-admin has incorrect number of tenants 0");
                } else {
                    info!(cluster = %cluster_name, tenants = tenant_size, "tenants query passed");
                }
            }
        }
    }
}

