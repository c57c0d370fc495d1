// Probe scheduling module
// One independent concurrent loop per probe target: a single immediate
// run and then ticker-driven repeats at the configured interval
//
// Numan Thabit 2025 Nov

use crate::alerts::analytics::EventKind;
use crate::alerts::pager;
use crate::config::duration_or;
use crate::engine::Engine;
use crate::metrics::heartbeat_counter_opt;
use crate::probes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

const UPTIME_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Spawns an independent loop that runs the closure once immediately and
/// then on every tick.
pub fn run_interval<F, Fut>(engine: Arc<Engine>, every: Duration, f: F)
where
    F: Fn(Arc<Engine>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            f(engine.clone()).await;
        }
    });
}

/// Wires up every configured probe loop. Loops are idempotent and never
/// propagate probe errors, their only outputs are side effects on the
/// shared engine state.
pub async fn start(engine: Arc<Engine>) {
    // orchestrator-level health, in-cluster mode only
    if let Err(err) = probes::orchestrator::monitor_k8s_cluster(engine.clone()).await {
        error!(error = %err, "orchestrator monitoring disabled");
    }

    if !engine.cfg.pulsar_admin_config.clusters.is_empty() {
        let interval = duration_or(engine.cfg.pulsar_admin_config.interval_seconds, 120);
        run_interval(engine.clone(), interval, |engine| async move {
            probes::admin::pulsar_tenants(engine).await;
        });
    }

    start_topic_loops(&engine);
    start_websocket_loops(&engine);
    start_site_loops(&engine);
    start_heartbeat_loops(&engine);

    crate::metrics::spawn_push_proxy_loop(&engine.cfg);
}

fn start_topic_loops(engine: &Arc<Engine>) {
    let test_broker = engine.cfg.brokers_config.broker_test_required || engine.cfg.k8s_config.enabled;
    info!(topics = engine.cfg.pulsar_topic_config.len(), "topic configuration");

    for topic_cfg in engine.cfg.pulsar_topic_config.clone() {
        let interval = duration_or(topic_cfg.interval_seconds, 60);
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            probes::pubsub::test_topic(&engine, &topic_cfg).await;
            loop {
                ticker.tick().await;
                if test_broker {
                    let broker_engine = engine.clone();
                    let broker_cfg = topic_cfg.clone();
                    tokio::spawn(async move {
                        probes::brokers::test_brokers(&broker_engine, &broker_cfg).await;
                    });
                }
                probes::pubsub::test_topic(&engine, &topic_cfg).await;
            }
        });
    }
}

fn start_websocket_loops(engine: &Arc<Engine>) {
    for ws_cfg in engine.cfg.web_socket_config.clone() {
        let interval = duration_or(ws_cfg.interval_seconds, 60);
        run_interval(engine.clone(), interval, move |engine| {
            let ws_cfg = ws_cfg.clone();
            async move {
                probes::websocket::test_ws_latency(&engine, &ws_cfg).await;
            }
        });
    }
}

fn start_site_loops(engine: &Arc<Engine>) {
    for site in engine.cfg.sites_config.sites.clone() {
        let interval = duration_or(site.interval_seconds, 120);
        run_interval(engine.clone(), interval, move |engine| {
            let site = site.clone();
            async move {
                probes::site::test_site(&engine, &site).await;
            }
        });
    }
}

fn start_heartbeat_loops(engine: &Arc<Engine>) {
    // heartbeat to the pager provider on its own interval
    let genie = engine.cfg.ops_genie_config.clone();
    if !genie.heartbeat_url.is_empty() && !genie.heartbeat_key.is_empty() {
        let interval = duration_or(genie.interval_seconds, 240);
        run_interval(engine.clone(), interval, move |engine| {
            let genie = genie.clone();
            async move {
                if let Err(err) = pager::heartbeat(&genie.heartbeat_url, &genie.heartbeat_key).await
                {
                    engine
                        .incidents
                        .chat()
                        .alert(&format!(
                            "from {} heartbeat provider error {err}",
                            engine.cfg.name
                        ))
                        .await;
                }
            }
        });
    }

    // fixed-interval uptime counter
    run_interval(
        engine.clone(),
        UPTIME_HEARTBEAT_INTERVAL,
        |engine| async move {
            engine
                .metrics
                .counter_inc(&heartbeat_counter_opt(), &engine.cfg.name);
            if let Some(analytics) = engine.incidents.analytics() {
                analytics.event(EventKind::Heartbeat, &engine.cfg.name);
            }
        },
    );
}
