// Orchestrator probe module
// Reads declared and ready replica counts for the cluster's workload
// kinds in the monitored namespace and classifies overall health
//
// Numan Thabit 2025 Nov

use crate::engine::Engine;
use crate::metrics::{
    offline_pods_counter, K8S_BOOKKEEPER_SUBSYSTEM, K8S_BROKER_SUBSYSTEM, K8S_PROXY_SUBSYSTEM,
    K8S_ZOOKEEPER_SUBSYSTEM,
};
use anyhow::{Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Default namespace hosting the cluster workloads.
pub const DEFAULT_NAMESPACE: &str = "pulsar";

const ZOOKEEPER_COMPONENT: &str = "zookeeper";
const BOOKKEEPER_COMPONENT: &str = "bookkeeper";
const BROKER_COMPONENT: &str = "broker";
const PROXY_COMPONENT: &str = "proxy";

const MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// High level cluster health, most severe wins when combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClusterStatus {
    Ok,
    PartialReady,
    TotalDown,
}

impl ClusterStatus {
    fn combine(self, other: ClusterStatus) -> ClusterStatus {
        self.max(other)
    }
}

/// Declared versus ready counts for one workload kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct Workload {
    pub replicas: i32,
    pub instances: i32,
}

impl Workload {
    pub fn offline(&self) -> i32 {
        (self.replicas - self.instances).max(0)
    }
}

/// Health snapshot across the known workload kinds.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterSnapshot {
    pub zookeeper: Workload,
    pub bookkeeper: Workload,
    pub broker: Workload,
    pub proxy: Workload,
}

impl ClusterSnapshot {
    /// Classifies the snapshot by the per-kind rules and combines with
    /// most-severe-wins.
    pub fn eval_health(&self) -> (String, ClusterStatus) {
        let mut health = String::new();
        let mut status = ClusterStatus::Ok;

        if self.zookeeper.instances < 2 {
            let _ = write!(
                health,
                "\ncluster error - zookeeper is running {} instances out of {} replicas",
                self.zookeeper.instances, self.zookeeper.replicas
            );
            status = status.combine(ClusterStatus::TotalDown);
        } else if self.zookeeper.instances == 2 && self.zookeeper.replicas > 2 {
            let _ = write!(health, "\ncluster warning - zookeeper is running only 2 instances");
            status = status.combine(ClusterStatus::PartialReady);
        }

        if self.bookkeeper.instances < 2 {
            let _ = write!(
                health,
                "\ncluster error - bookkeeper is running {} instances out of {} replicas",
                self.bookkeeper.instances, self.bookkeeper.replicas
            );
            status = status.combine(ClusterStatus::TotalDown);
        } else if self.bookkeeper.instances != self.bookkeeper.replicas {
            let _ = write!(
                health,
                "\ncluster warning - bookkeeper is running {} instances out of {}",
                self.bookkeeper.instances, self.bookkeeper.replicas
            );
            status = status.combine(ClusterStatus::PartialReady);
        }

        if self.broker.instances == 0 {
            let _ = write!(
                health,
                "\ncluster error - broker has no running instances out of {} replicas",
                self.broker.replicas
            );
            status = status.combine(ClusterStatus::TotalDown);
        } else if self.broker.instances < self.broker.replicas {
            let _ = write!(
                health,
                "\ncluster warning - broker is running {} instances out of {}",
                self.broker.instances, self.broker.replicas
            );
            status = status.combine(ClusterStatus::PartialReady);
        }

        if self.proxy.replicas > 0 && self.proxy.instances == 0 {
            let _ = write!(
                health,
                "\ncluster error - proxy has no running instances out of {} replicas",
                self.proxy.replicas
            );
            status = status.combine(ClusterStatus::TotalDown);
        } else if self.proxy.instances < self.proxy.replicas {
            let _ = write!(
                health,
                "\ncluster warning - proxy is running {} instances out of {}",
                self.proxy.instances, self.proxy.replicas
            );
            status = status.combine(ClusterStatus::PartialReady);
        }

        (health, status)
    }
}

/// Orchestrator API client scoped to the monitored namespace.
pub struct K8sMonitor {
    client: kube::Client,
    namespace: String,
}

impl K8sMonitor {
    pub async fn new(namespace: &str) -> Result<Self> {
        let client = kube::Client::try_default()
            .await
            .context("build orchestrator client from environment")?;
        Ok(Self {
            client,
            namespace: namespace.to_string(),
        })
    }

    fn component_params(component: &str) -> ListParams {
        ListParams::default().labels(&format!("component={component}"))
    }

    async fn deployment_replicas(&self, component: &str) -> Result<i32> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api
            .list(&Self::component_params(component))
            .await
            .with_context(|| format!("list {component} deployments"))?;
        Ok(list
            .items
            .iter()
            .filter_map(|d| d.spec.as_ref().and_then(|s| s.replicas))
            .sum())
    }

    async fn statefulset_replicas(&self, component: &str) -> Result<i32> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &self.namespace);
        let list = api
            .list(&Self::component_params(component))
            .await
            .with_context(|| format!("list {component} statefulsets"))?;
        Ok(list
            .items
            .iter()
            .filter_map(|s| s.spec.as_ref().and_then(|s| s.replicas))
            .sum())
    }

    /// Ready container count across the component's pods.
    async fn ready_pod_counts(&self, component: &str) -> Result<i32> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let pods = api
            .list(&Self::component_params(component))
            .await
            .with_context(|| format!("list {component} pods"))?;

        let mut counts = 0;
        for pod in pods.items {
            let statuses = pod
                .status
                .and_then(|s| s.container_statuses)
                .unwrap_or_default();
            counts += statuses.iter().filter(|s| s.ready).count() as i32;
        }
        Ok(counts)
    }

    /// One full observation of declared and ready counts per kind. The
    /// broker kind is deployed as a deployment in some installations and
    /// a statefulset in others, both flavors count.
    pub async fn observe(&self) -> Result<ClusterSnapshot> {
        let mut snapshot = ClusterSnapshot::default();

        snapshot.zookeeper.replicas = self.statefulset_replicas(ZOOKEEPER_COMPONENT).await?;
        snapshot.bookkeeper.replicas = self.statefulset_replicas(BOOKKEEPER_COMPONENT).await?;
        snapshot.broker.replicas = self.deployment_replicas(BROKER_COMPONENT).await?
            + self.statefulset_replicas(BROKER_COMPONENT).await?;
        snapshot.proxy.replicas = self.deployment_replicas(PROXY_COMPONENT).await?;

        snapshot.zookeeper.instances = self.ready_pod_counts(ZOOKEEPER_COMPONENT).await?;
        snapshot.bookkeeper.instances = self.ready_pod_counts(BOOKKEEPER_COMPONENT).await?;
        snapshot.broker.instances = self.ready_pod_counts(BROKER_COMPONENT).await?;
        snapshot.proxy.instances = self.ready_pod_counts(PROXY_COMPONENT).await?;

        Ok(snapshot)
    }
}

/// Evaluates and reports the orchestrator-level cluster health once.
pub async fn evaluate_cluster_health(engine: &Arc<Engine>, monitor: &K8sMonitor) -> Result<()> {
    let cluster = format!("{}-in-cluster", engine.cfg.name);
    let snapshot = monitor.observe().await?;
    let (desc, status) = snapshot.eval_health();

    engine.metrics.gauge_int(
        &offline_pods_counter(K8S_ZOOKEEPER_SUBSYSTEM),
        &cluster,
        snapshot.zookeeper.offline() as i64,
    );
    engine.metrics.gauge_int(
        &offline_pods_counter(K8S_BOOKKEEPER_SUBSYSTEM),
        &cluster,
        snapshot.bookkeeper.offline() as i64,
    );
    engine.metrics.gauge_int(
        &offline_pods_counter(K8S_BROKER_SUBSYSTEM),
        &cluster,
        snapshot.broker.offline() as i64,
    );
    engine.metrics.gauge_int(
        &offline_pods_counter(K8S_PROXY_SUBSYSTEM),
        &cluster,
        snapshot.proxy.offline() as i64,
    );

    match status {
        ClusterStatus::Ok => {
            engine.incidents.clear_incident(&cluster).await;
        }
        ClusterStatus::PartialReady => {
            error!(cluster = %cluster, desc = %desc, "k8s pulsar cluster is partially ready");
        }
        ClusterStatus::TotalDown => {
            let err_msg =
                format!("cluster {cluster}, k8s pulsar cluster status is unhealthy, error message {desc}");
            engine
                .incidents
                .chat()
                .verbose_alert(&cluster, &err_msg, Duration::from_secs(180))
                .await;
            engine
                .incidents
                .report_incident(
                    &cluster,
                    &cluster,
                    "kubernetes cluster is down, reported by pulsar-sentinel",
                    &err_msg,
                    &engine.cfg.k8s_config.alert_policy,
                )
                .await;
        }
    }
    info!(status = ?status, "k8s cluster status");
    Ok(())
}

/// Starts the in-cluster orchestrator monitoring loop when enabled.
pub async fn monitor_k8s_cluster(engine: Arc<Engine>) -> Result<()> {
    if !engine.cfg.k8s_config.enabled {
        return Ok(());
    }

    let namespace = crate::util::first_non_empty(&[
        &engine.cfg.k8s_config.pulsar_namespace,
        DEFAULT_NAMESPACE,
    ])
    .to_string();
    let monitor = K8sMonitor::new(&namespace).await.map_err(|err| {
        error!(error = %err, "failed to get k8s clientset for the pulsar namespace");
        err
    })?;

    tokio::spawn(async move {
        info!("start k8s cluster monitoring ...");
        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = evaluate_cluster_health(&engine, &monitor).await {
                error!(error = %err, "k8s monitoring failed to watch pods");
            }
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(zk: (i32, i32), bk: (i32, i32), broker: (i32, i32), proxy: (i32, i32)) -> ClusterSnapshot {
        ClusterSnapshot {
            zookeeper: Workload { replicas: zk.0, instances: zk.1 },
            bookkeeper: Workload { replicas: bk.0, instances: bk.1 },
            broker: Workload { replicas: broker.0, instances: broker.1 },
            proxy: Workload { replicas: proxy.0, instances: proxy.1 },
        }
    }

    #[test]
    fn healthy_cluster_is_ok() {
        let (desc, status) = snapshot((3, 3), (3, 3), (2, 2), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::Ok);
        assert!(desc.is_empty());
    }

    #[test]
    fn zookeeper_below_two_is_total_down() {
        let (_, status) = snapshot((3, 1), (3, 3), (2, 2), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::TotalDown);
    }

    #[test]
    fn zookeeper_at_two_of_three_is_partial() {
        let (_, status) = snapshot((3, 2), (3, 3), (2, 2), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::PartialReady);
    }

    #[test]
    fn bookkeeper_short_is_partial() {
        let (_, status) = snapshot((3, 3), (4, 3), (2, 2), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::PartialReady);
    }

    #[test]
    fn no_brokers_is_total_down() {
        let (_, status) = snapshot((3, 3), (3, 3), (2, 0), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::TotalDown);
    }

    #[test]
    fn missing_proxy_declared_zero_is_ok() {
        // proxies not deployed at all must not fail the cluster
        let (_, status) = snapshot((3, 3), (3, 3), (2, 2), (0, 0)).eval_health();
        assert_eq!(status, ClusterStatus::Ok);
    }

    #[test]
    fn most_severe_status_wins() {
        // a later healthy check must not mask an earlier total-down
        let (_, status) = snapshot((3, 1), (3, 3), (2, 2), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::TotalDown);
        let (_, status) = snapshot((3, 2), (3, 3), (2, 0), (2, 2)).eval_health();
        assert_eq!(status, ClusterStatus::TotalDown);
    }

    #[test]
    fn offline_counts_clamp_at_zero() {
        let w = Workload { replicas: 2, instances: 3 };
        assert_eq!(w.offline(), 0);
        let w = Workload { replicas: 5, instances: 3 };
        assert_eq!(w.offline(), 2);
    }
}
