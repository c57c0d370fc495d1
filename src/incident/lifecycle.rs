// Incident lifecycle module
// Creates, asynchronously resolves identifiers for, and closes incidents
// at the configured pager providers, maintaining the open-incident registry
//
// Numan Thabit 2025 Nov

use crate::alerts::{AnalyticsClient, ChatNotifier, EventsClient, Incident, PagerClient};
use crate::alerts::analytics::EventKind;
use crate::config::AlertPolicy;
use crate::incident::tracker::TrackerRegistry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::RwLock;
use tracing::{error, info};

/// Provider-side state for one open incident.
#[derive(Debug, Clone)]
pub struct IncidentRecord {
    pub request_id: String,
    pub alert_id: String,
    pub created_at: SystemTime,
}

/// How many distinct components must fail close together before the
/// correlation rule pages on its own.
const CORRELATED_COMPONENTS: usize = 3;

/// Look-back horizon for the correlation rule.
const CORRELATION_WINDOW: Duration = Duration::from_secs(60);

/// Total time allowed for the asynchronous alert-id lookup.
const ALERT_ID_RESOLVE_TIMEOUT: Duration = Duration::from_secs(4);

/// Drives the incident lifecycle: tracker consultation, alert creation
/// with async identifier resolution, deduplication through the
/// open-incident registry, and clearing.
pub struct IncidentManager {
    trackers: TrackerRegistry,
    open: Arc<RwLock<HashMap<String, IncidentRecord>>>,
    pager: Option<Arc<PagerClient>>,
    events: Option<EventsClient>,
    chat: Arc<ChatNotifier>,
    analytics: Option<AnalyticsClient>,
    /// in-cluster mode enables the cross-component correlation rule
    in_cluster: bool,
}

impl IncidentManager {
    pub fn new(
        pager: Option<PagerClient>,
        events: Option<EventsClient>,
        chat: ChatNotifier,
        analytics: Option<AnalyticsClient>,
        in_cluster: bool,
    ) -> Self {
        Self {
            trackers: TrackerRegistry::new(),
            open: Arc::new(RwLock::new(HashMap::new())),
            pager: pager.map(Arc::new),
            events,
            chat: Arc::new(chat),
            analytics,
            in_cluster,
        }
    }

    pub fn chat(&self) -> &ChatNotifier {
        &self.chat
    }

    pub fn analytics(&self) -> Option<&AnalyticsClient> {
        self.analytics.as_ref()
    }

    /// Reports one probe failure. Returns true when an incident was
    /// created at the providers.
    pub async fn report_incident(
        &self,
        component: &str,
        alias: &str,
        msg: &str,
        desc: &str,
        policy: &AlertPolicy,
    ) -> bool {
        if policy.ceiling > 0 || policy.ceiling_in_moving_window > 0 {
            let outcome = self.trackers.track(component, policy);
            if outcome.escalate {
                self.create_incident(component, alias, msg, desc, crate::alerts::DEFAULT_PRIORITY)
                    .await;
                return true;
            }
            if outcome.pre_alert {
                self.chat
                    .verbose_alert(component, msg, Duration::from_secs(3600))
                    .await;
            }
        }

        // many small failures at once form their own incident class
        if self.in_cluster
            && self.trackers.len() > CORRELATED_COMPONENTS - 1
            && self.trackers.recently_active(CORRELATION_WINDOW) > CORRELATED_COMPONENTS - 1
        {
            self.create_incident(component, alias, msg, desc, crate::alerts::DEFAULT_PRIORITY)
                .await;
            return true;
        }
        false
    }

    /// Creates the incident at every configured provider and records it
    /// in the open-incident registry.
    pub async fn create_incident(
        &self,
        component: &str,
        alias: &str,
        msg: &str,
        desc: &str,
        priority: &str,
    ) {
        self.chat
            .alert(&format!(
                "report incident as pager escalation, component {component}, alias {alias}, message {msg}, description {desc}"
            ))
            .await;
        if let Some(analytics) = &self.analytics {
            analytics.event(EventKind::IncidentCreated, component);
        }

        if let Some(pager) = &self.pager {
            let incident = Incident::new(component, alias, msg, desc, priority);
            match pager.create_alert(&incident).await {
                Ok(request_id) => {
                    let record = IncidentRecord {
                        request_id: request_id.clone(),
                        alert_id: String::new(),
                        created_at: SystemTime::now(),
                    };
                    {
                        let mut guard = self.open.write().await;
                        guard.insert(component.to_string(), record);
                    }
                    // the provider assigns the stable id with a delay,
                    // resolve it off the probe path
                    spawn_alert_id_resolver(
                        pager.clone(),
                        self.open.clone(),
                        component.to_string(),
                        request_id,
                    );
                }
                Err(err) => {
                    self.chat
                        .alert(&format!("from {component} pager report incident error {err}"))
                        .await;
                }
            }
        }

        if let Some(events) = &self.events {
            if let Err(err) = events.trigger(component, alias, msg).await {
                self.chat
                    .alert(&format!("from {component} events provider report incident error {err}"))
                    .await;
            }
        }
    }

    /// Clears an open incident for the component and reverses one tracker
    /// count. A component with no open record is a registry no-op.
    pub async fn clear_incident(&self, component: &str) {
        self.remove_incident(component).await;
        self.trackers.clear(component);
    }

    async fn remove_incident(&self, component: &str) {
        let record = {
            let mut guard = self.open.write().await;
            guard.remove(component)
        };

        let Some(record) = record else {
            return;
        };

        if let Some(analytics) = &self.analytics {
            analytics.event(EventKind::IncidentCleared, component);
        }

        if record.alert_id.is_empty() {
            error!(
                component,
                request_id = %record.request_id,
                "unable to identify alert for auto clear operation"
            );
        } else {
            info!(component, alert_id = %record.alert_id, "auto resolve alert");
            if let Some(pager) = &self.pager {
                if let Err(err) = pager.close_alert(component, &record.alert_id).await {
                    self.chat
                        .alert(&format!("from {component} pager remove incident error {err}"))
                        .await;
                }
            }
        }

        if let Some(events) = &self.events {
            if let Err(err) = events.resolve(component, component).await {
                error!(component, error = %err, "events provider resolve failed");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn open_registry(&self) -> Arc<RwLock<HashMap<String, IncidentRecord>>> {
        self.open.clone()
    }
}

/// Looks up the stable alert id with exponential backoff, 200ms doubling,
/// for at most four seconds, then stores it exactly once.
fn spawn_alert_id_resolver(
    pager: Arc<PagerClient>,
    open: Arc<RwLock<HashMap<String, IncidentRecord>>>,
    entity: String,
    request_id: String,
) {
    tokio::spawn(async move {
        let start = Instant::now();
        let mut wait = Duration::from_millis(200);
        while start.elapsed() < ALERT_ID_RESOLVE_TIMEOUT {
            tokio::time::sleep(wait).await;
            match pager.alert_id(&request_id).await {
                Ok(alert_id) => {
                    store_alert_id(&open, &entity, &alert_id).await;
                    return;
                }
                Err(_) => wait *= 2,
            }
        }
        error!(entity = %entity, request_id = %request_id, "unable to find alert for request id");
    });
}

/// Stores the resolved alert id on the open record. A record that was
/// cleared in the meantime, or that already carries an id, is left alone.
async fn store_alert_id(
    open: &Arc<RwLock<HashMap<String, IncidentRecord>>>,
    entity: &str,
    alert_id: &str,
) {
    let mut guard = open.write().await;
    if let Some(record) = guard.get_mut(entity) {
        if record.alert_id.is_empty() {
            record.alert_id = alert_id.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::ChatNotifier;

    fn manager() -> IncidentManager {
        IncidentManager::new(
            None,
            None,
            ChatNotifier::new("", false).unwrap(),
            None,
            false,
        )
    }

    #[tokio::test]
    async fn clear_without_open_record_is_noop() {
        let mgr = manager();
        mgr.clear_incident("c1").await;
        assert!(mgr.open_registry().read().await.is_empty());
    }

    #[tokio::test]
    async fn alert_id_stored_exactly_once() {
        let mgr = manager();
        let open = mgr.open_registry();
        {
            let mut guard = open.write().await;
            guard.insert(
                "c1".to_string(),
                IncidentRecord {
                    request_id: "req-1".to_string(),
                    alert_id: String::new(),
                    created_at: SystemTime::now(),
                },
            );
        }

        store_alert_id(&open, "c1", "alert-first").await;
        store_alert_id(&open, "c1", "alert-second").await;

        let guard = open.read().await;
        assert_eq!(guard.get("c1").unwrap().alert_id, "alert-first");
    }

    #[tokio::test]
    async fn resolver_skips_cleared_records() {
        let mgr = manager();
        let open = mgr.open_registry();
        store_alert_id(&open, "ghost", "alert-x").await;
        assert!(open.read().await.get("ghost").is_none());
    }

    #[tokio::test]
    async fn report_without_thresholds_never_escalates() {
        let mgr = manager();
        let policy = AlertPolicy::default();
        for _ in 0..50 {
            let created = mgr
                .report_incident("c1", "c1", "message", "description", &policy)
                .await;
            assert!(!created);
        }
    }

    #[tokio::test]
    async fn ceiling_escalation_creates_once() {
        let mgr = manager();
        let policy = AlertPolicy {
            ceiling: 3,
            moving_window_seconds: 0,
            ceiling_in_moving_window: 0,
        };
        assert!(!mgr.report_incident("k", "k", "m", "d", &policy).await);
        assert!(!mgr.report_incident("k", "k", "m", "d", &policy).await);
        assert!(mgr.report_incident("k", "k", "m", "d", &policy).await);
        assert!(!mgr.report_incident("k", "k", "m", "d", &policy).await);
    }
}
