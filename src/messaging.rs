// Messaging client module
// Process-wide cache of Pulsar clients keyed by broker URL, with
// eviction on handshake failure so broken sessions rebuild from scratch
//
// Numan Thabit 2025 Nov

use anyhow::{Context, Result};
use pulsar::{Authentication, Pulsar, TokioExecutor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

const TLS_SCHEME_PREFIX: &str = "pulsar+ssl://";

/// Cache of messaging clients shared across probes for the same broker
/// URL. Creation is lazy, eviction is explicit.
pub struct ClientCache {
    clients: RwLock<HashMap<String, Arc<Pulsar<TokioExecutor>>>>,
    trust_store: String,
}

impl ClientCache {
    pub fn new(trust_store: &str) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            trust_store: trust_store.to_string(),
        }
    }

    /// Returns the cached client for the broker URL, creating one on
    /// first use. The token is whatever the source produced for this
    /// call, so a rebuilt client always authenticates with fresh
    /// credentials.
    pub async fn get(&self, pulsar_url: &str, token: Option<String>) -> Result<Arc<Pulsar<TokioExecutor>>> {
        {
            let guard = self.clients.read().await;
            if let Some(client) = guard.get(pulsar_url) {
                return Ok(client.clone());
            }
        }

        let mut builder = Pulsar::builder(pulsar_url, TokioExecutor);
        if let Some(token) = token {
            builder = builder.with_auth(Authentication {
                name: "token".to_string(),
                data: token.into_bytes(),
            });
        }

        if pulsar_url.starts_with(TLS_SCHEME_PREFIX) {
            if self.trust_store.is_empty() {
                warn!("missing trustStore while pulsar+ssl tls is enabled");
            } else {
                builder = builder
                    .with_certificate_chain_file(&self.trust_store)
                    .with_context(|| {
                        format!("load trust store certificate {}", self.trust_store)
                    })?;
            }
        }

        let client = Arc::new(
            builder
                .build()
                .await
                .with_context(|| format!("create messaging client for {pulsar_url}"))?,
        );

        let mut guard = self.clients.write().await;
        let entry = guard
            .entry(pulsar_url.to_string())
            .or_insert_with(|| client.clone());
        Ok(entry.clone())
    }

    /// Drops the cached client so the next call rebuilds it. Recovers
    /// from broker-side session invalidation.
    pub async fn evict(&self, pulsar_url: &str) {
        let mut guard = self.clients.write().await;
        if guard.remove(pulsar_url).is_some() {
            info!(url = pulsar_url, "evicted cached messaging client");
        }
    }
}
