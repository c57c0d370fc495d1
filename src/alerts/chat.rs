// Chat notification module
// Webhook notifier for sub-page-grade events with per-component
// silence windows to keep the channel quiet
//
// Numan Thabit 2025 Nov

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::error;

/// Message payload posted to the incoming-webhook URL.
#[derive(Debug, Serialize, Default)]
pub struct ChatMessage {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
}

#[derive(Debug, Clone, Copy)]
struct AlertVerbosity {
    last_alert_time: Instant,
    silence_window: Duration,
}

impl AlertVerbosity {
    /// Whether the silence window has expired since the last alert.
    fn must_alert(&self, now: Instant) -> bool {
        now.duration_since(self.last_alert_time) > self.silence_window
    }
}

/// Chat webhook notifier. A missing webhook URL degrades every call to
/// log-only.
pub struct ChatNotifier {
    webhook_url: String,
    verbose: bool,
    http: reqwest::Client,
    silenced: Mutex<HashMap<String, AlertVerbosity>>,
}

impl ChatNotifier {
    pub fn new(webhook_url: &str, verbose: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build HTTP client for chat webhook")?;
        Ok(Self {
            webhook_url: webhook_url.to_string(),
            verbose,
            http,
            silenced: Mutex::new(HashMap::new()),
        })
    }

    /// Notifies the chat channel. Failures to deliver are logged and
    /// swallowed, notification loss never alters probe state.
    pub async fn alert(&self, msg: &str) {
        error!("alert {msg}");
        if self.webhook_url.is_empty() {
            return;
        }
        if let Err(err) = self
            .send_webhook(ChatMessage {
                text: msg.to_string(),
                ..Default::default()
            })
            .await
        {
            error!(error = %err, "chat webhook delivery failed");
        }
    }

    /// Low-severity notification honoring a per-component silence window.
    /// A negative-like zero window or a recent alert suppresses the
    /// webhook call down to a log line.
    pub async fn verbose_alert(&self, component: &str, msg: &str, silence_window: Duration) {
        if self.verbose {
            self.alert(msg).await;
            return;
        }

        let suppressed = {
            let mut guard = self.silenced.lock().unwrap();
            let now = Instant::now();
            let previous = guard.insert(
                component.to_string(),
                AlertVerbosity {
                    last_alert_time: now,
                    silence_window,
                },
            );
            previous.map(|p| !p.must_alert(now)).unwrap_or(false)
        };

        if suppressed {
            error!("alert {msg}");
            return;
        }
        self.alert(msg).await;
    }

    async fn send_webhook(&self, msg: ChatMessage) -> Result<()> {
        let response = self
            .http
            .post(&self.webhook_url)
            .json(&msg)
            .send()
            .await
            .context("send chat webhook request")?;

        let body = response.text().await.context("read chat webhook response")?;
        if body != "ok" {
            bail!("non-ok response returned from chat webhook, message {body}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_webhook_is_log_only() {
        let chat = ChatNotifier::new("", false).unwrap();
        // must not panic or attempt network I/O
        chat.alert("unit test message").await;
        chat.verbose_alert("c1", "unit test message", Duration::from_secs(3600))
            .await;
    }

    #[test]
    fn silence_window_expiry() {
        let fresh = AlertVerbosity {
            last_alert_time: Instant::now(),
            silence_window: Duration::from_secs(3600),
        };
        assert!(!fresh.must_alert(Instant::now()));

        let now = Instant::now();
        let stale = AlertVerbosity {
            last_alert_time: now,
            silence_window: Duration::from_secs(1),
        };
        assert!(stale.must_alert(now + Duration::from_secs(2)));
    }
}
