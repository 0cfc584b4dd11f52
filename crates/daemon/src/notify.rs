use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

/// Role that receives backup success and failure broadcasts.
pub const ADMIN_ROLE: &str = "admin";
pub const EVENT_BACKUP_COMPLETED: &str = "backup_completed";
pub const EVENT_BACKUP_FAILED: &str = "backup_failed";

/// Fan-out of events to every subscriber holding a role. Delivery problems are the
/// notifier's own concern and never reach the caller.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_role(&self, role: &str, event: &str, payload: Value);
}

/// Writes notifications to the log only.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait::async_trait]
impl Notifier for LogNotifier {
    async fn notify_role(&self, role: &str, event: &str, payload: Value) {
        info!(role, event, %payload, "notification");
    }
}

#[derive(Debug, Serialize)]
struct WebhookBody<'a> {
    role: &'a str,
    event: &'a str,
    payload: Value,
}

/// POSTs each notification as JSON to a webhook endpoint.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_role(&self, role: &str, event: &str, payload: Value) {
        let body = WebhookBody {
            role,
            event,
            payload,
        };
        match self.client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(url = %self.url, status = %resp.status(), event, "webhook rejected notification"),
            Err(e) => warn!(url = %self.url, error = %e, event, "webhook delivery failed"),
        }
    }
}
