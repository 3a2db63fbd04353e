//! Webhook notification delivery (§6.4, §4.7 `notify` route).
//!
//! Adapts the teacher's Telegram `Notifier` (builder constructor +
//! `disabled()` no-op mode + retrying HTTP POST) to a generic JSON
//! webhook instead of Telegram's `sendMessage` API.

use crate::error::{CoreError, Result};
use crate::model::NotifyPayload;
use reqwest::Client;
use std::time::Duration;

const BACKOFF_BASE_SEC: u64 = 1;

/// Posts [`NotifyPayload`] bodies to a configured webhook URL.
#[derive(Clone)]
pub struct WebhookNotifier {
    http: Client,
    webhook_url: Option<String>,
    retries: u32,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String, timeout_sec: u64, retries: u32) -> Self {
        Self {
            http: Client::builder()
                .timeout(Duration::from_secs(timeout_sec))
                .build()
                .unwrap_or_default(),
            webhook_url: Some(webhook_url),
            retries,
        }
    }

    /// No-op notifier for when `notify.webhook_url` is unset — mirrors the
    /// teacher's `Notifier::disabled` pattern so callers don't need to
    /// branch on configuration presence.
    pub fn disabled() -> Self {
        Self {
            http: Client::new(),
            webhook_url: None,
            retries: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Delivers `payload`, retrying transient failures with 1/2/4 s
    /// exponential backoff (§5). A non-2xx response or a timeout both
    /// count as a failed attempt.
    pub async fn send(&self, payload: &NotifyPayload) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!(event_id = %payload.event_id, "notifier disabled, skipping delivery");
            return Ok(());
        };

        let mut last_err = None;
        for attempt in 0..=self.retries {
            match self.http.post(url).json(payload).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    last_err = Some(CoreError::RouteTargetUnavailable(format!(
                        "webhook returned status {}",
                        resp.status()
                    )));
                }
                Err(e) => last_err = Some(CoreError::NotifyDeliveryFailed(e)),
            }

            if attempt < self.retries {
                let backoff = BACKOFF_BASE_SEC * 2u64.pow(attempt);
                tokio::time::sleep(Duration::from_secs(backoff)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::Internal("notify delivery failed with no recorded error".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EventType;
    use std::collections::BTreeSet;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> NotifyPayload {
        NotifyPayload {
            event_id: "fused_1_abc".to_string(),
            symbol: "ABC".to_string(),
            exchange: Some("binance".to_string()),
            event_type: EventType::Listing,
            raw_text: "ABC listing".to_string(),
            score: 60.0,
            confidence: 0.75,
            source_count: 2,
            is_super_event: true,
            sources: BTreeSet::new(),
            urls: Vec::new(),
            timestamp: 1_000,
            metadata: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_no_op() {
        let notifier = WebhookNotifier::disabled();
        assert!(!notifier.is_enabled());
        notifier.send(&payload()).await.unwrap();
    }

    #[tokio::test]
    async fn successful_post_returns_ok() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri()), 5, 1);
        notifier.send(&payload()).await.unwrap();
    }

    #[tokio::test]
    async fn non_2xx_response_is_retried_then_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(format!("{}/hook", server.uri()), 5, 1);
        let result = notifier.send(&payload()).await;
        assert!(result.is_err());
    }
}
