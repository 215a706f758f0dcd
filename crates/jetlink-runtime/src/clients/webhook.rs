//! n8n workflow webhook, the primary tier.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use jetlink_core::{IntegrationError, WebhookPayload};

use super::http::{map_reqwest_error, truncate_body};
use super::{PrimaryRequest, PrimaryService};
use crate::config::WebhookConfig;

const SERVICE: &str = "n8n";
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct N8nWebhook {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    source: String,
}

impl std::fmt::Debug for N8nWebhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("N8nWebhook")
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl N8nWebhook {
    pub fn new(config: &WebhookConfig) -> Result<Self, IntegrationError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| IntegrationError::NotConfigured(format!("webhook HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url: config.url.clone(),
            timeout: config.timeout,
            source: config.source.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Request body sent to the workflow.
    ///
    /// `sessionId` and `id` duplicate the context fields for workflows that
    /// read them from the top level.
    fn payload(&self, request: &PrimaryRequest) -> JsonValue {
        json!({
            "prompt": request.query,
            "message": request.query,
            "sessionId": request.session_id,
            "id": request.request_id,
            "context": {
                "source": self.source,
                "mode": request.mode,
                "timestamp": Utc::now().to_rfc3339(),
                "session_id": request.session_id,
                "request_id": request.request_id,
            }
        })
    }
}

#[async_trait]
impl PrimaryService for N8nWebhook {
    fn name(&self) -> &str {
        SERVICE
    }

    async fn send(&self, request: &PrimaryRequest) -> Result<WebhookPayload, IntegrationError> {
        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&self.payload(request))
            .send()
            .await
            .map_err(|e| map_reqwest_error(SERVICE, self.timeout, e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(SERVICE, self.timeout, e))?;

        if !status.is_success() {
            return Err(IntegrationError::UpstreamRejected {
                service: SERVICE.to_string(),
                status: status.as_u16(),
                message: truncate_body(&body),
            });
        }

        let payload = WebhookPayload::from_body(&body);
        if payload.is_empty() {
            return Err(IntegrationError::Parse {
                service: SERVICE.to_string(),
                message: "empty response; is the workflow active?".to_string(),
            });
        }
        Ok(payload)
    }

    /// Reachable if the webhook host answers below 500. POST-only webhooks
    /// answer a GET with 404, which still proves the backend is up.
    async fn probe(&self) -> bool {
        match self.client.get(&self.url).timeout(PROBE_TIMEOUT).send().await {
            Ok(response) => !response.status().is_server_error(),
            Err(e) => {
                tracing::debug!(service = SERVICE, error = %e, "Webhook probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::testing::reply_once;

    fn webhook(url: &str) -> N8nWebhook {
        N8nWebhook::new(&WebhookConfig {
            url: url.to_string(),
            timeout: Duration::from_secs(2),
            source: "jetvision-agent".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_payload_shape() {
        let hook = webhook("http://localhost:5678/webhook/jetvision-agent");
        let request = PrimaryRequest::new("Find CEOs", "req_abc").with_session("session_1");
        let payload = hook.payload(&request);

        assert_eq!(payload["prompt"], "Find CEOs");
        assert_eq!(payload["message"], "Find CEOs");
        assert_eq!(payload["sessionId"], "session_1");
        assert_eq!(payload["id"], "req_abc");
        assert_eq!(payload["context"]["source"], "jetvision-agent");
        assert_eq!(payload["context"]["mode"], "chat");
        assert_eq!(payload["context"]["request_id"], "req_abc");
        assert!(payload["context"]["timestamp"].is_string());
    }

    #[test]
    fn test_default_session_derived_from_request() {
        let request = PrimaryRequest::new("hi", "req_123");
        assert_eq!(request.session_id, "session_123");
    }

    #[tokio::test]
    async fn test_unreachable_webhook() {
        let hook = webhook("http://127.0.0.1:1/webhook/test");
        assert!(!hook.probe().await);

        let err = hook.send(&PrimaryRequest::new("hi", "req_1")).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_server_error_keeps_status_and_body() {
        let base = reply_once("500 Internal Server Error", r#"{"message":"Workflow could not be started"}"#).await;
        let hook = webhook(&format!("{}/webhook/jetvision-agent", base));

        let err = hook.send(&PrimaryRequest::new("hi", "req_1")).await.unwrap_err();
        match &err {
            IntegrationError::UpstreamRejected { service, status, message } => {
                assert_eq!(service, "n8n");
                assert_eq!(*status, 500);
                assert!(message.contains("could not be started"));
            }
            other => panic!("expected UpstreamRejected, got {:?}", other),
        }
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_object_is_inactive_workflow() {
        let base = reply_once("200 OK", "{}").await;
        let hook = webhook(&format!("{}/webhook/jetvision-agent", base));

        let err = hook.send(&PrimaryRequest::new("hi", "req_1")).await.unwrap_err();
        match err {
            IntegrationError::Parse { message, .. } => assert!(message.contains("workflow active")),
            other => panic!("expected Parse, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_message_payload_accepted() {
        let base = reply_once("200 OK", r#"{"message":"3 jets available"}"#).await;
        let hook = webhook(&format!("{}/webhook/jetvision-agent", base));

        let payload = hook.send(&PrimaryRequest::new("hi", "req_1")).await.unwrap();
        assert_eq!(payload.format(), "3 jets available");
    }
}
