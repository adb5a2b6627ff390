//! Notification gateways
//!
//! `WebhookGateway` posts each notification as JSON; `LogGateway` only logs,
//! for deployments without a webhook.

use crate::runtime::{
    DeliveryError, NotificationGateway, BOOTSTRAP_BACKUP_TAG, BOOTSTRAP_TAG, INTAKE_TAG,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

/// Subject line for a recipient tag
pub fn subject_for(recipient_tag: &str) -> &'static str {
    match recipient_tag {
        INTAKE_TAG => "Nuevo paciente registrado",
        BOOTSTRAP_TAG | BOOTSTRAP_BACKUP_TAG => "Código de vinculación de sesión",
        _ => "Notificación del asistente",
    }
}

#[derive(Debug, Serialize)]
struct NotificationPayload<'a> {
    recipient_tag: &'a str,
    subject: &'a str,
    body: &'a str,
    sent_at: DateTime<Utc>,
}

pub struct WebhookGateway {
    client: Client,
    url: String,
}

impl WebhookGateway {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl NotificationGateway for WebhookGateway {
    async fn notify(&self, recipient_tag: &str, body: &str) -> Result<(), DeliveryError> {
        let payload = NotificationPayload {
            recipient_tag,
            subject: subject_for(recipient_tag),
            body,
            sent_at: Utc::now(),
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::notification(format!("webhook timeout: {e}"))
                } else if e.is_connect() {
                    DeliveryError::notification(format!("webhook unreachable: {e}"))
                } else {
                    DeliveryError::notification(format!("webhook request failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(DeliveryError::notification(format!(
                "webhook answered HTTP {status}: {text}"
            )));
        }

        tracing::debug!(recipient_tag, status = %status, "Notification posted");
        Ok(())
    }
}

/// Writes notifications to the log and reports success
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn notify(&self, recipient_tag: &str, body: &str) -> Result<(), DeliveryError> {
        tracing::info!(
            recipient_tag,
            subject = subject_for(recipient_tag),
            body,
            "Notification (no webhook configured)"
        );
        Ok(())
    }
}
