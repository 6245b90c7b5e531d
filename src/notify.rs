//! Outbound email. Delivery is best effort: callers log a `DeliveryError`
//! and carry on, the account change it reports on is already committed.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("email delivery failed: {0}")]
    Failed(String),

    #[error("email delivery timed out")]
    Timeout,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        template: &str,
        data: Value,
    ) -> Result<(), DeliveryError>;
}

/// Development sender: writes the message to the log instead of a mailbox.
/// Payloads carry verification codes and reset tokens, so they are only
/// logged when `reveal_payload` is set.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier {
    reveal_payload: bool,
}

impl LogNotifier {
    pub fn new(reveal_payload: bool) -> Self {
        Self { reveal_payload }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_email(
        &self,
        to: &str,
        subject: &str,
        template: &str,
        data: Value,
    ) -> Result<(), DeliveryError> {
        info!(to, subject, template, "email send stub");
        if self.reveal_payload {
            debug!(to, template, payload = %data, "email payload");
        }
        Ok(())
    }
}

/// Send with a deadline and swallow any failure after logging it.
pub async fn deliver(
    notifier: &dyn Notifier,
    limit: Duration,
    to: &str,
    subject: &str,
    template: &str,
    data: Value,
) {
    let send = notifier.send_email(to, subject, template, data);
    let outcome = match tokio::time::timeout(limit, send).await {
        Ok(res) => res,
        Err(_) => Err(DeliveryError::Timeout),
    };
    if let Err(e) = outcome {
        warn!(error = %e, to, template, "email not delivered");
    }
}
