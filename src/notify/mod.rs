//! Completion notifications.
//!
//! Fire-and-forget webhook posted when a job reaches a terminal state.
//! Delivery failures are logged and never affect the job outcome, and
//! the whole mechanism is disabled when no endpoint is configured.

use std::time::Duration;

use tracing::{debug, warn};

use crate::model::Job;

/// Posts job completion notifications to a webhook.
pub struct Notifier {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl Notifier {
    /// Creates a notifier; `None` disables notifications entirely.
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    /// Sends the completion notification for a job.
    ///
    /// Never fails: transport errors and non-2xx responses are logged
    /// and swallowed.
    pub async fn notify_job_complete(&self, job: &Job, is_error: bool) {
        let Some(url) = &self.endpoint else {
            debug!(job_id = %job.id, "notifications disabled, skipping");
            return;
        };

        let body = serde_json::json!({
            "job_id": job.id,
            "title": job.title,
            "recipient": job.recipient,
            "status": job.status.to_string(),
            "is_error": is_error,
        });

        let result = self
            .client
            .post(url)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(
                    job_id = %job.id,
                    status = %response.status(),
                    "completion notification rejected"
                );
            }
            Ok(_) => {
                debug!(job_id = %job.id, is_error, "completion notification sent");
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "completion notification failed");
            }
        }
    }
}
