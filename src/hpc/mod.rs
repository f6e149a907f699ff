//! Remote HPC execution client.
//!
//! When configured, the MD stage is executed by a remote HPC service
//! instead of local binaries. The contract is deliberately small: submit
//! a named script for a job, then poll the resulting task until it
//! reaches a terminal state.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Errors from the remote HPC service.
#[derive(Debug, Error)]
pub enum HpcError {
    /// HTTP transport failure.
    #[error("HPC request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The service rejected the submission.
    #[error("HPC submission rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body.
        message: String,
    },

    /// The remote task reached a failed or cancelled state.
    #[error("HPC task {task_id} ended in state {state}")]
    TaskFailed {
        /// The remote task identifier.
        task_id: String,
        /// The terminal state.
        state: HpcTaskState,
    },

    /// The remote task did not finish within the polling deadline.
    #[error("HPC task {0} did not finish in time")]
    Timeout(String),
}

/// State of a remote HPC task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpcTaskState {
    /// Queued on the remote scheduler.
    Pending,
    /// Executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled remotely.
    Cancelled,
}

impl std::fmt::Display for HpcTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HpcTaskState::Pending => write!(f, "pending"),
            HpcTaskState::Running => write!(f, "running"),
            HpcTaskState::Completed => write!(f, "completed"),
            HpcTaskState::Failed => write!(f, "failed"),
            HpcTaskState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Call/response contract with the remote HPC service.
#[async_trait]
pub trait HpcClient: Send + Sync {
    /// Submits a named script for a job; returns the remote task ID.
    async fn submit_script(&self, script_id: &str, job_uuid: Uuid) -> Result<String, HpcError>;

    /// Polls the state of a previously submitted task.
    async fn poll_status(&self, task_id: &str) -> Result<HpcTaskState, HpcError>;
}

#[derive(Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    state: HpcTaskState,
}

/// HTTP implementation of `HpcClient`.
pub struct HttpHpcClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpHpcClient {
    /// Creates a client against the given service base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl HpcClient for HttpHpcClient {
    async fn submit_script(&self, script_id: &str, job_uuid: Uuid) -> Result<String, HpcError> {
        let url = format!("{}/api/v1/scripts/{}/submit", self.base_url, script_id);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({ "job_uuid": job_uuid }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HpcError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: SubmitResponse = response.json().await?;
        debug!(task_id = %body.task_id, script_id, %job_uuid, "submitted HPC script");
        Ok(body.task_id)
    }

    async fn poll_status(&self, task_id: &str) -> Result<HpcTaskState, HpcError> {
        let url = format!("{}/api/v1/tasks/{}", self.base_url, task_id);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HpcError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: StatusResponse = response.json().await?;
        Ok(body.state)
    }
}

/// Polls a task until it completes, fails, or exceeds the deadline.
pub async fn wait_for_completion(
    client: &dyn HpcClient,
    task_id: &str,
    interval: Duration,
    deadline: Duration,
) -> Result<(), HpcError> {
    let start = std::time::Instant::now();
    loop {
        match client.poll_status(task_id).await? {
            HpcTaskState::Completed => return Ok(()),
            state @ (HpcTaskState::Failed | HpcTaskState::Cancelled) => {
                return Err(HpcError::TaskFailed {
                    task_id: task_id.to_string(),
                    state,
                });
            }
            HpcTaskState::Pending | HpcTaskState::Running => {
                if start.elapsed() > deadline {
                    return Err(HpcError::Timeout(task_id.to_string()));
                }
                tokio::time::sleep(interval).await;
            }
        }
    }
}
