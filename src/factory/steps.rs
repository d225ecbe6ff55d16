//! Memoized job steps.
//!
//! A step's JSON output is recorded in `job_steps` the first time it
//! succeeds. A job that is re-run after a restart replays recorded outputs
//! instead of executing the step again, so a sandbox is provisioned at most
//! once per job. The terminal write records its own step inside the store
//! transaction (`FactoryDb::save_result`).

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::db::DbHandle;
use crate::errors::JobError;

/// Attempts and backoff for a retried step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled after every failure.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// Runs named steps of one job against the memo table.
#[derive(Clone)]
pub struct StepRunner {
    db: DbHandle,
    job_id: String,
}

impl StepRunner {
    pub fn new(db: DbHandle, job_id: impl Into<String>) -> Self {
        Self {
            db,
            job_id: job_id.into(),
        }
    }

    /// Run a step once, or replay its recorded output.
    pub async fn run<T, F, Fut>(&self, name: &str, f: F) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.replay(name).await? {
            return Ok(value);
        }
        let value = f().await.map_err(|source| JobError::Step {
            step: name.to_string(),
            source,
        })?;
        self.record(name, &value).await?;
        Ok(value)
    }

    /// Like `run`, retrying failures per `policy`. The last error is
    /// returned once attempts are exhausted.
    pub async fn run_with_retry<T, F, Fut>(
        &self,
        name: &str,
        policy: RetryPolicy,
        mut f: F,
    ) -> Result<T, JobError>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if let Some(value) = self.replay(name).await? {
            return Ok(value);
        }

        let mut attempt = 1;
        let value = loop {
            match f().await {
                Ok(value) => break value,
                Err(source) if attempt >= policy.max_attempts => {
                    return Err(JobError::Step {
                        step: name.to_string(),
                        source,
                    });
                }
                Err(e) => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        job_id = %self.job_id,
                        step = name,
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        };
        self.record(name, &value).await?;
        Ok(value)
    }

    async fn replay<T>(&self, name: &str) -> Result<Option<T>, JobError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let job_id = self.job_id.clone();
        let step = name.to_string();
        let stored = self
            .db
            .call(move |db| db.get_step(&job_id, &step))
            .await
            .map_err(JobError::Store)?;
        let Some(json) = stored else {
            return Ok(None);
        };
        debug!(
            job_id = %self.job_id,
            step = name,
            "replaying recorded step output"
        );
        serde_json::from_str(&json).map(Some).map_err(|e| {
            JobError::Store(anyhow::anyhow!("Corrupt output for step '{}': {}", name, e))
        })
    }

    async fn record<T: Serialize>(&self, name: &str, value: &T) -> Result<(), JobError> {
        let json = serde_json::to_string(value).map_err(|e| {
            JobError::Store(anyhow::anyhow!("Failed to serialize step '{}': {}", name, e))
        })?;
        let job_id = self.job_id.clone();
        let step = name.to_string();
        self.db
            .call(move |db| db.put_step(&job_id, &step, &json))
            .await
            .map_err(JobError::Store)
    }
}
