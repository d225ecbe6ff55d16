use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use super::job::{JobContext, run_code_agent};
use super::models::*;
use super::ws::WsMessage;
use crate::errors::FactoryError;

/// A job task in flight.
struct RunningJob {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs code-agent jobs on background tasks.
/// Tracks a cancellation token per running job.
#[derive(Clone)]
pub struct JobRunner {
    ctx: Arc<JobContext>,
    /// Map from job id to its running task.
    running: Arc<tokio::sync::Mutex<HashMap<String, RunningJob>>>,
}

impl JobRunner {
    pub fn new(ctx: JobContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            running: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
        }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }

    /// Persist a queued job for `event` and start it.
    pub async fn enqueue(&self, event: JobEvent) -> Result<Job, FactoryError> {
        let job = self
            .ctx
            .db
            .call(move |db| db.create_job(&event.project_id, &event.value))
            .await
            .map_err(FactoryError::Database)?;
        self.ctx.emit(&WsMessage::JobQueued { job: job.clone() });
        self.start(job.clone()).await;
        Ok(job)
    }

    /// Restart jobs left queued or running by a previous process.
    pub async fn resume_pending(&self) -> Result<usize, FactoryError> {
        let jobs = self
            .ctx
            .db
            .call(|db| db.list_unfinished_jobs())
            .await
            .map_err(FactoryError::Database)?;
        let count = jobs.len();
        for job in jobs {
            info!(job_id = %job.id, status = job.status.as_str(), "resuming unfinished job");
            self.start(job).await;
        }
        Ok(count)
    }

    async fn start(&self, job: Job) {
        let cancel = CancellationToken::new();
        // Held across the spawn so the task cannot deregister before it is
        // registered.
        let mut running = self.running.lock().await;

        let job_id = job.id.clone();
        let ctx = Arc::clone(&self.ctx);
        let registry = Arc::clone(&self.running);
        let token = cancel.clone();
        let span = info_span!("job", job_id = %job.id);
        let handle = tokio::spawn(
            async move {
                let job_id = job.id.clone();
                if let Err(e) = Self::execute(&ctx, job, token).await {
                    error!(error = %e, "failed to record job status");
                }
                registry.lock().await.remove(&job_id);
            }
            .instrument(span),
        );
        running.insert(job_id, RunningJob { cancel, handle });
    }

    /// Run a job to completion on the current task and record its status.
    ///
    /// A recorded RESULT completes the job even if cancellation was
    /// requested after the agent finished.
    pub async fn execute(
        ctx: &JobContext,
        job: Job,
        cancel: CancellationToken,
    ) -> Result<Job, FactoryError> {
        let job_id = job.id.clone();
        let started = update_status(ctx, &job_id, JobStatus::Running, None, None).await?;
        ctx.emit(&WsMessage::JobStarted { job: started });

        let result = run_code_agent(ctx, &job_id, &job.event(), cancel.clone()).await;

        match result {
            Ok(output) if output.is_result() || !cancel.is_cancelled() => {
                let job =
                    update_status(ctx, &job_id, JobStatus::Completed, Some(output), None).await?;
                info!("job completed");
                ctx.emit(&WsMessage::JobCompleted { job: job.clone() });
                Ok(job)
            }
            Ok(output) => {
                let job =
                    update_status(ctx, &job_id, JobStatus::Cancelled, Some(output), None).await?;
                info!("job cancelled");
                Ok(job)
            }
            Err(e) if cancel.is_cancelled() => {
                let job = update_status(ctx, &job_id, JobStatus::Cancelled, None, None).await?;
                info!(error = %e, "job cancelled");
                Ok(job)
            }
            Err(e) => {
                error!(error = %e, "job failed");
                let job =
                    update_status(ctx, &job_id, JobStatus::Failed, None, Some(e.to_string()))
                        .await?;
                ctx.emit(&WsMessage::JobFailed { job: job.clone() });
                Ok(job)
            }
        }
    }

    /// Cancel a queued or running job. A running job stops before its next
    /// agent turn and still records its terminal message.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, FactoryError> {
        if let Some(running) = self.running.lock().await.get(job_id) {
            running.cancel.cancel();
        }

        let id = job_id.to_string();
        let job = self
            .ctx
            .db
            .call(move |db| db.get_job(&id))
            .await
            .map_err(FactoryError::Database)?
            .ok_or_else(|| FactoryError::JobNotFound {
                id: job_id.to_string(),
            })?;
        if job.status.is_terminal() {
            return Err(FactoryError::JobNotRunning {
                id: job_id.to_string(),
            });
        }

        let job = update_status(&self.ctx, job_id, JobStatus::Cancelled, None, None).await?;
        self.ctx.emit(&WsMessage::JobCancelled { job: job.clone() });
        Ok(job)
    }

    pub async fn is_running(&self, job_id: &str) -> bool {
        self.running.lock().await.contains_key(job_id)
    }

    /// Stop every running job and wait for its task to end. Stopped jobs
    /// keep their queued or running status and are picked up by
    /// `resume_pending` on the next start.
    pub async fn shutdown(&self) {
        let stopped: Vec<(String, RunningJob)> = self.running.lock().await.drain().collect();
        for (job_id, job) in stopped {
            warn!(job_id = %job_id, "stopping job on shutdown, it will resume on restart");
            job.handle.abort();
            if let Err(e) = job.handle.await
                && !e.is_cancelled()
            {
                error!(job_id = %job_id, error = %e, "job task panicked");
            }
        }
    }
}

async fn update_status(
    ctx: &JobContext,
    job_id: &str,
    status: JobStatus,
    output: Option<JobOutput>,
    error: Option<String>,
) -> Result<Job, FactoryError> {
    let id = job_id.to_string();
    ctx.db
        .call(move |db| db.update_job_status(&id, status, output.as_ref(), error.as_deref()))
        .await
        .map_err(FactoryError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::llm::{ChatMessage, LanguageModel, ModelResponse, ToolDefinition};
    use crate::agent::testing::{
        MemoryProvider, MemorySandbox, ScriptedModel, text_response, tool_response,
    };
    use crate::config::{AgentSettings, SandboxSettings};
    use crate::errors::ModelError;
    use crate::factory::db::{DbHandle, FactoryDb};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    /// Model that never finishes a task, pausing on every call.
    struct SlowModel;

    #[async_trait]
    impl LanguageModel for SlowModel {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _tools: &[ToolDefinition],
        ) -> Result<ModelResponse, ModelError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(text_response("still working"))
        }
    }

    /// Model that cancels a job as it hands back the task summary.
    struct CancelOnSummary {
        inner: ScriptedModel,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl LanguageModel for CancelOnSummary {
        async fn complete(
            &self,
            messages: &[ChatMessage],
            tools: &[ToolDefinition],
        ) -> Result<ModelResponse, ModelError> {
            let response = self.inner.complete(messages, tools).await?;
            if response.text.as_deref().is_some_and(|t| t.contains("<task_summary>")) {
                self.cancel.cancel();
            }
            Ok(response)
        }
    }

    fn runner(model: Arc<dyn LanguageModel>) -> (JobRunner, Project) {
        let db = DbHandle::new(FactoryDb::new_in_memory().unwrap());
        let (project, _) = db
            .lock_sync()
            .unwrap()
            .create_project_with_message("Brisk Falcon", "Build a counter button")
            .unwrap();
        (runner_on(db, model), project)
    }

    fn runner_on(db: DbHandle, model: Arc<dyn LanguageModel>) -> JobRunner {
        let ctx = JobContext {
            db,
            provider: Arc::new(MemoryProvider::new(Arc::new(MemorySandbox::new()))),
            model,
            sandbox: SandboxSettings::default(),
            agent: AgentSettings {
                max_iterations: 15,
                provision_retries: 1,
                retry_backoff_ms: 0,
            },
            events: None,
        };
        JobRunner::new(ctx)
    }

    fn counter_model() -> Arc<dyn LanguageModel> {
        Arc::new(counter_script())
    }

    fn counter_script() -> ScriptedModel {
        ScriptedModel::new(vec![
            Ok(tool_response(
                "createOrUpdateFiles",
                json!({"files": [{"path": "app/page.tsx", "content": "export default () => null"}]}),
            )),
            Ok(text_response("<task_summary>Counter</task_summary>")),
        ])
    }

    async fn messages(runner: &JobRunner, project: &Project) -> Vec<MessageWithFragment> {
        let project_id = project.id.clone();
        runner
            .context()
            .db
            .call(move |db| db.list_messages(&project_id))
            .await
            .unwrap()
    }

    fn event(project: &Project) -> JobEvent {
        JobEvent {
            value: "Build a counter button".to_string(),
            project_id: project.id.clone(),
        }
    }

    async fn wait_for_terminal(runner: &JobRunner, job_id: &str) -> Job {
        for _ in 0..200 {
            let id = job_id.to_string();
            let job = runner
                .context()
                .db
                .call(move |db| db.get_job(&id))
                .await
                .unwrap()
                .unwrap();
            if job.status.is_terminal() && !runner.is_running(job_id).await {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} did not finish", job_id);
    }

    #[tokio::test]
    async fn test_enqueued_job_completes() {
        let (runner, project) = runner(counter_model());
        let job = runner.enqueue(event(&project)).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let done = wait_for_terminal(&runner, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        let output = done.output.expect("output should be stored");
        assert_eq!(output.url, "https://sandbox-test.localhost:32768");
        assert!(output.files.contains_key("app/page.tsx"));
    }

    #[tokio::test]
    async fn test_failed_job_records_error() {
        let model = Arc::new(ScriptedModel::new(vec![Err(ModelError::MissingApiKey)]));
        let (runner, project) = runner(model);
        let job = runner.enqueue(event(&project)).await.unwrap();

        let done = wait_for_terminal(&runner, &job.id).await;
        assert_eq!(done.status, JobStatus::Failed);
        assert!(done.error.unwrap().contains("No API key"));
    }

    #[tokio::test]
    async fn test_cancel_running_job() {
        let (runner, project) = runner(Arc::new(SlowModel));
        let job = runner.enqueue(event(&project)).await.unwrap();
        assert!(runner.is_running(&job.id).await);

        let cancelled = runner.cancel(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);

        let done = wait_for_terminal(&runner, &job.id).await;
        assert_eq!(done.status, JobStatus::Cancelled);

        // The conversation still ends with a terminal message.
        let mut messages = Vec::new();
        for _ in 0..200 {
            let project_id = project.id.clone();
            messages = runner
                .context()
                .db
                .call(move |db| db.list_messages(&project_id))
                .await
                .unwrap();
            if messages.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].message.message_type, MessageType::Error);
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (runner, _) = runner(counter_model());
        let err = runner.cancel("missing").await.unwrap_err();
        assert!(matches!(err, FactoryError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_cancel_finished_job() {
        let (runner, project) = runner(counter_model());
        let job = runner.enqueue(event(&project)).await.unwrap();
        wait_for_terminal(&runner, &job.id).await;

        let err = runner.cancel(&job.id).await.unwrap_err();
        assert!(matches!(err, FactoryError::JobNotRunning { .. }));
    }

    #[tokio::test]
    async fn test_resume_pending_runs_queued_jobs() {
        let (runner, project) = runner(counter_model());
        let project_id = project.id.clone();
        let job = runner
            .context()
            .db
            .call(move |db| db.create_job(&project_id, "Build a counter button"))
            .await
            .unwrap();

        assert_eq!(runner.resume_pending().await.unwrap(), 1);
        let done = wait_for_terminal(&runner, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_jobs_resumable() {
        let (runner, project) = runner(Arc::new(SlowModel));
        let job = runner.enqueue(event(&project)).await.unwrap();
        // Let the job reach the agent loop.
        tokio::time::sleep(Duration::from_millis(50)).await;

        runner.shutdown().await;
        assert!(!runner.is_running(&job.id).await);

        let id = job.id.clone();
        let stopped = runner
            .context()
            .db
            .call(move |db| db.get_job(&id))
            .await
            .unwrap()
            .unwrap();
        assert!(!stopped.status.is_terminal());
        assert_eq!(messages(&runner, &project).await.len(), 1);

        let unfinished = runner
            .context()
            .db
            .call(|db| db.list_unfinished_jobs())
            .await
            .unwrap();
        assert!(unfinished.iter().any(|j| j.id == job.id));

        // A restarted runner on the same store picks the job up.
        let restarted = runner_on(runner.context().db.clone(), counter_model());
        assert_eq!(restarted.resume_pending().await.unwrap(), 1);
        let done = wait_for_terminal(&restarted, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);

        let messages = messages(&restarted, &project).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].message.message_type, MessageType::Result);
    }

    #[tokio::test]
    async fn test_cancel_after_result_keeps_job_completed() {
        let cancel = CancellationToken::new();
        let model = Arc::new(CancelOnSummary {
            inner: counter_script(),
            cancel: cancel.clone(),
        });
        let (runner, project) = runner(model);
        let project_id = project.id.clone();
        let job = runner
            .context()
            .db
            .call(move |db| db.create_job(&project_id, "Build a counter button"))
            .await
            .unwrap();

        let done = JobRunner::execute(runner.context(), job, cancel.clone())
            .await
            .unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(done.status, JobStatus::Completed);
        assert!(done.output.unwrap().is_result());

        let messages = messages(&runner, &project).await;
        assert_eq!(messages[1].message.message_type, MessageType::Result);
    }
}
