//! The code-agent job: provision a sandbox, drive the agent against it and
//! persist exactly one terminal message for the project.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::db::DbHandle;
use super::models::*;
use super::steps::{RetryPolicy, StepRunner};
use super::ws::{WsMessage, broadcast_message};
use crate::agent::llm::LanguageModel;
use crate::agent::network::{RunLoop, TurnEvent};
use crate::agent::sandbox::SandboxProvider;
use crate::agent::tools::ToolSet;
use crate::agent::{AgentState, CodeAgent};
use crate::config::{AgentSettings, SandboxSettings};
use crate::errors::JobError;

/// Everything a job needs besides its own trigger.
#[derive(Clone)]
pub struct JobContext {
    pub db: DbHandle,
    pub provider: Arc<dyn SandboxProvider>,
    pub model: Arc<dyn LanguageModel>,
    pub sandbox: SandboxSettings,
    pub agent: AgentSettings,
    pub events: Option<broadcast::Sender<String>>,
}

impl JobContext {
    pub(crate) fn emit(&self, msg: &WsMessage) {
        if let Some(tx) = &self.events {
            broadcast_message(tx, msg);
        }
    }

    fn provision_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.agent.provision_retries,
            Duration::from_millis(self.agent.retry_backoff_ms),
        )
    }
}

/// Run one code-agent job.
///
/// An incomplete run is not an error: it is stored as an ERROR message and
/// the job still returns its output. A model fault is stored the same way
/// and then returned. A job whose result is already recorded returns the
/// recorded output without provisioning or calling the model.
#[tracing::instrument(skip(ctx, event, cancel), fields(project_id = %event.project_id))]
pub async fn run_code_agent(
    ctx: &JobContext,
    job_id: &str,
    event: &JobEvent,
    cancel: CancellationToken,
) -> Result<JobOutput, JobError> {
    if let Some(saved) = recorded_result(ctx, job_id).await? {
        info!(message_id = %saved.message_id, "result already recorded, skipping agent run");
        return Ok(saved.output);
    }

    let steps = StepRunner::new(ctx.db.clone(), job_id);

    let policy = ctx.provision_policy();
    let sandbox_id: String = steps
        .run_with_retry(STEP_GET_SANDBOX_ID, policy, || {
            let provider = ctx.provider.clone();
            let template = ctx.sandbox.template.clone();
            async move { Ok::<_, anyhow::Error>(provider.create(&template).await?) }
        })
        .await
        .map_err(|e| match e {
            JobError::Step { source, .. } => JobError::Provisioning {
                attempts: policy.max_attempts,
                source,
            },
            other => other,
        })?;
    info!(sandbox_id = %sandbox_id, "sandbox ready");

    let sandbox = ctx.provider.resolve(&sandbox_id).await?;

    let agent = CodeAgent::new(ctx.model.clone(), ToolSet::standard(sandbox.clone()));
    let mut run_loop = RunLoop::new(agent)
        .with_max_iterations(ctx.agent.max_iterations)
        .with_cancellation(cancel);
    if let Some(tx) = ctx.events.clone() {
        let job_id = job_id.to_string();
        run_loop = run_loop.with_observer(Arc::new(move |turn: &TurnEvent| {
            broadcast_message(
                &tx,
                &WsMessage::AgentTurn {
                    job_id: job_id.clone(),
                    iteration: turn.iteration,
                    tool_calls: turn.report.tool_calls.clone(),
                    summarized: turn.report.summarized,
                    files: turn.files,
                },
            );
        }));
    }

    let report = match run_loop.run(&event.value, AgentState::new()).await {
        Ok(report) => report,
        Err(fault) => {
            error!(error = %fault, "agent run failed, recording error message");
            let output = JobOutput {
                url: String::new(),
                title: FRAGMENT_TITLE.to_string(),
                files: Default::default(),
                summary: None,
            };
            let saved =
                save_result(ctx, job_id, &event.project_id, RunOutcome::Error, output).await;
            if let Err(e) = saved {
                error!(error = %e, "failed to record error message");
            }
            return Err(fault.into());
        }
    };
    info!(
        iterations = report.iterations,
        exit = %report.exit,
        files = report.state.files.len(),
        "agent run finished"
    );

    let outcome = RunOutcome::classify(&report.state);
    if outcome.is_error() {
        warn!("agent run is incomplete, recording error message");
    }

    let port = ctx.sandbox.preview_port;
    let url: String = steps
        .run(STEP_GET_SANDBOX_URL, || {
            let sandbox = sandbox.clone();
            async move {
                let host = sandbox.preview_host(port).await?;
                Ok::<_, anyhow::Error>(format!("https://{}", host))
            }
        })
        .await?;

    let output = JobOutput {
        url,
        title: FRAGMENT_TITLE.to_string(),
        files: report.state.files,
        summary: report.state.summary,
    };
    save_result(ctx, job_id, &event.project_id, outcome, output).await
}

async fn recorded_result(
    ctx: &JobContext,
    job_id: &str,
) -> Result<Option<SavedResult>, JobError> {
    let job_id = job_id.to_string();
    ctx.db
        .call(move |db| db.get_saved_result(&job_id))
        .await
        .map_err(JobError::Store)
}

/// The terminal write. The message, its fragment and the `save-result`
/// record commit together; if the job already has a record, that record's
/// output wins and nothing is written.
async fn save_result(
    ctx: &JobContext,
    job_id: &str,
    project_id: &str,
    outcome: RunOutcome,
    output: JobOutput,
) -> Result<JobOutput, JobError> {
    let id = job_id.to_string();
    let project_id = project_id.to_string();
    let to_store = output.clone();
    let written = ctx
        .db
        .call(move |db| db.save_result(&id, &project_id, &outcome, &to_store))
        .await
        .map_err(JobError::Store)?;

    match written {
        Some(message) => {
            ctx.emit(&WsMessage::MessageCreated { message });
            Ok(output)
        }
        None => {
            warn!("result was recorded by an earlier run, keeping it");
            let saved = recorded_result(ctx, job_id).await?.ok_or_else(|| {
                JobError::Store(anyhow::anyhow!("save-result record missing for job {}", job_id))
            })?;
            Ok(saved.output)
        }
    }
}
