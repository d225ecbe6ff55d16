//! One-shot job execution: `code-agent run <prompt>`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use code_agent::agent::llm::ChatCompletionsModel;
use code_agent::agent::sandbox::DockerProvider;
use code_agent::config::AppConfig;
use code_agent::factory::db::DbHandle;
use code_agent::factory::job::JobContext;
use code_agent::factory::models::{JobStatus, MessageRole, MessageType, validate_prompt};
use code_agent::factory::names::generate_project_name;
use code_agent::factory::queue::JobRunner;
use code_agent::factory::server::open_database;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the code agent for `prompt` on the current task and print the job
/// output as JSON. Without `project_id` a new project is created.
pub async fn cmd_run(
    config: AppConfig,
    prompt: &str,
    project_id: Option<&str>,
    db_path: Option<PathBuf>,
) -> Result<()> {
    if let Err(message) = validate_prompt(prompt) {
        bail!(message);
    }

    let db_path = db_path.unwrap_or_else(|| config.server.db_path.clone());
    let db = DbHandle::new(open_database(&db_path)?);

    let provider =
        DockerProvider::connect(config.sandbox.clone(), config.server.public_host.clone())
            .context("Failed to connect to Docker")?;
    let model =
        ChatCompletionsModel::new(config.model.clone()).context("Failed to build model client")?;

    let value = prompt.to_string();
    let project_id = match project_id {
        Some(id) => {
            let id = id.to_string();
            db.call(move |db| {
                if db.get_project(&id)?.is_none() {
                    bail!("Project not found: {}", id);
                }
                db.create_message(&id, &value, MessageRole::User, MessageType::Result)?;
                Ok(id)
            })
            .await?
        }
        None => {
            let name = generate_project_name();
            let (project, _) = db
                .call(move |db| db.create_project_with_message(&name, &value))
                .await?;
            info!(project_id = %project.id, name = %project.name, "created project");
            project.id
        }
    };

    let value = prompt.to_string();
    let job = db
        .call(move |db| db.create_job(&project_id, &value))
        .await?;

    let ctx = JobContext {
        db,
        provider: Arc::new(provider),
        model: Arc::new(model),
        sandbox: config.sandbox.clone(),
        agent: config.agent.clone(),
        events: None,
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, stopping after the current turn");
            ctrl_c.cancel();
        }
    });

    let job = JobRunner::execute(&ctx, job, cancel).await?;
    match job.status {
        JobStatus::Completed => {
            let output = job
                .output
                .context("Completed job has no recorded output")?;
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        JobStatus::Cancelled => bail!("Job {} was cancelled", job.id),
        _ => bail!(
            "Job {} failed: {}",
            job.id,
            job.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}
