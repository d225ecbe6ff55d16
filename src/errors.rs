//! Typed error hierarchy for the code agent.
//!
//! The enums follow the layers a job passes through:
//! - `SandboxError`: sandbox provisioning, command execution and file I/O
//! - `ToolFailure`: a tool invocation that could not complete; always
//!   rendered to text for the model, never propagated
//! - `ModelError` / `RunLoopError`: inference transport and loop faults
//! - `JobError`: fatal failures of a background job
//! - `FactoryError`: store and queue failures surfaced by the HTTP layer

use thiserror::Error;

/// Errors from a sandbox backend.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to provision sandbox from template '{template}': {message}")]
    Provision { template: String, message: String },

    #[error("Sandbox {id} not found")]
    NotFound { id: String },

    #[error("Command exited with code {exit_code}")]
    CommandExit {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("No such file: {path}")]
    FileNotFound { path: String },

    #[error("Port {port} is not published by sandbox {id}")]
    PortNotPublished { id: String, port: u16 },

    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A tool invocation that failed. The tool adapter turns every variant into
/// the string handed back to the model.
#[derive(Debug, Error)]
pub enum ToolFailure {
    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("Command failed: {source} \n stdout:{stdout} \n stderr:{stderr}")]
    Command {
        #[source]
        source: SandboxError,
        stdout: String,
        stderr: String,
    },

    /// `written` holds the files that landed before the failing write.
    #[error("Failed to create or update files: {source}")]
    Write {
        path: String,
        written: Vec<(String, String)>,
        #[source]
        source: SandboxError,
    },

    #[error("Failed to read files: {source}")]
    Read {
        path: String,
        #[source]
        source: SandboxError,
    },

    #[error("Failed to list directory: {source}")]
    List {
        #[source]
        source: SandboxError,
    },

    #[error("Failed to run {check} check: {source}")]
    Check {
        check: String,
        #[source]
        source: SandboxError,
    },
}

/// Errors from the language model transport.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Model returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed model response: {0}")]
    Malformed(String),

    #[error("No API key configured for the model endpoint")]
    MissingApiKey,
}

/// Faults that abort the agent run loop.
#[derive(Debug, Error)]
pub enum RunLoopError {
    #[error("Model call failed on iteration {iteration}: {source}")]
    Model {
        iteration: u32,
        #[source]
        source: ModelError,
    },
}

/// Fatal failures of a background code-agent job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("Sandbox provisioning failed after {attempts} attempt(s): {source}")]
    Provisioning {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("Sandbox unavailable: {0}")]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    RunLoop(#[from] RunLoopError),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

/// Errors from the store, queue and API subsystem.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: String },

    #[error("Job {id} not found")]
    JobNotFound { id: String },

    #[error("Fragment {id} not found")]
    FragmentNotFound { id: String },

    #[error("Job {id} is not running")]
    JobNotRunning { id: String },

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Invalid request: {0}")]
    BadRequest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_renders_partial_output() {
        let err = ToolFailure::Command {
            source: SandboxError::CommandExit {
                exit_code: 127,
                stdout: "partial".into(),
                stderr: "sh: nope: not found".into(),
            },
            stdout: "partial".into(),
            stderr: "sh: nope: not found".into(),
        };
        assert_eq!(
            err.to_string(),
            "Command failed: Command exited with code 127 \n stdout:partial \n stderr:sh: nope: not found"
        );
    }

    #[test]
    fn write_failure_carries_written_prefix() {
        let err = ToolFailure::Write {
            path: "b.ts".into(),
            written: vec![("a.ts".into(), "x".into())],
            source: SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )),
        };
        match &err {
            ToolFailure::Write { path, written, .. } => {
                assert_eq!(path, "b.ts");
                assert_eq!(written.len(), 1);
            }
            _ => panic!("Expected Write"),
        }
        assert!(err.to_string().starts_with("Failed to create or update files:"));
    }

    #[test]
    fn read_failure_prefix() {
        let err = ToolFailure::Read {
            path: "missing.ts".into(),
            source: SandboxError::FileNotFound {
                path: "missing.ts".into(),
            },
        };
        assert_eq!(err.to_string(), "Failed to read files: No such file: missing.ts");
    }

    #[test]
    fn run_loop_error_converts_into_job_error() {
        let inner = RunLoopError::Model {
            iteration: 3,
            source: ModelError::MissingApiKey,
        };
        let job_err: JobError = inner.into();
        match &job_err {
            JobError::RunLoop(RunLoopError::Model { iteration, .. }) => assert_eq!(*iteration, 3),
            _ => panic!("Expected JobError::RunLoop"),
        }
        assert!(job_err.to_string().contains("iteration 3"));
    }

    #[test]
    fn provisioning_error_carries_attempts() {
        let err = JobError::Provisioning {
            attempts: 3,
            source: anyhow::anyhow!("daemon unreachable"),
        };
        assert!(matches!(err, JobError::Provisioning { attempts: 3, .. }));
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn factory_error_variants_are_distinct() {
        let project_err = FactoryError::ProjectNotFound { id: "p1".into() };
        let job_err = FactoryError::JobNotFound { id: "p1".into() };
        assert!(matches!(project_err, FactoryError::ProjectNotFound { .. }));
        assert!(!matches!(job_err, FactoryError::ProjectNotFound { .. }));
        assert!(project_err.to_string().contains("p1"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&SandboxError::NotFound { id: "x".into() });
        assert_std_error(&ToolFailure::UnknownTool { name: "x".into() });
        assert_std_error(&ModelError::MissingApiKey);
        assert_std_error(&FactoryError::BadRequest("x".into()));
    }
}
