use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::agent::AgentState;

/// Title given to every fragment.
pub const FRAGMENT_TITLE: &str = "Fragment";

/// Content of the assistant message stored when a run produced nothing usable.
pub const ERROR_MESSAGE_CONTENT: &str = "Something went wrong, please try again";

/// Longest accepted prompt, in characters.
pub const MAX_PROMPT_CHARS: usize = 10_000;

// Memoized job steps, keyed by name in `job_steps`.
pub const STEP_GET_SANDBOX_ID: &str = "get-sandbox-id";
pub const STEP_GET_SANDBOX_URL: &str = "get-sandbox-url";
pub const STEP_SAVE_RESULT: &str = "save-result";

/// Check a user prompt before anything is stored.
pub fn validate_prompt(value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err("Message is required".to_string());
    }
    if value.chars().count() > MAX_PROMPT_CHARS {
        return Err("Message is too long".to_string());
    }
    Ok(())
}

/// Current time as an RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Assistant => "ASSISTANT",
        }
    }
}

impl FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USER" => Ok(Self::User),
            "ASSISTANT" => Ok(Self::Assistant),
            _ => Err(format!("Invalid message role: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Result,
    Error,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "RESULT",
            Self::Error => "ERROR",
        }
    }
}

impl FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESULT" => Ok(Self::Result),
            "ERROR" => Ok(Self::Error),
            _ => Err(format!("Invalid message type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub content: String,
    pub role: MessageRole,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub created_at: String,
    pub updated_at: String,
}

/// Artifact of a successful run: preview URL plus the generated files.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fragment {
    pub id: String,
    pub message_id: String,
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageWithFragment {
    #[serde(flatten)]
    pub message: Message,
    pub fragment: Option<Fragment>,
}

/// Trigger payload of a code-agent job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobEvent {
    pub value: String,
    pub project_id: String,
}

/// Value returned by a finished job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobOutput {
    pub url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: Option<String>,
}

impl JobOutput {
    /// True when the run was recorded as a RESULT: it produced both a
    /// summary and at least one file.
    pub fn is_result(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.trim().is_empty()) && !self.files.is_empty()
    }
}

/// The terminal write of a job, recorded under `save-result` in the same
/// transaction as the message it created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedResult {
    pub message_id: String,
    pub output: JobOutput,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub prompt: String,
    pub status: JobStatus,
    pub output: Option<JobOutput>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub completed_at: Option<String>,
}

impl Job {
    pub fn event(&self) -> JobEvent {
        JobEvent {
            value: self.prompt.clone(),
            project_id: self.project_id.clone(),
        }
    }
}

/// Terminal classification of a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Success {
        summary: String,
        files: BTreeMap<String, String>,
    },
    Error,
}

impl RunOutcome {
    /// A run is an error unless it produced both a summary and a file.
    pub fn classify(state: &AgentState) -> Self {
        match &state.summary {
            Some(summary) if state.is_complete() => Self::Success {
                summary: summary.clone(),
                files: state.files.clone(),
            },
            _ => Self::Error,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}
