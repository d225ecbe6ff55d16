//! In-memory doubles for the sandbox and model seams.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::llm::{ChatMessage, LanguageModel, ModelResponse, ToolCall, ToolDefinition};
use super::sandbox::{CapturedOutput, CommandOutput, Sandbox, SandboxProvider};
use crate::errors::{ModelError, SandboxError};

pub struct MemorySandbox {
    id: String,
    host: String,
    files: Mutex<BTreeMap<String, String>>,
    scripted: Vec<(String, i64, String, String)>,
    failing_writes: HashSet<String>,
    commands: Mutex<Vec<String>>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self {
            id: "sandbox-test".to_string(),
            host: "sandbox-test.localhost:32768".to_string(),
            files: Mutex::new(BTreeMap::new()),
            scripted: Vec::new(),
            failing_writes: HashSet::new(),
            commands: Mutex::new(Vec::new()),
        }
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        self
    }

    /// Script the result of an exact command. Unscripted commands succeed
    /// with empty output.
    pub fn on_command(mut self, command: &str, exit_code: i64, stdout: &str, stderr: &str) -> Self {
        self.scripted.push((
            command.to_string(),
            exit_code,
            stdout.to_string(),
            stderr.to_string(),
        ));
        self
    }

    pub fn failing_write(mut self, path: &str) -> Self {
        self.failing_writes.insert(path.to_string());
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl Sandbox for MemorySandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run_command(
        &self,
        command: &str,
        capture: &mut CapturedOutput,
    ) -> Result<CommandOutput, SandboxError> {
        self.commands.lock().unwrap().push(command.to_string());
        let (exit_code, stdout, stderr) = self
            .scripted
            .iter()
            .find(|(c, ..)| c == command)
            .map(|(_, code, out, err)| (*code, out.clone(), err.clone()))
            .unwrap_or((0, String::new(), String::new()));
        capture.stdout.push_str(&stdout);
        capture.stderr.push_str(&stderr);
        if exit_code != 0 {
            return Err(SandboxError::CommandExit {
                exit_code,
                stdout,
                stderr,
            });
        }
        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<(), SandboxError> {
        if self.failing_writes.contains(path) {
            return Err(SandboxError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", path),
            )));
        }
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String, SandboxError> {
        self.file(path).ok_or_else(|| SandboxError::FileNotFound {
            path: path.to_string(),
        })
    }

    async fn preview_host(&self, _port: u16) -> Result<String, SandboxError> {
        Ok(self.host.clone())
    }
}

/// Provider handing out one shared `MemorySandbox`.
pub struct MemoryProvider {
    sandbox: Arc<MemorySandbox>,
    failures_left: AtomicU32,
    pub created: AtomicU32,
}

impl MemoryProvider {
    pub fn new(sandbox: Arc<MemorySandbox>) -> Self {
        Self {
            sandbox,
            failures_left: AtomicU32::new(0),
            created: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` calls to `create`.
    pub fn failing_first(self, n: u32) -> Self {
        self.failures_left.store(n, Ordering::SeqCst);
        self
    }

    pub fn create_calls(&self) -> u32 {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for MemoryProvider {
    async fn create(&self, template: &str) -> Result<String, SandboxError> {
        self.created.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(SandboxError::Provision {
                template: template.to_string(),
                message: "backend unavailable".to_string(),
            });
        }
        Ok(self.sandbox.id().to_string())
    }

    async fn resolve(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        if id == self.sandbox.id() {
            Ok(self.sandbox.clone())
        } else {
            Err(SandboxError::NotFound { id: id.to_string() })
        }
    }
}

/// Model that replays a script of responses, then repeats `fallback`.
pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ModelResponse, ModelError>>>,
    fallback: Option<ModelResponse>,
    calls: AtomicU32,
    seen: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new(script: Vec<Result<ModelResponse, ModelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback: None,
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn repeating(response: ModelResponse) -> Self {
        Self::new(Vec::new()).then_repeat(response)
    }

    pub fn then_repeat(mut self, response: ModelResponse) -> Self {
        self.fallback = Some(response);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Conversation history sent on each call.
    pub fn seen(&self) -> Vec<Vec<ChatMessage>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(messages.to_vec());
        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }
        self.fallback
            .clone()
            .ok_or_else(|| ModelError::Malformed("script exhausted".to_string()))
    }
}

pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse {
        text: Some(text.to_string()),
        tool_calls: Vec::new(),
    }
}

pub fn tool_response(name: &str, arguments: Value) -> ModelResponse {
    ModelResponse {
        text: None,
        tool_calls: vec![ToolCall {
            id: format!("call_{}", name),
            name: name.to_string(),
            arguments,
        }],
    }
}
