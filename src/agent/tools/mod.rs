//! The fixed tool catalog exposed to the agent.
//!
//! Every tool parses its arguments into a typed struct and returns
//! `Result<ToolOutput, ToolFailure>`. `ToolSet::invoke` is the only place
//! results meet `AgentState`: it merges written files and renders every
//! failure to the text the model sees.

mod checks;
mod files;
mod terminal;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

pub use checks::{
    BuildMatcher, CHECK_SEPARATOR, CheckKind, EslintMatcher, TypeScriptMatcher, Verdict,
    VerdictMatcher, VerdictStatus,
};

use super::llm::{ToolCall, ToolDefinition};
use super::sandbox::Sandbox;
use super::state::AgentState;
use crate::errors::ToolFailure;

/// Successful tool result.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub text: String,
    /// Files written by the call, in write order.
    pub written: Vec<(String, String)>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            written: Vec::new(),
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure>;
}

/// Deserialize tool arguments into `T`.
pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolFailure> {
    serde_json::from_value(args).map_err(|e| ToolFailure::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

/// Tools bound to one sandbox.
pub struct ToolSet {
    sandbox: Arc<dyn Sandbox>,
    tools: Vec<Box<dyn Tool>>,
}

impl ToolSet {
    /// The full catalog: shell, file tools and the advisory check tools.
    pub fn standard(sandbox: Arc<dyn Sandbox>) -> Self {
        Self {
            sandbox,
            tools: vec![
                Box::new(terminal::Terminal),
                Box::new(files::CreateOrUpdateFiles),
                Box::new(files::ListDirectory),
                Box::new(files::ReadFiles),
                Box::new(checks::RunChecks),
                Box::new(checks::CheckSyntax),
                Box::new(checks::BuildProject),
            ],
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters(),
            })
            .collect()
    }

    /// Run one tool call. Never fails: errors become the returned text.
    pub async fn invoke(&self, call: &ToolCall, state: &mut AgentState) -> String {
        let Some(tool) = self.tools.iter().find(|t| t.name() == call.name) else {
            let failure = ToolFailure::UnknownTool {
                name: call.name.clone(),
            };
            warn!(tool = %call.name, "model requested an unknown tool");
            return failure.to_string();
        };

        match tool.call(self.sandbox.as_ref(), call.arguments.clone()).await {
            Ok(output) => {
                debug!(tool = %call.name, files = output.written.len(), "tool call succeeded");
                state.merge_files(output.written);
                output.text
            }
            Err(failure) => {
                warn!(tool = %call.name, error = %failure, "tool call failed");
                let text = failure.to_string();
                if let ToolFailure::Write { written, .. } = failure {
                    state.merge_files(written);
                }
                text
            }
        }
    }
}
