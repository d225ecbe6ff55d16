use std::sync::Arc;

use tracing::{debug, info};

use super::llm::{ChatMessage, LanguageModel};
use super::prompt::SYSTEM_PROMPT;
use super::state::{AgentState, has_completion_marker};
use super::tools::ToolSet;
use crate::errors::ModelError;

/// What happened during one turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnReport {
    /// Assistant text of the turn, if any.
    pub text: Option<String>,
    /// Names of the tools called, in order.
    pub tool_calls: Vec<String>,
    /// True when this turn recorded the summary.
    pub summarized: bool,
}

/// An LLM bound to the coding instruction and a sandbox's tool set.
pub struct CodeAgent {
    model: Arc<dyn LanguageModel>,
    tools: ToolSet,
    system_prompt: String,
}

impl CodeAgent {
    pub fn new(model: Arc<dyn LanguageModel>, tools: ToolSet) -> Self {
        Self {
            model,
            tools,
            system_prompt: SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Initial history for a task.
    pub fn seed_history(&self, prompt: &str) -> Vec<ChatMessage> {
        vec![
            ChatMessage::system(self.system_prompt.clone()),
            ChatMessage::user(prompt),
        ]
    }

    /// One inference followed by its tool calls, run in order. The turn's
    /// assistant text is then checked for the completion marker.
    pub async fn run_turn(
        &self,
        history: &mut Vec<ChatMessage>,
        state: &mut AgentState,
    ) -> Result<TurnReport, ModelError> {
        let definitions = self.tools.definitions();
        let response = self.model.complete(history, &definitions).await?;

        history.push(ChatMessage::Assistant {
            content: response.text.clone(),
            tool_calls: response.tool_calls.clone(),
        });

        let mut report = TurnReport {
            text: response.text,
            ..TurnReport::default()
        };

        for call in &response.tool_calls {
            debug!(tool = %call.name, call_id = %call.id, "dispatching tool call");
            let result = self.tools.invoke(call, state).await;
            history.push(ChatMessage::Tool {
                tool_call_id: call.id.clone(),
                name: call.name.clone(),
                content: result,
            });
            report.tool_calls.push(call.name.clone());
        }

        if let Some(text) = report.text.as_deref()
            && has_completion_marker(text)
        {
            report.summarized = state.record_summary(text);
            if report.summarized {
                info!(files = state.files.len(), "agent reported task summary");
            }
        }

        Ok(report)
    }
}
