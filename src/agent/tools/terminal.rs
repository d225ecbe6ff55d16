use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{Tool, ToolOutput, parse_args};
use crate::agent::sandbox::{CapturedOutput, Sandbox};
use crate::errors::ToolFailure;

#[derive(Debug, Deserialize)]
struct TerminalArgs {
    command: String,
}

/// Runs one shell command and returns its stdout.
pub struct Terminal;

#[async_trait]
impl Tool for Terminal {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn description(&self) -> &'static str {
        "Use the terminal to run commands"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to run"}
            },
            "required": ["command"]
        })
    }

    async fn call(&self, sandbox: &dyn Sandbox, args: Value) -> Result<ToolOutput, ToolFailure> {
        let args: TerminalArgs = parse_args(self.name(), args)?;
        let mut capture = CapturedOutput::default();
        match sandbox.run_command(&args.command, &mut capture).await {
            Ok(output) => Ok(ToolOutput::text(output.stdout)),
            Err(source) => Err(ToolFailure::Command {
                source,
                stdout: capture.stdout,
                stderr: capture.stderr,
            }),
        }
    }
}
