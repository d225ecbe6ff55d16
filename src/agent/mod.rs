//! The coding agent and everything it drives.
//!
//! - `sandbox`: isolated execution environment (`Sandbox`, `SandboxProvider`, Docker backend)
//! - `tools`: the tool catalog and the failure-swallowing `ToolSet` adapter
//! - `llm`: chat-completions client behind the `LanguageModel` trait
//! - `coder`: one agent turn: inference, tool dispatch, marker detection
//! - `network`: the run loop state machine with its iteration ceiling
//! - `state`: `AgentState` accumulated across turns

pub mod coder;
pub mod llm;
pub mod network;
pub mod prompt;
pub mod sandbox;
pub mod state;
pub mod tools;

#[cfg(test)]
pub mod testing;

pub use coder::{CodeAgent, TurnReport};
pub use network::{LoopExit, RunLoop, RunReport, TurnEvent};
pub use state::AgentState;
