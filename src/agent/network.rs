//! The run loop: drives `CodeAgent` turns until the task is summarized,
//! the iteration ceiling is reached or the job is cancelled.
//!
//! ```text
//!   Running ──(summary set)──────────> Done(Completed)
//!      │    ──(turns == ceiling)─────> Done(IterationLimit)
//!      │    ──(cancel requested)─────> Done(Cancelled)
//!      └──(otherwise: one more turn)──┘
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::coder::{CodeAgent, TurnReport};
use super::state::AgentState;
use crate::errors::RunLoopError;

/// Default iteration ceiling.
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopExit {
    Completed,
    IterationLimit,
    Cancelled,
}

impl LoopExit {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopExit::Completed => "completed",
            LoopExit::IterationLimit => "iteration_limit",
            LoopExit::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for LoopExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Done(LoopExit),
}

/// Emitted after every completed turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnEvent {
    /// 1-based turn number.
    pub iteration: u32,
    pub report: TurnReport,
    pub files: usize,
}

pub type TurnObserver = Arc<dyn Fn(&TurnEvent) + Send + Sync>;

/// Final state handed back to the job.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub state: AgentState,
    pub iterations: u32,
    pub exit: LoopExit,
}

pub struct RunLoop {
    agent: CodeAgent,
    max_iterations: u32,
    cancel: CancellationToken,
    observer: Option<TurnObserver>,
}

impl RunLoop {
    pub fn new(agent: CodeAgent) -> Self {
        Self {
            agent,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            cancel: CancellationToken::new(),
            observer: None,
        }
    }

    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: TurnObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Routing decision taken before every turn.
    pub fn route(&self, state: &AgentState, iterations: u32) -> LoopState {
        if state.has_summary() {
            LoopState::Done(LoopExit::Completed)
        } else if iterations >= self.max_iterations {
            LoopState::Done(LoopExit::IterationLimit)
        } else if self.cancel.is_cancelled() {
            LoopState::Done(LoopExit::Cancelled)
        } else {
            LoopState::Running
        }
    }

    /// Run turns starting from `state`. Model faults end the run and are
    /// not retried.
    pub async fn run(
        &self,
        prompt: &str,
        mut state: AgentState,
    ) -> Result<RunReport, RunLoopError> {
        let mut history = self.agent.seed_history(prompt);
        let mut iterations = 0u32;

        loop {
            let exit = match self.route(&state, iterations) {
                LoopState::Done(exit) => exit,
                LoopState::Running => {
                    let iteration = iterations + 1;
                    debug!(iteration, "dispatching agent turn");
                    let report = match self.agent.run_turn(&mut history, &mut state).await {
                        Ok(report) => report,
                        Err(source) => {
                            error!(iteration, error = %source, "agent turn failed");
                            return Err(RunLoopError::Model { iteration, source });
                        }
                    };
                    iterations = iteration;
                    if let Some(observer) = &self.observer {
                        observer(&TurnEvent {
                            iteration,
                            report,
                            files: state.files.len(),
                        });
                    }
                    continue;
                }
            };

            match exit {
                LoopExit::Completed => {
                    info!(iterations, files = state.files.len(), "run loop completed")
                }
                LoopExit::IterationLimit => {
                    warn!(iterations, "run loop hit the iteration ceiling without a summary")
                }
                LoopExit::Cancelled => warn!(iterations, "run loop cancelled"),
            }
            return Ok(RunReport {
                state,
                iterations,
                exit,
            });
        }
    }
}
