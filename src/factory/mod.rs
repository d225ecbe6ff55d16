//! Projects, messages and the background jobs that answer them.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│         │                                        │
//!                       │         │ JobRunner::enqueue()                   │
//!                       │         v                                        │
//!                       │  queue.rs  (JobRunner, cancellation tokens)      │
//!                       │         │                                        │
//!                       │         │ run_code_agent()                       │
//!                       │         v                                        │
//!                       │  job.rs  (steps: get-sandbox-id,                 │
//!                       │           get-sandbox-url, save-result)          │
//!                       │         │                                        │
//!                       │         │ RunLoop::run()                         │
//!                       │         v                                        │
//!                       │  crate::agent  (CodeAgent, tools, sandbox)       │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module   | Responsibility                                              |
//! |----------|-------------------------------------------------------------|
//! | `models` | `Project`, `Message`, `Fragment`, `Job`, `RunOutcome`       |
//! | `db`     | SQLite access via `DbHandle` (thin `Arc<Mutex<_>>`)         |
//! | `steps`  | `StepRunner`: memoized, retried job steps                   |
//! | `ws`     | `WsMessage` enum + `broadcast_message()` helper             |
//! | `names`  | Two-word project names                                      |
//!
//! ## Typical Request Flow
//!
//! 1. `POST /api/projects {value}` stores the project and its first USER
//!    message in one transaction, then enqueues a job.
//! 2. The job provisions a sandbox (`get-sandbox-id`, retried), builds the
//!    agent against it and runs the loop until the agent emits its
//!    `<task_summary>` or the iteration ceiling is hit.
//! 3. The outcome is classified, the preview URL resolved
//!    (`get-sandbox-url`) and exactly one ASSISTANT message written
//!    (`save-result`): RESULT with a fragment, or ERROR.
//! 4. Every transition is broadcast over `/ws`.

pub mod api;
pub mod db;
pub mod job;
pub mod models;
pub mod names;
pub mod queue;
pub mod server;
pub mod steps;
pub mod ws;
