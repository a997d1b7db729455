//! Agent board: runs coding-agent worker processes for tasks and keeps each
//! task's status in line with what the workers report.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, start_server)          │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ WebSocket│    └─ ws.rs   (BoardEvent stream)                │
//!                       │         │                                        │
//!                       │         │ BoardHandle (mpsc commands)            │
//!                       │         v                                        │
//!                       │  engine.rs  (Board actor loop)                   │
//!                       │    ├─ store.rs        (TaskStore, Arc<Task>)     │
//!                       │    ├─ reconciler.rs   (StatusReconciler)         │
//!                       │    ├─ watcher.rs      (PlanWatcher → plan.rs)    │
//!                       │    └─ orchestrator.rs (ProcessOrchestrator)      │
//!                       │              │                                   │
//!                       │              v                                   │
//!                       │  worker.rs  (child process, progress.rs lines)   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Status flow
//!
//! `backlog → in_progress → ai_review → human_review → done / pr_created`,
//! with `error` reachable from a failed definition run. `done`,
//! `pr_created` and `error` are terminal for automatic updates; only a user
//! action moves a task out of them.

pub mod api;
pub mod engine;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod reconciler;
pub mod server;
pub mod store;
pub mod watcher;
pub mod worker;
pub mod ws;

#[cfg(test)]
mod testing;

pub use engine::{Board, BoardHandle};
pub use events::BoardEvent;
pub use models::{NewTask, Task, TaskStatus};
pub use reconciler::{Liveness, UserAction};
