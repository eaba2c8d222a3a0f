//! # Anax Common Crate
//!
//! Shared foundation of the anax edge agent.
//!
//! ## Modules
//! - `persistence`: LMDB-backed agreement, service, device, contract and event log records
//! - `events`: internal message bus
//! - `worker`: command-queue runtime composed by every subsystem
//! - `task_set`: bounded, keyed background task set
//!
//! ## Subsystem Architecture
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  governance  │   │  blockchain  │   │   (others)   │
//! │ WorkerRuntime│   │ WorkerRuntime│   │ WorkerRuntime│
//! └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!        │ publish/subscribe │                  │
//! ┌──────▼──────────────────▼──────────────────▼───────┐
//! │                     MessageBus                     │
//! └────────────────────────────────────────────────────┘
//!        │                  │                  │
//! ┌──────▼──────────────────▼──────────────────▼───────┐
//! │                  AgentDb (LMDB)                    │
//! └────────────────────────────────────────────────────┘
//! ```

pub mod events;
pub mod persistence;
pub mod task_set;
pub mod worker;

pub use events::{Message, MessageBus};
pub use persistence::{AgentDb, DbError, DbResult};
pub use task_set::{KeyedTaskSet, SpawnOutcome, TaskState};
pub use worker::{CommandHandler, CommandSender, WorkerError, WorkerRuntime};
