//! # anax node
//!
//! The part of the edge agent that owns agreements: it answers proposals
//! from agreement bots, tracks each agreement through its lifecycle, starts
//! and maintains the dependent services an agreement needs, and quiesces
//! the node on unconfigure.
//!
//! ```text
//!                   ┌──────────────────────────────┐
//!   exchange ◀────▶ │ ExchangeApi (reqwest client) │
//!                   └──────────────┬───────────────┘
//!                                  │
//!  MessageBus ──▶ GovernanceWorker ─┼─▶ ProtocolHandler (Basic, Citizen Scientist)
//!      ▲               │           │
//!      │               ▼           ▼
//!      └──── LoadContainer,     AgentDb (LMDB)
//!            GovernanceMaintain, ...
//! ```
//!
//! ## Modules
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`config`] | TOML configuration with `ANAX_*` overrides |
//! | [`exchange`] | exchange API trait, HTTP client, transient retry |
//! | [`policy`] | policy and proposal documents, version ranges |
//! | [`protocol`] | agreement protocol messages |
//! | [`signature`] | deployment signature verification |
//! | [`producer`] | protocol handlers |
//! | [`governance`] | agreement and dependent service lifecycle, node shutdown |
//! | [`mock_exchange`] | in-memory exchange for tests |

pub mod config;
pub mod exchange;
pub mod governance;
pub mod mock_exchange;
pub mod policy;
pub mod producer;
pub mod protocol;
pub mod signature;

pub use config::{AgentConfig, ConfigError};
pub use exchange::{ExchangeApi, ExchangeClient, ExchangeError, RetryPolicy};
pub use governance::{GovernanceCommand, GovernanceError, GovernanceWorker, ShutdownMode};
pub use mock_exchange::MockExchange;
pub use producer::{build_handlers, HandlerMap, ProtocolHandler, TermReason};
