//! # Anax Chain Crate
//!
//! On-chain side of the agent: device contracts and the reconciler that
//! waits for contract writes to become visible.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `contract` | `ContractValue`, `ContractClient`/`ContractFactory` traits, attribute helpers |
//! | `reconciler` | `verify_change` poll-until-change with a soft 480s timeout |
//! | `registry` | pending contract registration, established contract evaluation |
//! | `worker` | `BlockchainWorker` loops and `BlockchainCommand` handling |
//! | `http_contract` | gateway-backed contract client |
//! | `mock_contract` | in-memory contracts for tests |
//! | `config` | `[blockchain]` configuration section |
//!
//! ## Soft timeout
//!
//! `verify_change` returns `Ok(PollOutcome::TimedOut)` when a write is not
//! observed within `WRITE_POLL_TIMEOUT_S`. It is not an error. See
//! [`reconciler`].

pub mod config;
pub mod contract;
pub mod http_contract;
pub mod mock_contract;
pub mod reconciler;
pub mod registry;
pub mod worker;

pub use config::ChainConfig;
pub use contract::{ContractClient, ContractError, ContractFactory, ContractResult, ContractValue};
pub use http_contract::HttpContractFactory;
pub use mock_contract::{MockContract, MockContractFactory};
pub use reconciler::{verify_change, ChangePredicate, PollOutcome, WRITE_POLL_TIMEOUT_S};
pub use registry::{DeviceContracts, DirectoryContracts};
pub use worker::{BlockchainCommand, BlockchainWorker};
