//! Branch Transfer - request workflow for moving a student between daycare branches
//!
//! # Modules
//!
//! - [`branch_transfer`] - Workflow engine (state machine, conflicts, refunds, coordinator)
//! - [`gateway`] - HTTP surface (axum, JWT, OpenAPI)
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool

pub mod config;
pub mod db;
pub mod logging;

pub mod branch_transfer;
pub mod gateway;

// Convenient re-exports at crate root
pub use branch_transfer::{
    Actor, BranchTransferError, TransferCoordinator, TransferRecord, TransferStatus,
};
pub use config::AppConfig;
