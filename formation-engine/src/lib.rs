//! Formation engine: groups applications, runtimes, runtime contexts and tenants
//! into formations and keeps every ordered pair of members converged through
//! webhook notifications.

pub mod api;
mod assignments;
pub mod config;
pub mod constraints;
pub mod context;
pub mod cursor;
pub mod dispatcher;
pub mod engine;
pub mod errors;
pub mod fixtures;
mod lifecycle;
pub mod metrics_defs;
pub mod providers;
mod resync;
pub mod store;
pub mod template;
pub mod transport;
pub mod types;
pub mod webhooks;

#[cfg(test)]
mod testutils;

pub use engine::{Collaborators, FormationEngine};
pub use errors::{FormationError, Result};
pub use lifecycle::FormationStatusReport;
