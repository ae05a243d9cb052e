//! `rota-core` — configuration and per-action policy shared by every rota crate.

pub mod config;
pub mod error;
pub mod policy;

pub use config::RotaConfig;
pub use error::{Result, RotaError};
pub use policy::{ActionPolicies, ActionPolicy};
