//! `rota-worker` — drives claimed jobs to completion through per-action strategies.
//!
//! A [`runtime::ProcessorRuntime`] claims jobs through a [`client::JobClient`],
//! looks up the job's [`strategy::ActionStrategy`] in the
//! [`registry::StrategyRegistry`] and runs `initiate`, `poll` and `finalize`
//! while heartbeating. Timeout enforcement stays with the scheduler's reaper.

pub mod client;
pub mod error;
pub mod registry;
pub mod runtime;
pub mod snapshot;
pub mod strategy;

pub use client::JobClient;
pub use error::{ActionError, Result, WorkerError};
pub use registry::StrategyRegistry;
pub use runtime::{JobOutcome, ProcessorRuntime};
pub use snapshot::{ImageService, SnapshotStrategy};
pub use strategy::{ActionStrategy, ExternalStatus};
