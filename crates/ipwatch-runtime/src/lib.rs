//! ipwatch runtime: wires store, cache and collectors into the running
//! service.
//!
//! `IndicatorService` is the read plane, `CollectionOrchestrator` the control
//! plane, and `Scheduler` drives both in the background.

pub mod bootstrap;
pub mod format;
pub mod orchestrator;
pub mod scheduler;
pub mod service;
pub mod types;

pub use bootstrap::build_registry;
pub use format::{FormattedPayload, OutputFormat};
pub use orchestrator::{backoff_delay, CollectionOrchestrator};
pub use scheduler::Scheduler;
pub use service::IndicatorService;
pub use types::*;
