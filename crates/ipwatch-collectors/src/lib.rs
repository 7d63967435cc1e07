//! Source collectors: portal adapters that log in, download and parse
//! indicator feeds into normalized batches.
//!
//! Collectors never write to the store. They hand a batch back to the
//! orchestrator, which owns ingest and run bookkeeping.

pub mod collector;
pub mod http;
pub mod markup;
pub mod regtech;
pub mod secudium;
pub mod types;

pub use collector::{build_collector, dedup_latest, SourceCollector};
pub use regtech::RegtechCollector;
pub use secudium::SecudiumCollector;
pub use types::*;
