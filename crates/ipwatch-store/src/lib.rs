//! ipwatch store: unified SQLite record store for indicators, collection
//! history and per-source state.

pub mod schema;
pub mod sqlite;
pub mod types;

pub use sqlite::RecordStore;
pub use types::*;
