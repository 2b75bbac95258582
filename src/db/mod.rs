//! Bookkeeping store: connections, pipeline runs and knowledge-base flags.
//!
//! - `model`: typed rows returned by the repository.
//! - `repo`: SQL-only functions over a SQLite pool.
//!
//! Callers import from `data_extractors::db`; the repository API is re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{Connection, KnowledgeBase, Pipeline};
