//! Persistence and coordination core for a polite, multi-site philosophical
//! text crawler: the repository layer, configuration hierarchy, and
//! retention/maintenance engine. Fetching, parsing, and extraction are
//! callers of this crate, not part of it.

pub mod config;
pub mod error;
pub mod ids;
pub mod models;
pub mod repository;
pub mod storage;

pub use error::{ConfigErrorKind, RepositoryError, Result};
pub use storage::DbPool;
