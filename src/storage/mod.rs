mod repository;
mod tx;

pub use repository::*;

/// SQL migration for the account projection, entry log and sequence counter
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");
