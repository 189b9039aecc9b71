pub mod export;
pub mod ingest;

pub use export::*;
pub use ingest::*;
