// Application layer - ledger use cases, error taxonomy and notifications.

pub mod error;
pub mod notify;
pub mod service;

pub use error::*;
pub use notify::*;
pub use service::*;
