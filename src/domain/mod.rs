mod account;
mod entry;
mod integrity;
mod ledger;
mod money;

pub use account::*;
pub use entry::*;
pub use integrity::*;
pub use ledger::*;
pub use money::*;
