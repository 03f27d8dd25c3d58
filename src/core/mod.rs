pub mod error;
pub mod types;

pub use error::{LedgerError, LedgerResult, MigrateError, Result};
pub use types::{NIL_VERSION, VersionRecord};
