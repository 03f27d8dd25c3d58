// ============================================================================
// Transaction Management Module
// ============================================================================
//
// Ledger transactions use optimistic concurrency control:
// - Each table is copied into the transaction on first touch
// - The table versions observed are recorded as the read set
// - Commit validates the read set and fails on any concurrent change
//
// ============================================================================

pub mod change;
pub mod state;

pub use change::Change;
pub use state::{Transaction, TransactionId, TransactionState};
