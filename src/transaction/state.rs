// ============================================================================
// Transaction State Management
// ============================================================================
//
// Each transaction moves through defined states: Active -> Committed/Aborted.
// Only an Active transaction may record statements, changes or reads.
//
// ============================================================================

use super::Change;
use crate::core::{LedgerError, LedgerResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Global transaction ID counter
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Generate a new unique transaction ID
    pub fn new() -> Self {
        TransactionId(NEXT_TXN_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// Transaction state
///
/// ```text
/// Active ──commit──> Committed
///   │
///   └──abort──> Aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can execute statements
    Active,

    /// Transaction has been committed to the journal
    Committed,

    /// Transaction was abandoned; nothing it did is visible
    Aborted,
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Active => write!(f, "ACTIVE"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Bookkeeping for one ledger transaction
///
/// Holds the statements executed, the changes they produced and the read set
/// (table name -> table version observed) validated at commit time.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    state: TransactionState,
    statements: Vec<String>,
    changes: Vec<Change>,
    reads: HashMap<String, u64>,
    start_time: std::time::Instant,
}

impl Transaction {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            state: TransactionState::Active,
            statements: Vec::new(),
            changes: Vec::new(),
            reads: HashMap::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn changes(&self) -> &[Change] {
        &self.changes
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }

    /// Table versions observed by this transaction
    pub fn reads(&self) -> &HashMap<String, u64> {
        &self.reads
    }

    pub fn duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    fn ensure_active(&self, action: &str) -> LedgerResult<()> {
        if !self.state.is_active() {
            return Err(LedgerError::TransactionClosed(format!(
                "cannot {}: {} is {}",
                action, self.id, self.state
            )));
        }
        Ok(())
    }

    pub fn record_statement(&mut self, statement: &str) -> LedgerResult<()> {
        self.ensure_active("execute")?;
        self.statements.push(statement.to_string());
        Ok(())
    }

    pub fn record_change(&mut self, change: Change) -> LedgerResult<()> {
        self.ensure_active("record change")?;
        self.changes.push(change);
        Ok(())
    }

    /// Record the version of `table` the first time it is observed
    pub fn record_read(&mut self, table: &str, version: u64) {
        self.reads.entry(table.to_string()).or_insert(version);
    }

    pub fn has_read(&self, table: &str) -> bool {
        self.reads.contains_key(table)
    }

    /// Mark transaction as committed
    pub fn commit(&mut self) -> LedgerResult<()> {
        self.ensure_active("commit")?;
        self.state = TransactionState::Committed;
        Ok(())
    }

    /// Mark transaction as aborted and discard changes
    pub fn abort(&mut self) -> LedgerResult<()> {
        self.ensure_active("abort")?;
        self.changes.clear();
        self.state = TransactionState::Aborted;
        Ok(())
    }
}
