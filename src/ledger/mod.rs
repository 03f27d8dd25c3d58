// ============================================================================
// Ledger Client Contract
// ============================================================================
//
// The traits a ledger backend implements so the session gateway can drive it:
// connector -> client -> session -> transaction. Statements are PartiQL text
// with `?` placeholders; documents are JSON values.
//
// `memory` provides the in-process implementation.
//
// ============================================================================

pub mod journal;
pub mod memory;
pub mod statement;

use crate::connection::config::Config;
use crate::core::LedgerResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub use journal::{GENESIS_HASH, Journal, JournalBlock, JournalWriter};
pub use memory::{MemoryConnector, MemoryLedger};

/// Receipt of a committed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitDigest {
    pub transaction_id: String,
    /// Sequence of the journal block at the ledger tip after this commit
    pub sequence: u64,
    /// Hash of that block
    pub hash: String,
}

/// Resolves a configuration into a client for one ledger.
#[async_trait]
pub trait LedgerConnector: Send + Sync {
    /// Authenticate and locate the ledger named by `config`.
    async fn connect(&self, config: &Config) -> LedgerResult<Arc<dyn LedgerClient>>;
}

/// A handle on one ledger that can start sessions.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    fn ledger_name(&self) -> &str;

    async fn start_session(&self) -> LedgerResult<Box<dyn LedgerSession>>;
}

/// A session runs one transaction at a time.
#[async_trait]
pub trait LedgerSession: Send + Sync {
    fn id(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>>;

    /// Idempotent.
    async fn close(&self) -> LedgerResult<()>;
}

/// An open transaction.
///
/// Dropping a transaction without calling `commit` abandons it: nothing it
/// executed becomes visible.
#[async_trait]
pub trait LedgerTransaction: Send {
    fn id(&self) -> &str;

    /// Execute one statement, binding `params` to its `?` placeholders in order.
    async fn execute(&mut self, statement: &str, params: &[Value]) -> LedgerResult<Vec<Value>>;

    async fn commit(self: Box<Self>) -> LedgerResult<CommitDigest>;

    async fn abort(self: Box<Self>) -> LedgerResult<()>;
}
