use super::{EnsureTable, table_is_active};
use crate::connection::config::Config;
use crate::connection::{SessionGateway, UnitOfWork};
use crate::core::{LedgerError, LedgerResult, MigrateError, Result};
use crate::ledger::LedgerTransaction;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Advisory lock document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub lock_id: String,
    pub holder: String,
    /// RFC 3339 timestamp
    pub acquired_at: String,
}

/// Local view of the lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
}

/// Acquires and releases the migration lock for one driver instance
pub struct LockManager {
    table: String,
    lock_id: String,
    holder: String,
    lease: Option<Duration>,
    state: LockState,
}

/// Lock id shared by every driver pointing at the same ledger and table
pub fn lock_id(ledger_name: &str, migrations_table: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", ledger_name, migrations_table).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

/// Outcome of one acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
enum Acquisition {
    Acquired,
    /// An abandoned record was replaced by ours
    Reclaimed(LockRecord),
    Held(LockRecord),
}

struct AcquireLock<'a> {
    table: &'a str,
    lock_id: &'a str,
    holder: &'a str,
    lease: Option<Duration>,
}

impl AcquireLock<'_> {
    /// True when `record` has outlived the lease
    fn is_abandoned(&self, record: &LockRecord) -> bool {
        let Some(lease) = self.lease else {
            return false;
        };
        let Ok(acquired_at) = DateTime::parse_from_rfc3339(&record.acquired_at) else {
            return false;
        };
        let Ok(lease) = chrono::Duration::from_std(lease) else {
            return false;
        };
        Utc::now().signed_duration_since(acquired_at.with_timezone(&Utc)) > lease
    }
}

#[async_trait]
impl UnitOfWork for AcquireLock<'_> {
    type Output = Acquisition;

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<Acquisition> {
        let existing = txn
            .execute(
                &format!("SELECT * FROM {} WHERE lock_id = ?", self.table),
                &[json!(self.lock_id)],
            )
            .await?;

        let mut reclaimed = None;
        if let Some(document) = existing.first() {
            let record: LockRecord = serde_json::from_value(document.clone())
                .map_err(|e| LedgerError::ExecutionError(format!("malformed lock record: {}", e)))?;
            if record.holder == self.holder {
                return Ok(Acquisition::Acquired);
            }
            if !self.is_abandoned(&record) {
                return Ok(Acquisition::Held(record));
            }
            txn.execute(
                &format!("DELETE FROM {} WHERE lock_id = ? AND holder = ?", self.table),
                &[json!(record.lock_id), json!(record.holder)],
            )
            .await?;
            reclaimed = Some(record);
        }

        let record = LockRecord {
            lock_id: self.lock_id.to_string(),
            holder: self.holder.to_string(),
            acquired_at: Utc::now().to_rfc3339(),
        };
        let document =
            serde_json::to_value(&record).map_err(|e| LedgerError::ExecutionError(e.to_string()))?;
        txn.execute(&format!("INSERT INTO {} VALUE ?", self.table), &[document])
            .await?;
        Ok(reclaimed.map_or(Acquisition::Acquired, Acquisition::Reclaimed))
    }
}

/// Remove the lock record whoever holds it
struct BreakLock<'a> {
    table: &'a str,
    lock_id: &'a str,
}

#[async_trait]
impl UnitOfWork for BreakLock<'_> {
    type Output = Option<LockRecord>;

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<Option<LockRecord>> {
        if !table_is_active(txn, self.table).await? {
            return Ok(None);
        }
        let existing = txn
            .execute(
                &format!("SELECT * FROM {} WHERE lock_id = ?", self.table),
                &[json!(self.lock_id)],
            )
            .await?;
        if existing.is_empty() {
            return Ok(None);
        }
        txn.execute(
            &format!("DELETE FROM {} WHERE lock_id = ?", self.table),
            &[json!(self.lock_id)],
        )
        .await?;
        Ok(existing
            .into_iter()
            .next()
            .and_then(|document| serde_json::from_value(document).ok()))
    }
}

struct ReleaseLock<'a> {
    table: &'a str,
    lock_id: &'a str,
    holder: &'a str,
}

#[async_trait]
impl UnitOfWork for ReleaseLock<'_> {
    type Output = usize;

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<usize> {
        if !table_is_active(txn, self.table).await? {
            return Ok(0);
        }
        let params: [Value; 2] = [json!(self.lock_id), json!(self.holder)];
        let deleted = txn
            .execute(
                &format!("DELETE FROM {} WHERE lock_id = ? AND holder = ?", self.table),
                &params,
            )
            .await?;
        Ok(deleted.len())
    }
}

impl LockManager {
    pub fn new(config: &Config) -> Self {
        Self {
            table: config.lock_table.clone(),
            lock_id: lock_id(&config.ledger_name, &config.migrations_table),
            holder: format!("{}:{}", std::process::id(), uuid::Uuid::new_v4()),
            lease: config.lock_timeout,
            state: LockState::Unlocked,
        }
    }

    pub fn lock_id(&self) -> &str {
        &self.lock_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.state == LockState::Locked
    }

    pub async fn lock(&mut self, gateway: &SessionGateway) -> Result<()> {
        if self.is_locked() {
            return Err(MigrateError::AlreadyLocked);
        }

        let io = |source| MigrateError::LockIo { operation: "acquire", source };
        gateway
            .execute(&EnsureTable { table: &self.table })
            .await
            .map_err(io)?;

        let acquisition = gateway
            .execute(&AcquireLock {
                table: &self.table,
                lock_id: &self.lock_id,
                holder: &self.holder,
                lease: self.lease,
            })
            .await
            .map_err(io)?;

        match acquisition {
            Acquisition::Acquired => {}
            Acquisition::Reclaimed(stale) => log::warn!(
                "Took over lock {} abandoned by {} (acquired at {})",
                self.lock_id,
                stale.holder,
                stale.acquired_at
            ),
            Acquisition::Held(record) => {
                return Err(MigrateError::LockHeld {
                    holder: record.holder,
                    acquired_at: record.acquired_at,
                });
            }
        }

        self.state = LockState::Locked;
        Ok(())
    }

    pub async fn unlock(&mut self, gateway: &SessionGateway) -> Result<()> {
        if !self.is_locked() {
            return Ok(());
        }

        let deleted = gateway
            .execute(&ReleaseLock {
                table: &self.table,
                lock_id: &self.lock_id,
                holder: &self.holder,
            })
            .await
            .map_err(|source| MigrateError::LockIo { operation: "release", source })?;
        if deleted == 0 {
            log::debug!("Lock {} was already gone on release", self.lock_id);
        }

        self.state = LockState::Unlocked;
        Ok(())
    }

    /// Delete the lock record regardless of its holder
    ///
    /// Recovery for a lock left behind by a process that died mid-run.
    /// Returns the record that was removed, if any.
    pub async fn force_unlock(&mut self, gateway: &SessionGateway) -> Result<Option<LockRecord>> {
        let removed = gateway
            .execute(&BreakLock {
                table: &self.table,
                lock_id: &self.lock_id,
            })
            .await
            .map_err(|source| MigrateError::LockIo { operation: "release", source })?;
        self.state = LockState::Unlocked;
        Ok(removed)
    }

    /// Forget the local lock after the lock table has been dropped
    pub fn reset(&mut self) {
        self.state = LockState::Unlocked;
    }
}
