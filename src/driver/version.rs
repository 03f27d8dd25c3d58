use super::{EnsureTable, table_is_active};
use crate::connection::{SessionGateway, UnitOfWork};
use crate::core::{LedgerError, LedgerResult, MigrateError, NIL_VERSION, Result, VersionRecord};
use crate::ledger::LedgerTransaction;
use async_trait::async_trait;
use serde_json::Value;

/// The migrations table: a single `{version, dirty}` document
pub struct VersionStore {
    table: String,
}

struct ReadVersion<'a> {
    table: &'a str,
}

#[async_trait]
impl UnitOfWork for ReadVersion<'_> {
    type Output = Vec<Value>;

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<Vec<Value>> {
        if !table_is_active(txn, self.table).await? {
            return Ok(Vec::new());
        }
        txn.execute(&format!("SELECT * FROM {}", self.table), &[]).await
    }
}

struct WriteVersion<'a> {
    table: &'a str,
    record: VersionRecord,
}

#[async_trait]
impl UnitOfWork for WriteVersion<'_> {
    type Output = ();

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<()> {
        txn.execute(&format!("DELETE FROM {}", self.table), &[]).await?;
        if self.record.is_persisted() {
            let document = serde_json::to_value(self.record)
                .map_err(|e| LedgerError::ExecutionError(e.to_string()))?;
            txn.execute(&format!("INSERT INTO {} VALUE ?", self.table), &[document])
                .await?;
        }
        Ok(())
    }
}

impl VersionStore {
    pub fn new(table: &str) -> Self {
        Self { table: table.to_string() }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current record; `(-1, false)` when the table or the record is absent
    pub async fn read(&self, gateway: &SessionGateway) -> Result<VersionRecord> {
        let documents = gateway
            .execute(&ReadVersion { table: &self.table })
            .await
            .map_err(MigrateError::VersionRead)?;

        match documents.as_slice() {
            [] => Ok(VersionRecord::nil()),
            [document] => parse_record(document).map_err(MigrateError::VersionRead),
            more => Err(MigrateError::VersionRead(LedgerError::ExecutionError(format!(
                "expected one version record in '{}', found {}",
                self.table,
                more.len()
            )))),
        }
    }

    /// Replace the record with `(version, dirty)`
    pub async fn write(&self, gateway: &SessionGateway, version: i64, dirty: bool) -> Result<()> {
        if version < NIL_VERSION {
            return Err(MigrateError::InvalidVersion(version));
        }

        gateway
            .execute(&EnsureTable { table: &self.table })
            .await
            .map_err(MigrateError::VersionWrite)?;

        let record = VersionRecord::new(version, dirty);
        gateway
            .execute(&WriteVersion { table: &self.table, record })
            .await
            .map_err(MigrateError::VersionWrite)
    }
}

fn parse_record(document: &Value) -> LedgerResult<VersionRecord> {
    let record: VersionRecord = serde_json::from_value(document.clone())
        .map_err(|e| LedgerError::ExecutionError(format!("malformed version record: {}", e)))?;
    if record.version < NIL_VERSION {
        return Err(LedgerError::ExecutionError(format!(
            "malformed version record: version {} is below {}",
            record.version, NIL_VERSION
        )));
    }
    Ok(record)
}
