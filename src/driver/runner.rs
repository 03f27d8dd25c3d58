use crate::connection::{SessionGateway, UnitOfWork};
use crate::core::{LedgerError, LedgerResult, MigrateError, Result};
use crate::ledger::LedgerTransaction;
use crate::ledger::statement::split_statements;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Placeholder statement text for failures raised after the last statement
const COMMIT: &str = "COMMIT";

struct RunStatements<'a> {
    statements: &'a [String],
}

#[async_trait]
impl UnitOfWork for RunStatements<'_> {
    type Output = ();

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<()> {
        for (index, statement) in self.statements.iter().enumerate() {
            txn.execute(statement, &[])
                .await
                .map_err(|source| LedgerError::Statement {
                    index,
                    statement: statement.clone(),
                    source: Box::new(source),
                })?;
        }
        Ok(())
    }
}

/// Read a migration body to the end and split it into statements
pub async fn read_statements<R>(migration: &mut R) -> Result<Vec<String>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut raw = Vec::new();
    migration.read_to_end(&mut raw).await?;
    let body = String::from_utf8(raw)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(split_statements(&body))
}

/// Execute `statements` in a single transaction
///
/// Either every statement is committed or none is.
pub async fn run_statements(gateway: &SessionGateway, statements: &[String]) -> Result<()> {
    if statements.is_empty() {
        return Ok(());
    }

    gateway
        .execute(&RunStatements { statements })
        .await
        .map_err(|err| match err {
            LedgerError::Statement { index, statement, source } => MigrateError::Execution {
                index,
                statement,
                source: *source,
            },
            other => MigrateError::Execution {
                index: statements.len(),
                statement: COMMIT.to_string(),
                source: other,
            },
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::SessionConfig;
    use crate::ledger::MemoryLedger;
    use std::sync::Arc;

    fn setup() -> (MemoryLedger, SessionGateway) {
        let ledger = MemoryLedger::new("runner");
        let gateway = SessionGateway::new(Arc::new(ledger.clone()), SessionConfig::default());
        (ledger, gateway)
    }

    #[tokio::test]
    async fn test_read_statements() {
        let mut body: &[u8] = b"CREATE TABLE a;\n-- seed\nINSERT INTO a VALUE {'x': 'semi;colon'};\n\n";
        let statements = read_statements(&mut body).await.unwrap();
        assert_eq!(statements, vec!["CREATE TABLE a", "INSERT INTO a VALUE {'x': 'semi;colon'}"]);
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_a_read_error() {
        let mut body: &[u8] = &[0x43, 0xff, 0xfe];
        assert!(matches!(read_statements(&mut body).await, Err(MigrateError::MigrationRead(_))));
    }

    #[tokio::test]
    async fn test_all_statements_commit_together() {
        let (ledger, gateway) = setup();
        let statements = vec![
            "CREATE TABLE People".to_string(),
            "CREATE INDEX ON People (email)".to_string(),
            "INSERT INTO People VALUE {'email': 'a@example.com'}".to_string(),
        ];
        run_statements(&gateway, &statements).await.unwrap();

        assert_eq!(ledger.documents("People").await.unwrap().len(), 1);
        assert_eq!(ledger.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failure_reports_statement_and_commits_nothing() {
        let (ledger, gateway) = setup();
        let statements = vec![
            "CREATE TABLE People".to_string(),
            "INSERT INTO Nowhere VALUE {'a': 1}".to_string(),
            "CREATE TABLE Never".to_string(),
        ];

        match run_statements(&gateway, &statements).await {
            Err(MigrateError::Execution { index, statement, source }) => {
                assert_eq!(index, 1);
                assert_eq!(statement, "INSERT INTO Nowhere VALUE {'a': 1}");
                assert!(matches!(source, LedgerError::TableNotFound(_)));
            }
            other => panic!("expected Execution error, got {:?}", other),
        }
        assert!(ledger.table_names().await.is_empty());
        assert!(ledger.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_migration_is_noop() {
        let (ledger, gateway) = setup();
        run_statements(&gateway, &[]).await.unwrap();
        assert!(ledger.journal().await.is_empty());
    }
}
