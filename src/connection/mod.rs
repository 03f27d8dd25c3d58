pub mod config;
pub mod pool;

use crate::core::{LedgerError, LedgerResult};
use crate::ledger::{LedgerClient, LedgerConnector, LedgerTransaction};
use async_trait::async_trait;
use config::{Config, SessionConfig};
use pool::{PoolStats, SessionGuard, SessionPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Work executed inside a single ledger transaction
///
/// `apply` may run more than once: after an OCC conflict the gateway starts a
/// fresh transaction and calls it again, so it must not keep state between
/// attempts.
#[async_trait]
pub trait UnitOfWork: Send + Sync {
    type Output: Send;

    async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<Self::Output>;
}

/// Transactional access to one ledger
///
/// Owns the client and the session pool. Every unit of work runs in its own
/// transaction on a pooled session: committed when `apply` succeeds, aborted
/// otherwise, retried with exponential backoff on OCC conflicts and bounded
/// by `transaction_timeout` per attempt.
pub struct SessionGateway {
    pool: SessionPool,
    config: SessionConfig,
    closed: AtomicBool,
}

impl SessionGateway {
    /// Connect to the ledger named by `config`
    pub async fn connect(config: &Config, connector: &dyn LedgerConnector) -> LedgerResult<Self> {
        let client = connector.connect(config).await?;
        log::info!(
            "Connected to ledger '{}' in {}",
            client.ledger_name(),
            config.region
        );
        Ok(Self::new(client, config.session.clone()))
    }

    pub fn new(client: Arc<dyn LedgerClient>, config: SessionConfig) -> Self {
        Self {
            pool: SessionPool::new(client, config.clone()),
            config,
            closed: AtomicBool::new(false),
        }
    }

    pub fn ledger_name(&self) -> &str {
        self.pool.client().ledger_name()
    }

    pub fn session_config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Run `work` in a transaction, retrying OCC conflicts
    pub async fn execute<W: UnitOfWork>(&self, work: &W) -> LedgerResult<W::Output> {
        let mut attempt = 0u32;
        loop {
            if self.is_closed() {
                return Err(LedgerError::SessionClosed);
            }
            attempt += 1;

            let guard = self.pool.acquire().await?;
            let outcome =
                tokio::time::timeout(self.config.transaction_timeout, Self::attempt(&guard, work)).await;

            let err = match outcome {
                Ok(Ok(output)) => {
                    guard.release().await;
                    return Ok(output);
                }
                Ok(Err(err)) => {
                    guard.release().await;
                    err
                }
                Err(_) => {
                    // The abandoned transaction was dropped uncommitted
                    guard.discard().await;
                    log::warn!(
                        "Transaction attempt {} timed out after {:?}",
                        attempt,
                        self.config.transaction_timeout
                    );
                    return Err(LedgerError::Timeout(self.config.transaction_timeout));
                }
            };

            if !err.is_retriable() || attempt > self.config.retry_limit {
                return Err(err);
            }

            let delay = self.config.backoff(attempt);
            log::debug!(
                "Retrying transaction (attempt {} of {}) in {:?}: {}",
                attempt + 1,
                self.config.retry_limit + 1,
                delay,
                err
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn attempt<W: UnitOfWork>(guard: &SessionGuard, work: &W) -> LedgerResult<W::Output> {
        let mut txn = guard.begin().await?;
        match work.apply(txn.as_mut()).await {
            Ok(output) => {
                txn.commit().await?;
                Ok(output)
            }
            Err(err) => {
                let id = txn.id().to_string();
                if let Err(abort_err) = txn.abort().await {
                    log::warn!("Failed to abort transaction {}: {}", id, abort_err);
                }
                Err(err)
            }
        }
    }

    /// Close all pooled sessions. Idempotent.
    pub async fn close(&self) -> LedgerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pool.close_all().await
    }

    pub async fn stats(&self) -> PoolStats {
        self.pool.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use serde_json::{Value, json};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn gateway(ledger: &MemoryLedger, config: SessionConfig) -> SessionGateway {
        SessionGateway::new(Arc::new(ledger.clone()), config)
    }

    struct Statements(Vec<&'static str>);

    #[async_trait]
    impl UnitOfWork for Statements {
        type Output = Vec<Value>;

        async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<Vec<Value>> {
            let mut last = Vec::new();
            for statement in &self.0 {
                last = txn.execute(statement, &[]).await?;
            }
            Ok(last)
        }
    }

    /// Reads the table, lets a rival commit in between, then writes
    struct Contended {
        ledger: MemoryLedger,
        attempts: AtomicU32,
        conflicts: u32,
    }

    #[async_trait]
    impl UnitOfWork for Contended {
        type Output = ();

        async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<()> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            txn.execute("SELECT * FROM Counter", &[]).await?;
            if attempt < self.conflicts {
                let rival = self.ledger.start_session().await?;
                let mut rival_txn = rival.begin().await?;
                rival_txn.execute("INSERT INTO Counter VALUE {'rival': ?}", &[json!(attempt)]).await?;
                rival_txn.commit().await?;
            }
            txn.execute("INSERT INTO Counter VALUE {'mine': true}", &[]).await?;
            Ok(())
        }
    }

    struct Stall;

    #[async_trait]
    impl UnitOfWork for Stall {
        type Output = ();

        async fn apply(&self, txn: &mut dyn LedgerTransaction) -> LedgerResult<()> {
            txn.execute("CREATE TABLE Stalled", &[]).await?;
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    fn fast_retries(retry_limit: u32) -> SessionConfig {
        SessionConfig {
            retry_limit,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_commit_on_success() {
        let ledger = MemoryLedger::new("gw");
        let gateway = gateway(&ledger, SessionConfig::default());

        gateway
            .execute(&Statements(vec!["CREATE TABLE T", "INSERT INTO T VALUE {'a': 1}"]))
            .await
            .unwrap();
        assert_eq!(ledger.documents("T").await.unwrap(), vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_abort_on_failure() {
        let ledger = MemoryLedger::new("gw");
        let gateway = gateway(&ledger, SessionConfig::default());

        let result = gateway
            .execute(&Statements(vec!["CREATE TABLE T", "DROP TABLE Missing"]))
            .await;
        assert!(matches!(result, Err(LedgerError::TableNotFound(_))));
        assert!(ledger.table_names().await.is_empty());
        assert_eq!(gateway.stats().await.available_sessions, 1);
    }

    #[tokio::test]
    async fn test_occ_conflict_is_retried() {
        let ledger = MemoryLedger::new("gw");
        let gateway = gateway(&ledger, fast_retries(4));
        gateway.execute(&Statements(vec!["CREATE TABLE Counter"])).await.unwrap();

        let work = Contended { ledger: ledger.clone(), attempts: AtomicU32::new(0), conflicts: 2 };
        gateway.execute(&work).await.unwrap();

        assert_eq!(work.attempts.load(Ordering::SeqCst), 3);
        let docs = ledger.documents("Counter").await.unwrap();
        assert_eq!(docs.iter().filter(|d| d.get("mine").is_some()).count(), 1);
    }

    #[tokio::test]
    async fn test_retry_limit_exhausted() {
        let ledger = MemoryLedger::new("gw");
        let gateway = gateway(&ledger, fast_retries(1));
        gateway.execute(&Statements(vec!["CREATE TABLE Counter"])).await.unwrap();

        let work = Contended { ledger: ledger.clone(), attempts: AtomicU32::new(0), conflicts: 10 };
        let err = gateway.execute(&work).await.unwrap_err();

        assert!(matches!(err, LedgerError::OccConflict(_)));
        assert_eq!(work.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timed_out_attempt_is_not_committed() {
        let ledger = MemoryLedger::new("gw");
        let config = SessionConfig {
            transaction_timeout: Duration::from_millis(50),
            ..SessionConfig::default()
        };
        let gateway = gateway(&ledger, config);

        let err = gateway.execute(&Stall).await.unwrap_err();
        assert!(matches!(err, LedgerError::Timeout(_)));
        assert!(ledger.table_names().await.is_empty());
        assert_eq!(gateway.stats().await.total_sessions, 0);
    }

    #[tokio::test]
    async fn test_closed_gateway_rejects_work() {
        let ledger = MemoryLedger::new("gw");
        let gateway = gateway(&ledger, SessionConfig::default());
        gateway.execute(&Statements(vec!["CREATE TABLE T"])).await.unwrap();

        gateway.close().await.unwrap();
        gateway.close().await.unwrap();
        assert!(gateway.is_closed());
        assert!(matches!(
            gateway.execute(&Statements(vec!["SELECT * FROM T"])).await,
            Err(LedgerError::SessionClosed)
        ));
    }
}
