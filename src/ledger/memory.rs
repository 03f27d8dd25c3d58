// ============================================================================
// In-process Ledger
// ============================================================================
//
// A ledger kept in memory, optionally backed by a journal file:
// - Tables of JSON documents keyed by generated document ids
// - `information_schema.user_tables` lists the active tables
// - Transactions copy tables on first touch and are validated at commit
//   against the table versions they observed (optimistic concurrency)
// - Each committed write transaction becomes one hash-chained journal block
//
// ============================================================================

use super::journal::{Journal, JournalWriter};
use super::statement::{self, Condition, Statement};
use super::{CommitDigest, LedgerClient, LedgerConnector, LedgerSession, LedgerTransaction};
use crate::connection::config::Config;
use crate::core::{LedgerError, LedgerResult};
use crate::transaction::{Change, Transaction, TransactionId};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Virtual table listing active tables
pub const USER_TABLES: &str = "information_schema.user_tables";

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone)]
struct TableState {
    table_id: String,
    indexes: Vec<String>,
    documents: BTreeMap<String, Value>,
}

impl TableState {
    fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            indexes: Vec::new(),
            documents: BTreeMap::new(),
        }
    }

    fn catalog_row(&self, name: &str) -> Value {
        json!({
            "name": name,
            "tableId": self.table_id,
            "status": "ACTIVE",
            "indexes": self.indexes.iter().map(|f| json!({ "expr": format!("[{}]", f) })).collect::<Vec<_>>(),
        })
    }

    fn matching(&self, filter: &[(String, Value)]) -> Vec<String> {
        self.documents
            .iter()
            .filter(|(_, doc)| matches_filter(doc, filter))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

fn matches_filter(doc: &Value, filter: &[(String, Value)]) -> bool {
    filter.iter().all(|(field, expected)| doc.get(field) == Some(expected))
}

/// Apply one change to the slot of the table it names.
///
/// Errors leave the slot untouched.
fn apply_change(slot: &mut Option<TableState>, change: &Change) -> LedgerResult<()> {
    let name = change.table_name();
    match change {
        Change::CreateTable { table_id, .. } => {
            if slot.is_some() {
                return Err(LedgerError::TableExists(name.to_string()));
            }
            *slot = Some(TableState::new(table_id));
        }
        Change::DropTable { .. } => {
            if slot.is_none() {
                return Err(LedgerError::TableNotFound(name.to_string()));
            }
            *slot = None;
        }
        Change::CreateIndex { field, .. } => {
            let table = slot.as_mut().ok_or_else(|| LedgerError::TableNotFound(name.to_string()))?;
            if table.indexes.contains(field) {
                return Err(LedgerError::IndexExists {
                    table: name.to_string(),
                    field: field.clone(),
                });
            }
            table.indexes.push(field.clone());
        }
        Change::InsertDocument { document_id, data, .. } => {
            let table = slot.as_mut().ok_or_else(|| LedgerError::TableNotFound(name.to_string()))?;
            table.documents.insert(document_id.clone(), data.clone());
        }
        Change::UpdateDocument { document_id, data, .. } => {
            let table = slot.as_mut().ok_or_else(|| LedgerError::TableNotFound(name.to_string()))?;
            let doc = table.documents.get_mut(document_id).ok_or_else(|| {
                LedgerError::DocumentNotFound {
                    table: name.to_string(),
                    document_id: document_id.clone(),
                }
            })?;
            *doc = data.clone();
        }
        Change::DeleteDocument { document_id, .. } => {
            let table = slot.as_mut().ok_or_else(|| LedgerError::TableNotFound(name.to_string()))?;
            if table.documents.remove(document_id).is_none() {
                return Err(LedgerError::DocumentNotFound {
                    table: name.to_string(),
                    document_id: document_id.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Default)]
struct LedgerState {
    tables: HashMap<String, TableState>,
    /// Journal sequence of the last commit touching each table name
    versions: HashMap<String, u64>,
    journal: Journal,
    writer: Option<JournalWriter>,
}

impl LedgerState {
    fn version_of(&self, name: &str) -> u64 {
        self.versions.get(name).copied().unwrap_or(0)
    }

    /// Rebuild tables from already verified journal blocks
    fn replay(&mut self, journal: Journal) -> LedgerResult<()> {
        for block in journal.blocks() {
            for change in &block.changes {
                let name = change.table_name().to_string();
                let mut slot = self.tables.remove(&name);
                let result = apply_change(&mut slot, change);
                if let Some(table) = slot {
                    self.tables.insert(name.clone(), table);
                }
                result.map_err(|e| {
                    LedgerError::JournalError(format!("replay of block {} failed: {}", block.sequence, e))
                })?;
                self.versions.insert(name, block.sequence);
                if change.is_ddl() {
                    self.versions.insert(USER_TABLES.to_string(), block.sequence);
                }
            }
        }
        self.journal = journal;
        Ok(())
    }
}

struct Shared {
    name: String,
    state: RwLock<LedgerState>,
}

/// An in-process ledger
///
/// Cloning yields another handle on the same ledger.
#[derive(Clone)]
pub struct MemoryLedger {
    shared: Arc<Shared>,
}

impl MemoryLedger {
    /// Create an empty, memory-only ledger
    pub fn new(name: &str) -> Self {
        Self::with_state(name, LedgerState::default())
    }

    fn with_state(name: &str, state: LedgerState) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: RwLock::new(state),
            }),
        }
    }

    /// Open a ledger persisted at `path`, replaying its journal
    ///
    /// The file is created when missing. A journal whose hash chain does not
    /// verify is refused.
    pub fn open_file<P: AsRef<Path>>(name: &str, path: P) -> LedgerResult<Self> {
        let path = path.as_ref();
        let journal = Journal::from_blocks(JournalWriter::read_all(path)?)?;
        let blocks = journal.len();

        let mut state = LedgerState::default();
        state.replay(journal)?;
        state.writer = Some(JournalWriter::open(path)?);

        log::info!(
            "Opened ledger '{}' from {} ({} journal block(s))",
            name,
            path.display(),
            blocks
        );
        Ok(Self::with_state(name, state))
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Copy of the journal
    pub async fn journal(&self) -> Journal {
        self.shared.state.read().await.journal.clone()
    }

    /// Verify the hash chain and return the tip digest
    pub async fn verify(&self) -> LedgerResult<CommitDigest> {
        let state = self.shared.state.read().await;
        state.journal.verify()?;
        let (transaction_id, sequence, hash) = match state.journal.blocks().last() {
            Some(block) => (block.transaction_id.clone(), block.sequence, block.hash.clone()),
            None => (String::new(), 0, state.journal.tip_hash().to_string()),
        };
        Ok(CommitDigest { transaction_id, sequence, hash })
    }

    /// Names of the active tables, sorted
    pub async fn table_names(&self) -> Vec<String> {
        let state = self.shared.state.read().await;
        let mut names: Vec<String> = state.tables.keys().cloned().collect();
        names.sort();
        names
    }

    /// Committed documents of an active table
    pub async fn documents(&self, table: &str) -> Option<Vec<Value>> {
        let state = self.shared.state.read().await;
        state.tables.get(table).map(|t| t.documents.values().cloned().collect())
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    fn ledger_name(&self) -> &str {
        self.name()
    }

    async fn start_session(&self) -> LedgerResult<Box<dyn LedgerSession>> {
        let session = MemorySession {
            id: new_id(),
            ledger: self.clone(),
            open: AtomicBool::new(true),
            in_transaction: Arc::new(AtomicBool::new(false)),
        };
        log::debug!("Started session {} on ledger '{}'", session.id, self.name());
        Ok(Box::new(session))
    }
}

/// A session on a [`MemoryLedger`]; one transaction at a time
pub struct MemorySession {
    id: String,
    ledger: MemoryLedger,
    open: AtomicBool,
    in_transaction: Arc<AtomicBool>,
}

#[async_trait]
impl LedgerSession for MemorySession {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>> {
        if !self.is_open() {
            return Err(LedgerError::SessionClosed);
        }
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(LedgerError::ExecutionError(format!(
                "session {} already has an active transaction",
                self.id
            )));
        }

        let txn = Transaction::new(TransactionId::new());
        Ok(Box::new(MemoryTransaction {
            id: txn.id().to_string(),
            txn,
            ledger: self.ledger.clone(),
            working: HashMap::new(),
            modified: HashSet::new(),
            in_transaction: Arc::clone(&self.in_transaction),
        }))
    }

    async fn close(&self) -> LedgerResult<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            log::debug!("Closed session {}", self.id);
        }
        Ok(())
    }
}

/// A transaction on a [`MemoryLedger`]
pub struct MemoryTransaction {
    id: String,
    txn: Transaction,
    ledger: MemoryLedger,
    /// Tables touched so far; `None` is an absent or dropped table
    working: HashMap<String, Option<TableState>>,
    modified: HashSet<String>,
    in_transaction: Arc<AtomicBool>,
}

impl MemoryTransaction {
    fn slot(&mut self, state: &LedgerState, table: &str) -> &mut Option<TableState> {
        let txn = &mut self.txn;
        self.working.entry(table.to_string()).or_insert_with(|| {
            txn.record_read(table, state.version_of(table));
            state.tables.get(table).cloned()
        })
    }

    fn existing(&mut self, state: &LedgerState, table: &str) -> LedgerResult<&mut TableState> {
        self.slot(state, table)
            .as_mut()
            .ok_or_else(|| LedgerError::TableNotFound(table.to_string()))
    }

    fn record(&mut self, state: &LedgerState, change: Change) -> LedgerResult<()> {
        let table = change.table_name().to_string();
        apply_change(self.slot(state, &table), &change)?;
        self.modified.insert(table);
        self.txn.record_change(change)
    }

    fn user_tables(&mut self, state: &LedgerState, filter: &[(String, Value)]) -> Vec<Value> {
        self.txn.record_read(USER_TABLES, state.version_of(USER_TABLES));

        let names: BTreeSet<&String> = state.tables.keys().chain(self.working.keys()).collect();
        names
            .into_iter()
            .filter_map(|name| {
                let table = match self.working.get(name) {
                    Some(slot) => slot.as_ref(),
                    None => state.tables.get(name),
                };
                table.map(|t| t.catalog_row(name))
            })
            .filter(|row| matches_filter(row, filter))
            .collect()
    }

    fn run(&mut self, state: &LedgerState, statement: Statement, params: &[Value]) -> LedgerResult<Vec<Value>> {
        let table = statement.table().to_string();
        if table == USER_TABLES && !matches!(statement, Statement::Select { .. }) {
            return Err(LedgerError::ExecutionError(format!("{} is read-only", USER_TABLES)));
        }

        match statement {
            Statement::CreateTable { table } => {
                if table.contains('.') {
                    return Err(LedgerError::ExecutionError(format!("invalid table name '{}'", table)));
                }
                let table_id = new_id();
                self.record(state, Change::CreateTable { table, table_id: table_id.clone() })?;
                Ok(vec![json!({ "tableId": table_id })])
            }
            Statement::DropTable { table } => {
                let table_id = self.existing(state, &table)?.table_id.clone();
                self.record(state, Change::DropTable { table, table_id: table_id.clone() })?;
                Ok(vec![json!({ "tableId": table_id })])
            }
            Statement::CreateIndex { table, field } => {
                let table_id = self.existing(state, &table)?.table_id.clone();
                self.record(state, Change::CreateIndex { table, field })?;
                Ok(vec![json!({ "tableId": table_id })])
            }
            Statement::Insert { table, documents } => {
                let mut ids = Vec::with_capacity(documents.len());
                for expr in documents {
                    let data = expr.bind(params)?;
                    if !data.is_object() {
                        return Err(LedgerError::ExecutionError(format!(
                            "documents inserted into '{}' must be structs",
                            table
                        )));
                    }
                    let document_id = new_id();
                    self.record(
                        state,
                        Change::InsertDocument { table: table.clone(), document_id: document_id.clone(), data },
                    )?;
                    ids.push(json!({ "documentId": document_id }));
                }
                Ok(ids)
            }
            Statement::Select { table, filter } => {
                let filter = bind_filter(&filter, params)?;
                if table == USER_TABLES {
                    return Ok(self.user_tables(state, &filter));
                }
                let existing = self.existing(state, &table)?;
                Ok(existing
                    .documents
                    .values()
                    .filter(|doc| matches_filter(doc, &filter))
                    .cloned()
                    .collect())
            }
            Statement::Update { table, assignments, filter } => {
                let filter = bind_filter(&filter, params)?;
                let mut values = Vec::with_capacity(assignments.len());
                for (field, expr) in &assignments {
                    values.push((field.clone(), expr.bind(params)?));
                }

                let existing = self.existing(state, &table)?;
                let mut updates = Vec::new();
                for document_id in existing.matching(&filter) {
                    let mut data = existing.documents.get(&document_id).cloned().unwrap_or_else(|| json!({}));
                    if let Some(object) = data.as_object_mut() {
                        for (field, value) in &values {
                            object.insert(field.clone(), value.clone());
                        }
                    }
                    updates.push((document_id, data));
                }

                let mut ids = Vec::with_capacity(updates.len());
                for (document_id, data) in updates {
                    ids.push(json!({ "documentId": document_id }));
                    self.record(state, Change::UpdateDocument { table: table.clone(), document_id, data })?;
                }
                Ok(ids)
            }
            Statement::Delete { table, filter } => {
                let filter = bind_filter(&filter, params)?;
                let matching = self.existing(state, &table)?.matching(&filter);

                let mut ids = Vec::with_capacity(matching.len());
                for document_id in matching {
                    ids.push(json!({ "documentId": document_id }));
                    self.record(state, Change::DeleteDocument { table: table.clone(), document_id })?;
                }
                Ok(ids)
            }
        }
    }

    fn release(&self) {
        self.in_transaction.store(false, Ordering::SeqCst);
    }
}

fn bind_filter(filter: &[Condition], params: &[Value]) -> LedgerResult<Vec<(String, Value)>> {
    filter
        .iter()
        .map(|c| Ok((c.field.clone(), c.value.bind(params)?)))
        .collect()
}

#[async_trait]
impl LedgerTransaction for MemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    async fn execute(&mut self, statement: &str, params: &[Value]) -> LedgerResult<Vec<Value>> {
        if !self.txn.state().is_active() {
            return Err(LedgerError::TransactionClosed(self.id.clone()));
        }

        let parsed = statement::parse(statement)?;
        if parsed.placeholders != params.len() {
            return Err(LedgerError::ParameterMismatch {
                expected: parsed.placeholders,
                actual: params.len(),
            });
        }

        let ledger = self.ledger.clone();
        let state = ledger.shared.state.read().await;
        let result = self.run(&state, parsed.statement, params)?;
        self.txn.record_statement(statement)?;
        Ok(result)
    }

    async fn commit(mut self: Box<Self>) -> LedgerResult<CommitDigest> {
        let ledger = self.ledger.clone();
        let mut state = ledger.shared.state.write().await;

        let stale = self
            .txn
            .reads()
            .iter()
            .find(|(table, seen)| state.version_of(table) != **seen)
            .map(|(table, _)| table.clone());
        if let Some(table) = stale {
            let reason = format!("'{}' changed since {} read it", table, self.id);
            self.txn.abort()?;
            return Err(LedgerError::OccConflict(reason));
        }

        if self.txn.changes().is_empty() {
            self.txn.commit()?;
            return Ok(CommitDigest {
                transaction_id: self.id.clone(),
                sequence: state.journal.tip_sequence(),
                hash: state.journal.tip_hash().to_string(),
            });
        }

        let block = state.journal.seal(
            &self.id,
            self.txn.statements().to_vec(),
            self.txn.changes().to_vec(),
        )?;
        if let Some(writer) = state.writer.as_mut() {
            writer.append(&block)?;
        }
        state.journal.append(block.clone())?;

        let ddl = self.txn.changes().iter().any(Change::is_ddl);
        for table in self.modified.drain() {
            match self.working.remove(&table).flatten() {
                Some(contents) => state.tables.insert(table.clone(), contents),
                None => state.tables.remove(&table),
            };
            state.versions.insert(table, block.sequence);
        }
        if ddl {
            state.versions.insert(USER_TABLES.to_string(), block.sequence);
        }

        self.txn.commit()?;
        log::debug!(
            "Committed {} as block {} on ledger '{}'",
            self.id,
            block.sequence,
            ledger.name()
        );
        Ok(block.digest())
    }

    async fn abort(mut self: Box<Self>) -> LedgerResult<()> {
        self.txn.abort()?;
        self.working.clear();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.txn.state().is_active() {
            log::debug!("Transaction {} dropped without commit", self.id);
        }
        self.release();
    }
}

type LedgerKey = (String, String);

/// Connector resolving `(region, ledger)` to in-process ledgers
///
/// Clones share the same set of ledgers.
#[derive(Clone)]
pub struct MemoryConnector {
    ledgers: Arc<Mutex<HashMap<LedgerKey, MemoryLedger>>>,
    credentials: Option<(String, String)>,
    auto_create: bool,
    data_dir: Option<PathBuf>,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConnector {
    /// Connector that creates ledgers on first connect
    pub fn new() -> Self {
        Self {
            ledgers: Arc::new(Mutex::new(HashMap::new())),
            credentials: None,
            auto_create: true,
            data_dir: None,
        }
    }

    /// Only connect to ledgers created with [`MemoryConnector::create_ledger`]
    /// or found in the data directory
    pub fn strict(mut self) -> Self {
        self.auto_create = false;
        self
    }

    /// Require this access key and secret
    pub fn with_credentials(mut self, access_key_id: &str, secret: &str) -> Self {
        self.credentials = Some((access_key_id.to_string(), secret.to_string()));
        self
    }

    /// Persist ledgers as `<dir>/<region>/<ledger>.journal`
    pub fn with_data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    fn journal_path(&self, region: &str, name: &str) -> Option<PathBuf> {
        self.data_dir
            .as_ref()
            .map(|dir| dir.join(region).join(format!("{}.journal", name)))
    }

    fn make_ledger(&self, region: &str, name: &str) -> LedgerResult<MemoryLedger> {
        match self.journal_path(region, name) {
            Some(path) => MemoryLedger::open_file(name, path),
            None => Ok(MemoryLedger::new(name)),
        }
    }

    /// Provision a ledger; returns the existing one if already present
    pub async fn create_ledger(&self, region: &str, name: &str) -> LedgerResult<MemoryLedger> {
        let mut ledgers = self.ledgers.lock().await;
        let key = (region.to_string(), name.to_string());
        if let Some(ledger) = ledgers.get(&key) {
            return Ok(ledger.clone());
        }
        let ledger = self.make_ledger(region, name)?;
        ledgers.insert(key, ledger.clone());
        Ok(ledger)
    }

    pub async fn ledger(&self, region: &str, name: &str) -> Option<MemoryLedger> {
        let ledgers = self.ledgers.lock().await;
        ledgers.get(&(region.to_string(), name.to_string())).cloned()
    }
}

#[async_trait]
impl LedgerConnector for MemoryConnector {
    async fn connect(&self, config: &Config) -> LedgerResult<Arc<dyn LedgerClient>> {
        if let Some((key, secret)) = &self.credentials {
            if *key != config.access_key_id || *secret != config.access_key_secret {
                return Err(LedgerError::AccessDenied(format!(
                    "invalid credentials for access key '{}'",
                    config.access_key_id
                )));
            }
        }

        if let Some(ledger) = self.ledger(&config.region, &config.ledger_name).await {
            return Ok(Arc::new(ledger));
        }

        let persisted = self
            .journal_path(&config.region, &config.ledger_name)
            .is_some_and(|path| path.exists());
        if !self.auto_create && !persisted {
            return Err(LedgerError::LedgerNotFound(format!(
                "{} in {}",
                config.ledger_name, config.region
            )));
        }

        let ledger = self.create_ledger(&config.region, &config.ledger_name).await?;
        Ok(Arc::new(ledger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn begin(ledger: &MemoryLedger) -> Box<dyn LedgerTransaction> {
        let session = ledger.start_session().await.unwrap();
        session.begin().await.unwrap()
    }

    async fn exec(ledger: &MemoryLedger, statements: &[&str]) -> CommitDigest {
        let mut txn = begin(ledger).await;
        for statement in statements {
            txn.execute(statement, &[]).await.unwrap();
        }
        txn.commit().await.unwrap()
    }

    #[tokio::test]
    async fn test_create_insert_select() {
        let ledger = MemoryLedger::new("test");
        exec(&ledger, &["CREATE TABLE Users", "INSERT INTO Users VALUE {'name': 'alice', 'age': 30}"]).await;

        let mut txn = begin(&ledger).await;
        let rows = txn.execute("SELECT * FROM Users WHERE name = ?", &[json!("alice")]).await.unwrap();
        assert_eq!(rows, vec![json!({"name": "alice", "age": 30})]);
        txn.commit().await.unwrap();

        assert_eq!(ledger.table_names().await, vec!["Users".to_string()]);
    }

    #[tokio::test]
    async fn test_uncommitted_changes_are_invisible() {
        let ledger = MemoryLedger::new("test");
        exec(&ledger, &["CREATE TABLE Users"]).await;

        let mut txn = begin(&ledger).await;
        txn.execute("INSERT INTO Users VALUE {'name': 'bob'}", &[]).await.unwrap();
        assert_eq!(txn.execute("SELECT * FROM Users", &[]).await.unwrap().len(), 1);
        txn.abort().await.unwrap();

        assert_eq!(ledger.documents("Users").await.unwrap().len(), 0);
        assert_eq!(ledger.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_is_never_committed() {
        let ledger = MemoryLedger::new("test");
        {
            let mut txn = begin(&ledger).await;
            txn.execute("CREATE TABLE Ghost", &[]).await.unwrap();
        }
        assert!(ledger.table_names().await.is_empty());
        assert!(ledger.journal().await.is_empty());
    }

    #[tokio::test]
    async fn test_occ_conflict() {
        let ledger = MemoryLedger::new("test");
        exec(&ledger, &["CREATE TABLE Counters"]).await;

        let mut first = begin(&ledger).await;
        let mut second = begin(&ledger).await;
        first.execute("SELECT * FROM Counters", &[]).await.unwrap();
        second.execute("SELECT * FROM Counters", &[]).await.unwrap();
        first.execute("INSERT INTO Counters VALUE {'n': 1}", &[]).await.unwrap();
        second.execute("INSERT INTO Counters VALUE {'n': 2}", &[]).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_retriable(), "unexpected error: {}", err);

        assert_eq!(ledger.documents("Counters").await.unwrap(), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_disjoint_tables_do_not_conflict() {
        let ledger = MemoryLedger::new("test");
        exec(&ledger, &["CREATE TABLE A", "CREATE TABLE B"]).await;

        let mut first = begin(&ledger).await;
        let mut second = begin(&ledger).await;
        first.execute("INSERT INTO A VALUE {'x': 1}", &[]).await.unwrap();
        second.execute("INSERT INTO B VALUE {'x': 2}", &[]).await.unwrap();

        first.commit().await.unwrap();
        second.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_user_tables_reflects_own_ddl() {
        let ledger = MemoryLedger::new("test");
        exec(&ledger, &["CREATE TABLE Keep", "CREATE TABLE Gone"]).await;

        let mut txn = begin(&ledger).await;
        txn.execute("DROP TABLE Gone", &[]).await.unwrap();
        txn.execute("CREATE TABLE Fresh", &[]).await.unwrap();
        let rows = txn.execute(&format!("SELECT * FROM {}", USER_TABLES), &[]).await.unwrap();
        let names: Vec<&str> = rows.iter().filter_map(|r| r["name"].as_str()).collect();
        assert_eq!(names, vec!["Fresh", "Keep"]);

        let filtered = txn
            .execute(&format!("SELECT * FROM {} WHERE name = ?", USER_TABLES), &[json!("Keep")])
            .await
            .unwrap();
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0]["status"], json!("ACTIVE"));
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let ledger = MemoryLedger::new("test");
        exec(
            &ledger,
            &[
                "CREATE TABLE Accounts",
                "INSERT INTO Accounts << {'id': 'a', 'balance': 1}, {'id': 'b', 'balance': 2} >>",
            ],
        )
        .await;

        let mut txn = begin(&ledger).await;
        let updated = txn
            .execute("UPDATE Accounts SET balance = ? WHERE id = 'a'", &[json!(10)])
            .await
            .unwrap();
        assert_eq!(updated.len(), 1);
        let deleted = txn.execute("DELETE FROM Accounts WHERE id = 'b'", &[]).await.unwrap();
        assert_eq!(deleted.len(), 1);
        txn.commit().await.unwrap();

        assert_eq!(
            ledger.documents("Accounts").await.unwrap(),
            vec![json!({"id": "a", "balance": 10})]
        );
    }

    #[tokio::test]
    async fn test_statement_errors() {
        let ledger = MemoryLedger::new("test");
        exec(&ledger, &["CREATE TABLE Users", "CREATE INDEX ON Users (email)"]).await;

        let mut txn = begin(&ledger).await;
        assert!(matches!(
            txn.execute("CREATE TABLE Users", &[]).await,
            Err(LedgerError::TableExists(_))
        ));
        assert!(matches!(
            txn.execute("SELECT * FROM Missing", &[]).await,
            Err(LedgerError::TableNotFound(_))
        ));
        assert!(matches!(
            txn.execute("CREATE INDEX ON Users (email)", &[]).await,
            Err(LedgerError::IndexExists { .. })
        ));
        assert!(matches!(
            txn.execute("INSERT INTO Users VALUE ?", &[]).await,
            Err(LedgerError::ParameterMismatch { expected: 1, actual: 0 })
        ));
        assert!(txn.execute("INSERT INTO Users VALUE 5", &[]).await.is_err());
        assert!(txn.execute(&format!("DELETE FROM {}", USER_TABLES), &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_read_only_commit_appends_nothing() {
        let ledger = MemoryLedger::new("test");
        let created = exec(&ledger, &["CREATE TABLE T"]).await;

        let digest = exec(&ledger, &["SELECT * FROM T"]).await;
        assert_eq!(digest.sequence, created.sequence);
        assert_eq!(digest.hash, created.hash);
        assert_eq!(ledger.journal().await.len(), 1);
    }

    #[tokio::test]
    async fn test_one_transaction_per_session() {
        let ledger = MemoryLedger::new("test");
        let session = ledger.start_session().await.unwrap();

        let txn = session.begin().await.unwrap();
        assert!(session.begin().await.is_err());
        txn.abort().await.unwrap();
        assert!(session.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_begin() {
        let ledger = MemoryLedger::new("test");
        let session = ledger.start_session().await.unwrap();
        session.close().await.unwrap();
        session.close().await.unwrap();

        assert!(!session.is_open());
        assert!(matches!(session.begin().await, Err(LedgerError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_file_ledger_replays_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.journal");

        {
            let ledger = MemoryLedger::open_file("disk", &path).unwrap();
            exec(&ledger, &["CREATE TABLE Users", "INSERT INTO Users VALUE {'name': 'carol'}"]).await;
            exec(&ledger, &["DELETE FROM Users", "INSERT INTO Users VALUE {'name': 'dave'}"]).await;
        }

        let reopened = MemoryLedger::open_file("disk", &path).unwrap();
        assert_eq!(reopened.documents("Users").await.unwrap(), vec![json!({"name": "dave"})]);
        assert_eq!(reopened.verify().await.unwrap().sequence, 2);

        exec(&reopened, &["INSERT INTO Users VALUE {'name': 'erin'}"]).await;
        assert_eq!(reopened.journal().await.len(), 3);
    }

    #[tokio::test]
    async fn test_connector_credentials_and_strict_mode() {
        let connector = MemoryConnector::new().strict().with_credentials("AKIA", "secret");
        let config = Config::new("AKIA", "secret", "us-east-1", "prod");

        assert!(matches!(
            connector.connect(&config).await,
            Err(LedgerError::LedgerNotFound(_))
        ));

        connector.create_ledger("us-east-1", "prod").await.unwrap();
        let client = connector.connect(&config).await.unwrap();
        assert_eq!(client.ledger_name(), "prod");

        let wrong = Config::new("AKIA", "nope", "us-east-1", "prod");
        assert!(matches!(connector.connect(&wrong).await, Err(LedgerError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_connector_shares_ledgers_between_clones() {
        let connector = MemoryConnector::new();
        let config = Config::new("k", "s", "eu-west-1", "shared");

        let first = connector.clone().connect(&config).await.unwrap();
        let session = first.start_session().await.unwrap();
        let mut txn = session.begin().await.unwrap();
        txn.execute("CREATE TABLE T", &[]).await.unwrap();
        txn.commit().await.unwrap();

        let ledger = connector.ledger("eu-west-1", "shared").await.unwrap();
        assert_eq!(ledger.table_names().await, vec!["T".to_string()]);
    }
}
