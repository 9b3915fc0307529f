//! In-memory ledger service.
//!
//! [`InMemoryLedger`] implements [`Communicator`] on top of a small
//! document store with optimistic concurrency control, so the driver can be
//! exercised end to end without a network.
//!
//! ## Statements
//!
//! | statement | parameters |
//! |---|---|
//! | `CREATE TABLE t` | none |
//! | `INSERT INTO t ?, ?` | key, document |
//! | `UPDATE t SET ? WHERE id = ?` | document, key |
//! | `DELETE FROM t WHERE id = ?` | key |
//! | `SELECT * FROM t` | none |
//! | `SELECT * FROM t WHERE id = ?` | key |
//! | [`LIST_TABLES_STATEMENT`] | none |
//!
//! Keys are CBOR-encoded strings; documents are stored as given. DML
//! statements return one row per affected document holding its key.
//!
//! ## Concurrency
//!
//! Reads record the version they observed (per document for point reads,
//! per table for scans). Writes are buffered in the transaction and only
//! applied at commit, after every recorded version has been re-checked under
//! the ledger lock. A stale read fails the commit with an OCC conflict and
//! closes the transaction; the session stays usable.

use ledger_codec::{CborCodec, Codec, WireValue};
use ledger_driver::{
    CommitDigest, Communicator, DriverError, DriverResult, IoUsage, Page, PageToken,
    SessionToken, TimingInformation, TransactionId, LIST_TABLES_STATEMENT,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default number of rows per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Configuration of an [`InMemoryLedger`].
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Rows per result page.
    pub page_size: usize,
    /// Delay added to every statement.
    pub statement_latency: Duration,
    /// Sessions older than this are reported invalid.
    pub session_ttl: Option<Duration>,
    /// Whether commit digests are checked.
    pub verify_digests: bool,
}

impl LedgerConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            statement_latency: Duration::ZERO,
            session_ttl: None,
            verify_digests: true,
        }
    }

    /// Sets the page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Sets the per-statement latency.
    pub fn with_statement_latency(mut self, latency: Duration) -> Self {
        self.statement_latency = latency;
        self
    }

    /// Sets the session time to live.
    pub fn with_session_ttl(mut self, ttl: Duration) -> Self {
        self.session_ttl = Some(ttl);
        self
    }

    /// Enables or disables commit digest verification.
    pub fn with_digest_verification(mut self, enabled: bool) -> Self {
        self.verify_digests = enabled;
        self
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Service operations where faults can be injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    /// `start_session`
    StartSession,
    /// `start_transaction`
    StartTransaction,
    /// `execute_statement`
    ExecuteStatement,
    /// `fetch_page`
    FetchPage,
    /// `commit`
    Commit,
    /// `abort`
    Abort,
    /// `end_session`
    EndSession,
}

/// A failure the service reports instead of doing the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Optimistic-concurrency conflict.
    OccConflict,
    /// The session is unknown to the service.
    InvalidSession,
    /// The connection was reset.
    ConnectionReset,
    /// The request timed out.
    Timeout,
    /// The service is throttling.
    CapacityExceeded,
    /// HTTP 503.
    ServiceUnavailable,
    /// The request was rejected.
    BadRequest,
    /// The caller lacks permission.
    AccessDenied,
}

impl Fault {
    /// The driver error this fault is reported as.
    pub fn to_error(self) -> DriverError {
        match self {
            Fault::OccConflict => DriverError::occ_conflict("injected occ conflict"),
            Fault::InvalidSession => DriverError::invalid_session("injected invalid session"),
            Fault::ConnectionReset => DriverError::transport_retryable("connection reset by peer"),
            Fault::Timeout => DriverError::Timeout,
            Fault::CapacityExceeded => DriverError::CapacityExceeded {
                message: "rate exceeded".into(),
            },
            Fault::ServiceUnavailable => DriverError::Service {
                status: 503,
                message: "service unavailable".into(),
            },
            Fault::BadRequest => DriverError::bad_request("injected bad request"),
            Fault::AccessDenied => DriverError::access_denied("injected access denied"),
        }
    }
}

/// Counters kept by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerStats {
    /// Sessions started.
    pub sessions_started: u64,
    /// Sessions ended by the client.
    pub sessions_ended: u64,
    /// Sessions dropped because they expired.
    pub sessions_expired: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted by the client.
    pub transactions_aborted: u64,
    /// Commits rejected with an OCC conflict.
    pub occ_conflicts: u64,
    /// Commits rejected because of a digest mismatch.
    pub digest_mismatches: u64,
    /// Statements executed.
    pub statements_executed: u64,
}

#[derive(Debug)]
struct StoredDocument {
    value: WireValue,
    version: u64,
}

#[derive(Debug, Default)]
struct Table {
    documents: BTreeMap<String, StoredDocument>,
    version: u64,
}

#[derive(Debug, Clone)]
enum Read {
    Document {
        table: String,
        key: String,
        version: Option<u64>,
    },
    Scan {
        table: String,
        version: u64,
    },
}

#[derive(Debug, Clone)]
enum Write {
    CreateTable(String),
    Put {
        table: String,
        key: String,
        value: WireValue,
    },
    Delete {
        table: String,
        key: String,
    },
}

#[derive(Debug)]
struct OpenTransaction {
    id: TransactionId,
    digest: CommitDigest,
    reads: Vec<Read>,
    writes: Vec<Write>,
    pending_pages: HashMap<PageToken, Vec<WireValue>>,
}

impl OpenTransaction {
    fn new(id: TransactionId) -> Self {
        let digest = CommitDigest::seed(&id);
        Self {
            id,
            digest,
            reads: Vec::new(),
            writes: Vec::new(),
            pending_pages: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    started: Instant,
    transaction: Option<OpenTransaction>,
}

#[derive(Debug, Default)]
struct LedgerState {
    tables: BTreeMap<String, Table>,
    sessions: HashMap<SessionToken, SessionState>,
    commit_sequence: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Statement {
    ListTables,
    CreateTable(String),
    Insert(String),
    Update(String),
    Delete(String),
    SelectAll(String),
    SelectById(String),
}

impl Statement {
    fn parse(text: &str) -> DriverResult<Self> {
        if text.trim() == LIST_TABLES_STATEMENT {
            return Ok(Statement::ListTables);
        }

        let normalized = text.replace(',', " , ");
        let words: Vec<&str> = normalized.split_whitespace().collect();
        let upper: Vec<String> = words.iter().map(|w| w.to_ascii_uppercase()).collect();
        let shape: Vec<&str> = upper.iter().map(String::as_str).collect();

        let statement = match shape.as_slice() {
            ["CREATE", "TABLE", _] => Statement::CreateTable(words[2].to_string()),
            ["INSERT", "INTO", _, "?", ",", "?"] => Statement::Insert(words[2].to_string()),
            ["UPDATE", _, "SET", "?", "WHERE", "ID", "=", "?"] => {
                Statement::Update(words[1].to_string())
            }
            ["DELETE", "FROM", _, "WHERE", "ID", "=", "?"] => {
                Statement::Delete(words[2].to_string())
            }
            ["SELECT", "*", "FROM", _] => Statement::SelectAll(words[3].to_string()),
            ["SELECT", "*", "FROM", _, "WHERE", "ID", "=", "?"] => {
                Statement::SelectById(words[3].to_string())
            }
            _ => {
                return Err(DriverError::bad_request(format!(
                    "unsupported statement: {text}"
                )))
            }
        };
        Ok(statement)
    }

    fn parameter_count(&self) -> usize {
        match self {
            Statement::ListTables | Statement::CreateTable(_) | Statement::SelectAll(_) => 0,
            Statement::Delete(_) | Statement::SelectById(_) => 1,
            Statement::Insert(_) | Statement::Update(_) => 2,
        }
    }
}

/// An in-memory ledger service.
pub struct InMemoryLedger {
    name: String,
    config: LedgerConfig,
    codec: CborCodec,
    state: Mutex<LedgerState>,
    faults: Mutex<HashMap<FaultPoint, VecDeque<Fault>>>,
    calls: Mutex<HashMap<FaultPoint, usize>>,
    stats: Mutex<LedgerStats>,
}

impl InMemoryLedger {
    /// Creates an empty ledger with the default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, LedgerConfig::default())
    }

    /// Creates an empty ledger.
    pub fn with_config(name: impl Into<String>, config: LedgerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            codec: CborCodec::new(),
            state: Mutex::new(LedgerState::default()),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            stats: Mutex::new(LedgerStats::default()),
        }
    }

    /// Name of the ledger.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The configuration.
    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Makes the next call at `point` fail with `fault`.
    pub fn inject(&self, point: FaultPoint, fault: Fault) {
        self.inject_times(point, fault, 1);
    }

    /// Makes the next `times` calls at `point` fail with `fault`.
    pub fn inject_times(&self, point: FaultPoint, fault: Fault, times: usize) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(point).or_default();
        for _ in 0..times {
            queue.push_back(fault);
        }
    }

    /// Drops every pending fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Number of calls received at `point`, including failed ones.
    pub fn call_count(&self, point: FaultPoint) -> usize {
        self.calls.lock().get(&point).copied().unwrap_or(0)
    }

    /// Service counters.
    pub fn stats(&self) -> LedgerStats {
        *self.stats.lock()
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Forgets a session, as if it had timed out. Returns false if unknown.
    pub fn expire_session(&self, token: &SessionToken) -> bool {
        let removed = self.state.lock().sessions.remove(token).is_some();
        if removed {
            self.stats.lock().sessions_expired += 1;
        }
        removed
    }

    /// Forgets every session.
    pub fn expire_all_sessions(&self) -> usize {
        let expired = {
            let mut state = self.state.lock();
            let count = state.sessions.len();
            state.sessions.clear();
            count
        };
        self.stats.lock().sessions_expired += expired as u64;
        expired
    }

    /// Committed table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().tables.keys().cloned().collect()
    }

    /// Number of committed documents in `table`.
    pub fn document_count(&self, table: &str) -> usize {
        self.state
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.documents.len())
    }

    /// Committed document stored under `key`.
    pub fn document(&self, table: &str, key: &str) -> Option<WireValue> {
        let state = self.state.lock();
        state
            .tables
            .get(table)
            .and_then(|t| t.documents.get(key))
            .map(|d| d.value.clone())
    }

    /// Decodes the committed document stored under `key`.
    pub fn read_document<T: DeserializeOwned>(
        &self,
        table: &str,
        key: &str,
    ) -> DriverResult<Option<T>> {
        match self.document(table, key) {
            Some(value) => Ok(Some(self.codec.decode(&value)?)),
            None => Ok(None),
        }
    }

    /// Creates a table directly, bypassing transactions.
    pub fn create_table(&self, table: &str) {
        let mut state = self.state.lock();
        state.tables.entry(table.to_string()).or_default();
    }

    /// Stores a document directly, bypassing transactions.
    ///
    /// Bumps the document and table versions, so transactions that already
    /// read them fail to commit.
    pub fn put_document<T: Serialize + ?Sized>(
        &self,
        table: &str,
        key: &str,
        document: &T,
    ) -> DriverResult<()> {
        let value = self.codec.encode(document)?;
        let mut state = self.state.lock();
        state.commit_sequence += 1;
        let version = state.commit_sequence;
        let table = state.tables.entry(table.to_string()).or_default();
        table
            .documents
            .insert(key.to_string(), StoredDocument { value, version });
        table.version = version;
        Ok(())
    }

    fn enter(&self, point: FaultPoint) -> DriverResult<()> {
        *self.calls.lock().entry(point).or_default() += 1;
        let fault = self
            .faults
            .lock()
            .get_mut(&point)
            .and_then(|queue| queue.pop_front());
        match fault {
            Some(fault) => {
                tracing::debug!(point = ?point, fault = ?fault, "injecting fault");
                Err(fault.to_error())
            }
            None => Ok(()),
        }
    }

    fn session<'s>(
        &self,
        sessions: &'s mut HashMap<SessionToken, SessionState>,
        token: &SessionToken,
    ) -> DriverResult<&'s mut SessionState> {
        let expired = match sessions.get(token) {
            None => {
                return Err(DriverError::invalid_session(format!(
                    "unknown session {token}"
                )))
            }
            Some(session) => self
                .config
                .session_ttl
                .is_some_and(|ttl| session.started.elapsed() > ttl),
        };
        if expired {
            sessions.remove(token);
            self.stats.lock().sessions_expired += 1;
            return Err(DriverError::invalid_session(format!(
                "session {token} expired"
            )));
        }
        sessions
            .get_mut(token)
            .ok_or_else(|| DriverError::invalid_session(format!("unknown session {token}")))
    }

    fn decode_key(&self, value: &WireValue) -> DriverResult<String> {
        self.codec
            .decode(value)
            .map_err(|e| DriverError::bad_request(format!("document key must be a string: {e}")))
    }

    fn evaluate(
        &self,
        tables: &BTreeMap<String, Table>,
        txn: &mut OpenTransaction,
        statement: Statement,
        parameters: &[WireValue],
    ) -> DriverResult<Vec<WireValue>> {
        if parameters.len() != statement.parameter_count() {
            return Err(DriverError::bad_request(format!(
                "expected {} parameter(s), got {}",
                statement.parameter_count(),
                parameters.len()
            )));
        }

        match statement {
            Statement::ListTables => {
                let mut names: Vec<String> = tables.keys().cloned().collect();
                for write in &txn.writes {
                    if let Write::CreateTable(name) = write {
                        names.push(name.clone());
                    }
                }
                names.sort();
                names.dedup();
                self.encode_all(&names)
            }
            Statement::CreateTable(table) => {
                if table_exists(tables, txn, &table) {
                    return Err(DriverError::bad_request(format!(
                        "table {table} already exists"
                    )));
                }
                let row = self.codec.encode(&table)?;
                txn.writes.push(Write::CreateTable(table));
                Ok(vec![row])
            }
            Statement::Insert(table) => {
                require_table(tables, txn, &table)?;
                let key = self.decode_key(&parameters[0])?;
                record_document_read(tables, txn, &table, &key);
                if visible_document(tables, txn, &table, &key).is_some() {
                    return Err(DriverError::bad_request(format!(
                        "document {key} already exists in {table}"
                    )));
                }
                let row = self.codec.encode(&key)?;
                txn.writes.push(Write::Put {
                    table,
                    key,
                    value: parameters[1].clone(),
                });
                Ok(vec![row])
            }
            Statement::Update(table) => {
                require_table(tables, txn, &table)?;
                let key = self.decode_key(&parameters[1])?;
                record_document_read(tables, txn, &table, &key);
                if visible_document(tables, txn, &table, &key).is_none() {
                    return Ok(Vec::new());
                }
                let row = self.codec.encode(&key)?;
                txn.writes.push(Write::Put {
                    table,
                    key,
                    value: parameters[0].clone(),
                });
                Ok(vec![row])
            }
            Statement::Delete(table) => {
                require_table(tables, txn, &table)?;
                let key = self.decode_key(&parameters[0])?;
                record_document_read(tables, txn, &table, &key);
                if visible_document(tables, txn, &table, &key).is_none() {
                    return Ok(Vec::new());
                }
                let row = self.codec.encode(&key)?;
                txn.writes.push(Write::Delete { table, key });
                Ok(vec![row])
            }
            Statement::SelectAll(table) => {
                require_table(tables, txn, &table)?;
                txn.reads.push(Read::Scan {
                    version: table_version(tables, &table),
                    table: table.clone(),
                });
                Ok(visible_table(tables, txn, &table))
            }
            Statement::SelectById(table) => {
                require_table(tables, txn, &table)?;
                let key = self.decode_key(&parameters[0])?;
                record_document_read(tables, txn, &table, &key);
                Ok(visible_document(tables, txn, &table, &key)
                    .into_iter()
                    .collect())
            }
        }
    }

    fn encode_all(&self, names: &[String]) -> DriverResult<Vec<WireValue>> {
        names
            .iter()
            .map(|name| self.codec.encode(name).map_err(DriverError::from))
            .collect()
    }

    fn paginate(
        &self,
        txn: &mut OpenTransaction,
        mut rows: Vec<WireValue>,
        write_ios: u64,
        started: Instant,
    ) -> Page {
        let page_size = self.config.page_size.max(1);
        let rest = if rows.len() > page_size {
            rows.split_off(page_size)
        } else {
            Vec::new()
        };
        let read_ios = rows.len() as u64;
        let mut page = Page::new(rows)
            .with_consumed_ios(IoUsage::new(read_ios, write_ios))
            .with_timing(TimingInformation::new(started.elapsed().as_millis() as u64));
        if !rest.is_empty() {
            let token = PageToken::new(Uuid::new_v4().to_string());
            txn.pending_pages.insert(token.clone(), rest);
            page = page.with_next_page(token);
        }
        page
    }
}

fn open_transaction<'s>(
    session: &'s mut SessionState,
    id: &TransactionId,
) -> DriverResult<&'s mut OpenTransaction> {
    match session.transaction.as_mut() {
        Some(txn) if txn.id == *id => Ok(txn),
        _ => Err(DriverError::bad_request(format!(
            "transaction {id} is not open"
        ))),
    }
}

fn table_exists(tables: &BTreeMap<String, Table>, txn: &OpenTransaction, table: &str) -> bool {
    tables.contains_key(table)
        || txn
            .writes
            .iter()
            .any(|w| matches!(w, Write::CreateTable(name) if name == table))
}

fn require_table(
    tables: &BTreeMap<String, Table>,
    txn: &OpenTransaction,
    table: &str,
) -> DriverResult<()> {
    if table_exists(tables, txn, table) {
        Ok(())
    } else {
        Err(DriverError::bad_request(format!("no such table: {table}")))
    }
}

fn table_version(tables: &BTreeMap<String, Table>, table: &str) -> u64 {
    tables.get(table).map_or(0, |t| t.version)
}

fn document_version(tables: &BTreeMap<String, Table>, table: &str, key: &str) -> Option<u64> {
    tables
        .get(table)
        .and_then(|t| t.documents.get(key))
        .map(|d| d.version)
}

fn record_document_read(
    tables: &BTreeMap<String, Table>,
    txn: &mut OpenTransaction,
    table: &str,
    key: &str,
) {
    txn.reads.push(Read::Document {
        table: table.to_string(),
        key: key.to_string(),
        version: document_version(tables, table, key),
    });
}

/// The document as seen by the transaction: its own writes over committed state.
fn visible_document(
    tables: &BTreeMap<String, Table>,
    txn: &OpenTransaction,
    table: &str,
    key: &str,
) -> Option<WireValue> {
    for write in txn.writes.iter().rev() {
        match write {
            Write::Put {
                table: t,
                key: k,
                value,
            } if t == table && k == key => return Some(value.clone()),
            Write::Delete { table: t, key: k } if t == table && k == key => return None,
            _ => {}
        }
    }
    tables
        .get(table)
        .and_then(|t| t.documents.get(key))
        .map(|d| d.value.clone())
}

fn visible_table(
    tables: &BTreeMap<String, Table>,
    txn: &OpenTransaction,
    table: &str,
) -> Vec<WireValue> {
    let mut rows: BTreeMap<String, WireValue> = tables
        .get(table)
        .map(|t| {
            t.documents
                .iter()
                .map(|(k, d)| (k.clone(), d.value.clone()))
                .collect()
        })
        .unwrap_or_default();
    for write in &txn.writes {
        match write {
            Write::Put { table: t, key, value } if t == table => {
                rows.insert(key.clone(), value.clone());
            }
            Write::Delete { table: t, key } if t == table => {
                rows.remove(key);
            }
            _ => {}
        }
    }
    rows.into_values().collect()
}

/// Describes the first read or table creation invalidated since it happened.
fn find_conflict(tables: &BTreeMap<String, Table>, txn: &OpenTransaction) -> Option<String> {
    for read in &txn.reads {
        match read {
            Read::Document {
                table,
                key,
                version,
            } => {
                if document_version(tables, table, key) != *version {
                    return Some(format!("document {key} in {table} changed"));
                }
            }
            Read::Scan { table, version } => {
                if table_version(tables, table) != *version {
                    return Some(format!("table {table} changed"));
                }
            }
        }
    }
    txn.writes.iter().find_map(|write| match write {
        Write::CreateTable(name) if tables.contains_key(name) => {
            Some(format!("table {name} was created concurrently"))
        }
        _ => None,
    })
}

fn apply(tables: &mut BTreeMap<String, Table>, writes: Vec<Write>, version: u64) {
    for write in writes {
        match write {
            Write::CreateTable(name) => {
                tables.entry(name).or_default();
            }
            Write::Put { table, key, value } => {
                let table = tables.entry(table).or_default();
                table
                    .documents
                    .insert(key, StoredDocument { value, version });
                table.version = version;
            }
            Write::Delete { table, key } => {
                let table = tables.entry(table).or_default();
                table.documents.remove(&key);
                table.version = version;
            }
        }
    }
}

impl Communicator for InMemoryLedger {
    fn start_session(&self, ledger_name: &str) -> DriverResult<SessionToken> {
        self.enter(FaultPoint::StartSession)?;
        if ledger_name != self.name {
            return Err(DriverError::bad_request(format!(
                "ledger {ledger_name} not found"
            )));
        }
        let token = SessionToken::new(Uuid::new_v4().to_string());
        self.state.lock().sessions.insert(
            token.clone(),
            SessionState {
                started: Instant::now(),
                transaction: None,
            },
        );
        self.stats.lock().sessions_started += 1;
        Ok(token)
    }

    fn start_transaction(&self, session: &SessionToken) -> DriverResult<TransactionId> {
        self.enter(FaultPoint::StartTransaction)?;
        let mut state = self.state.lock();
        let session = self.session(&mut state.sessions, session)?;
        let id = TransactionId::new(Uuid::new_v4().simple().to_string());
        // A new transaction replaces one the client abandoned.
        session.transaction = Some(OpenTransaction::new(id.clone()));
        self.stats.lock().transactions_started += 1;
        Ok(id)
    }

    fn execute_statement(
        &self,
        session: &SessionToken,
        transaction_id: &TransactionId,
        statement: &str,
        parameters: &[WireValue],
    ) -> DriverResult<Page> {
        self.enter(FaultPoint::ExecuteStatement)?;
        if !self.config.statement_latency.is_zero() {
            std::thread::sleep(self.config.statement_latency);
        }
        let started = Instant::now();

        let mut state = self.state.lock();
        let LedgerState {
            tables, sessions, ..
        } = &mut *state;
        let session = self.session(sessions, session)?;
        let txn = open_transaction(session, transaction_id)?;
        txn.digest.update(statement, parameters);

        let parsed = Statement::parse(statement)?;
        let writes_before = txn.writes.len();
        let rows = self.evaluate(tables, txn, parsed, parameters)?;
        let write_ios = (txn.writes.len() - writes_before) as u64;

        self.stats.lock().statements_executed += 1;
        Ok(self.paginate(txn, rows, write_ios, started))
    }

    fn fetch_page(
        &self,
        session: &SessionToken,
        transaction_id: &TransactionId,
        token: &PageToken,
    ) -> DriverResult<Page> {
        self.enter(FaultPoint::FetchPage)?;
        let started = Instant::now();

        let mut state = self.state.lock();
        let session = self.session(&mut state.sessions, session)?;
        let txn = open_transaction(session, transaction_id)?;
        let rows = txn.pending_pages.remove(token).ok_or_else(|| {
            DriverError::bad_request(format!("unknown page token {}", token.as_str()))
        })?;
        Ok(self.paginate(txn, rows, 0, started))
    }

    fn commit(
        &self,
        session: &SessionToken,
        transaction_id: &TransactionId,
        digest: &CommitDigest,
    ) -> DriverResult<CommitDigest> {
        self.enter(FaultPoint::Commit)?;

        let mut state = self.state.lock();
        let LedgerState {
            tables,
            sessions,
            commit_sequence,
        } = &mut *state;
        let session = self.session(sessions, session)?;
        let txn = match session.transaction.take() {
            Some(txn) if txn.id == *transaction_id => txn,
            other => {
                session.transaction = other;
                return Err(DriverError::bad_request(format!(
                    "transaction {transaction_id} is not open"
                )));
            }
        };

        if self.config.verify_digests && txn.digest != *digest {
            self.stats.lock().digest_mismatches += 1;
            return Err(DriverError::bad_request(format!(
                "commit digest mismatch for transaction {transaction_id}"
            )));
        }

        if let Some(reason) = find_conflict(tables, &txn) {
            self.stats.lock().occ_conflicts += 1;
            tracing::debug!(transaction_id = %transaction_id, reason = %reason, "rejecting commit");
            return Err(DriverError::occ_conflict(reason));
        }

        *commit_sequence += 1;
        let server_digest = txn.digest;
        apply(tables, txn.writes, *commit_sequence);
        self.stats.lock().transactions_committed += 1;
        Ok(server_digest)
    }

    fn abort(&self, session: &SessionToken, transaction_id: &TransactionId) -> DriverResult<()> {
        self.enter(FaultPoint::Abort)?;
        let mut state = self.state.lock();
        let session = self.session(&mut state.sessions, session)?;
        if matches!(&session.transaction, Some(txn) if txn.id == *transaction_id) {
            session.transaction = None;
            self.stats.lock().transactions_aborted += 1;
        }
        Ok(())
    }

    fn end_session(&self, session: &SessionToken) -> DriverResult<()> {
        self.enter(FaultPoint::EndSession)?;
        if self.state.lock().sessions.remove(session).is_none() {
            return Err(DriverError::invalid_session(format!(
                "unknown session {session}"
            )));
        }
        self.stats.lock().sessions_ended += 1;
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryLedger")
            .field("name", &self.name)
            .field("tables", &state.tables.len())
            .field("sessions", &state.sessions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Client<'a> {
        ledger: &'a InMemoryLedger,
        session: SessionToken,
        txn: TransactionId,
        digest: CommitDigest,
    }

    impl<'a> Client<'a> {
        fn begin(ledger: &'a InMemoryLedger) -> Self {
            let session = ledger.start_session("test").unwrap();
            Self::begin_on(ledger, session)
        }

        fn begin_on(ledger: &'a InMemoryLedger, session: SessionToken) -> Self {
            let txn = ledger.start_transaction(&session).unwrap();
            let digest = CommitDigest::seed(&txn);
            Self {
                ledger,
                session,
                txn,
                digest,
            }
        }

        fn run(&mut self, statement: &str, params: &[WireValue]) -> DriverResult<Page> {
            self.digest.update(statement, params);
            self.ledger
                .execute_statement(&self.session, &self.txn, statement, params)
        }

        fn commit(&self) -> DriverResult<CommitDigest> {
            self.ledger.commit(&self.session, &self.txn, &self.digest)
        }
    }

    fn enc<T: Serialize + ?Sized>(value: &T) -> WireValue {
        CborCodec::new().encode(value).unwrap()
    }

    #[test]
    fn parses_statements() {
        assert_eq!(
            Statement::parse("CREATE TABLE cars").unwrap(),
            Statement::CreateTable("cars".into())
        );
        assert_eq!(
            Statement::parse("insert into cars ?, ?").unwrap(),
            Statement::Insert("cars".into())
        );
        assert_eq!(
            Statement::parse("UPDATE cars SET ? WHERE id = ?").unwrap(),
            Statement::Update("cars".into())
        );
        assert_eq!(
            Statement::parse("SELECT * FROM cars WHERE id = ?").unwrap(),
            Statement::SelectById("cars".into())
        );
        assert_eq!(
            Statement::parse(LIST_TABLES_STATEMENT).unwrap(),
            Statement::ListTables
        );
        assert!(Statement::parse("DROP TABLE cars").is_err());
    }

    #[test]
    fn insert_commit_and_read_back() {
        let ledger = InMemoryLedger::new("test");
        let mut client = Client::begin(&ledger);
        client.run("CREATE TABLE cars", &[]).unwrap();
        client
            .run("INSERT INTO cars ?, ?", &[enc("vin-1"), enc("red")])
            .unwrap();

        // Reads see the transaction's own writes.
        let page = client
            .run("SELECT * FROM cars WHERE id = ?", &[enc("vin-1")])
            .unwrap();
        assert_eq!(page.values, vec![enc("red")]);
        assert_eq!(ledger.document_count("cars"), 0);

        let returned = client.commit().unwrap();
        assert_eq!(returned, client.digest);
        assert_eq!(
            ledger.read_document::<String>("cars", "vin-1").unwrap(),
            Some("red".to_string())
        );
        assert_eq!(ledger.table_names(), vec!["cars"]);
    }

    #[test]
    fn stale_read_fails_commit_with_conflict() {
        let ledger = InMemoryLedger::new("test");
        ledger.put_document("accounts", "alice", &10u32).unwrap();

        let mut first = Client::begin(&ledger);
        let mut second = Client::begin(&ledger);
        for client in [&mut first, &mut second] {
            client
                .run("SELECT * FROM accounts WHERE id = ?", &[enc("alice")])
                .unwrap();
            client
                .run("UPDATE accounts SET ? WHERE id = ?", &[enc(&11u32), enc("alice")])
                .unwrap();
        }

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert!(matches!(err, DriverError::OccConflict { .. }));
        assert_eq!(ledger.stats().occ_conflicts, 1);

        // The session survives the conflict.
        let mut retry = Client::begin_on(&ledger, second.session.clone());
        retry
            .run("SELECT * FROM accounts WHERE id = ?", &[enc("alice")])
            .unwrap();
        retry.commit().unwrap();
    }

    #[test]
    fn scans_conflict_with_inserts() {
        let ledger = InMemoryLedger::new("test");
        ledger.create_table("cars");

        let mut reader = Client::begin(&ledger);
        reader.run("SELECT * FROM cars", &[]).unwrap();

        let mut writer = Client::begin(&ledger);
        writer
            .run("INSERT INTO cars ?, ?", &[enc("vin-1"), enc("red")])
            .unwrap();
        writer.commit().unwrap();

        assert!(matches!(
            reader.commit(),
            Err(DriverError::OccConflict { .. })
        ));
    }

    #[test]
    fn digest_mismatch_is_rejected() {
        let ledger = InMemoryLedger::new("test");
        let mut client = Client::begin(&ledger);
        client.run("CREATE TABLE t", &[]).unwrap();
        client.digest = CommitDigest::of(b"forged");

        assert!(matches!(
            client.commit(),
            Err(DriverError::BadRequest { .. })
        ));
        assert_eq!(ledger.stats().digest_mismatches, 1);
        assert!(ledger.table_names().is_empty());
    }

    #[test]
    fn pagination_and_statistics() {
        let ledger = InMemoryLedger::with_config("test", LedgerConfig::new().with_page_size(2));
        for i in 0..5 {
            ledger
                .put_document("t", &format!("k{i}"), &i)
                .unwrap();
        }

        let mut client = Client::begin(&ledger);
        let first = client.run("SELECT * FROM t", &[]).unwrap();
        assert_eq!(first.values.len(), 2);
        assert_eq!(first.consumed_ios, Some(IoUsage::new(2, 0)));

        let mut token = first.next_page_token.clone();
        let mut rows = first.values.len();
        while let Some(t) = token {
            let page = ledger.fetch_page(&client.session, &client.txn, &t).unwrap();
            rows += page.values.len();
            token = page.next_page_token;
        }
        assert_eq!(rows, 5);

        // Page tokens belong to their transaction.
        let other = Client::begin(&ledger);
        let again = client.run("SELECT * FROM t", &[]).unwrap();
        let token = again.next_page_token.unwrap();
        assert!(ledger
            .fetch_page(&other.session, &other.txn, &token)
            .is_err());
    }

    #[test]
    fn errors_for_bad_input() {
        let ledger = InMemoryLedger::new("test");
        assert!(ledger.start_session("other").is_err());

        let mut client = Client::begin(&ledger);
        assert!(matches!(
            client.run("SELECT * FROM missing", &[]),
            Err(DriverError::BadRequest { .. })
        ));
        assert!(matches!(
            client.run("CREATE TABLE t", &[enc("extra")]),
            Err(DriverError::BadRequest { .. })
        ));
        assert!(matches!(
            ledger.start_transaction(&SessionToken::new("nope")),
            Err(DriverError::InvalidSession { .. })
        ));
    }

    #[test]
    fn faults_and_expiry() {
        let ledger = InMemoryLedger::new("test");
        ledger.inject_times(FaultPoint::StartSession, Fault::Timeout, 2);
        assert!(matches!(
            ledger.start_session("test"),
            Err(DriverError::Timeout)
        ));
        assert!(ledger.start_session("test").is_err());
        let session = ledger.start_session("test").unwrap();
        assert_eq!(ledger.call_count(FaultPoint::StartSession), 3);

        assert!(ledger.expire_session(&session));
        assert!(matches!(
            ledger.start_transaction(&session),
            Err(DriverError::InvalidSession { .. })
        ));
    }

    #[test]
    fn sessions_expire_after_ttl() {
        let ledger = InMemoryLedger::with_config(
            "test",
            LedgerConfig::new().with_session_ttl(Duration::from_millis(5)),
        );
        let session = ledger.start_session("test").unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert!(matches!(
            ledger.start_transaction(&session),
            Err(DriverError::InvalidSession { .. })
        ));
        assert_eq!(ledger.active_sessions(), 0);
        assert_eq!(ledger.stats().sessions_expired, 1);
    }

    #[test]
    fn abort_discards_writes() {
        let ledger = InMemoryLedger::new("test");
        let mut client = Client::begin(&ledger);
        client.run("CREATE TABLE t", &[]).unwrap();
        ledger.abort(&client.session, &client.txn).unwrap();
        assert!(client.commit().is_err());
        assert!(ledger.table_names().is_empty());
        assert_eq!(ledger.stats().transactions_aborted, 1);
    }
}
