//! In-memory store speaking the statements the loader issues
//!
//! Recognises the catalog existence query, advisory lock, parent/partition
//! DDL and `COPY`. Work inside a transaction is buffered and only becomes
//! visible on commit. Failures are injected per partition name.
//!
//! Like PostgreSQL, a failed statement leaves the transaction aborted: every
//! later statement is rejected until a rollback to a savepoint, and `COMMIT`
//! quietly rolls back instead.

use async_trait::async_trait;
use bytes::Bytes;
use holdings_load::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Committed state plus counters
#[derive(Debug, Default)]
pub struct StoreState {
    /// `schema.name` of every committed table
    pub tables: BTreeSet<String>,
    /// Committed partition DDL, in execution order
    pub partition_ddl: Vec<String>,
    /// Committed parent DDL
    pub parent_ddl: Vec<String>,
    /// Committed COPY lines per child partition name
    pub rows: BTreeMap<String, Vec<String>>,
    /// Connections opened
    pub connects: usize,
    /// Connections currently open
    pub open: usize,
    /// Highest number of simultaneously open connections
    pub max_open: usize,
    /// Statements, queries, copies and transaction control calls
    pub io_ops: usize,
    /// Advisory locks taken
    pub locks: usize,
    /// Transactions committed
    pub commits: usize,
    /// Transactions rolled back
    pub rollbacks: usize,
}

/// Failure injection
#[derive(Debug, Default)]
pub struct Faults {
    /// Refuse every connection attempt
    pub refuse_connect: bool,
    /// Refuse connection attempts after this many succeeded
    pub connect_limit: Option<usize>,
    /// Partition names whose DDL fails with a range overlap
    pub overlap: HashSet<String>,
    /// Partition names created by a "concurrent" session right before ours
    pub race: HashSet<String>,
    /// Parent table names whose DDL loses a creation race
    pub parent_race: HashSet<String>,
    /// Parent table names whose DDL is rejected outright
    pub parent_denied: HashSet<String>,
    /// Partition names whose COPY fails with bad input
    pub bad_copy: HashSet<String>,
    /// Partition names whose COPY drops the connection
    pub drop_on_copy: HashSet<String>,
    /// Advisory lock times out
    pub lock_timeout: bool,
    /// Partition names whose existence check is cancelled
    pub check_cancelled: HashSet<String>,
    /// `COMMIT` of a transaction holding the advisory lock fails
    pub ddl_commit_fails: bool,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<StoreState>,
    faults: Mutex<Faults>,
}

/// Shared in-memory store; also the connection factory
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    inner: Arc<Inner>,
}

#[allow(dead_code)]
impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    pub fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap()
    }

    pub fn faults(&self) -> MutexGuard<'_, Faults> {
        self.inner.faults.lock().unwrap()
    }

    /// Pre-create a committed table
    pub fn with_table(self, qualified: &str) -> Self {
        self.state().tables.insert(qualified.to_string());
        self
    }

    pub fn has_table(&self, qualified: &str) -> bool {
        self.state().tables.contains(qualified)
    }

    pub fn table_count(&self) -> usize {
        self.state().tables.len()
    }

    pub fn row_count(&self, partition: &str) -> usize {
        self.state().rows.get(partition).map(Vec::len).unwrap_or(0)
    }

    pub fn total_rows(&self) -> usize {
        self.state().rows.values().map(Vec::len).sum()
    }

    pub fn io_ops(&self) -> usize {
        self.state().io_ops
    }

    fn tick(&self) {
        self.state().io_ops += 1;
    }

    fn table_visible(&self, qualified: &str, pending: &Pending) -> bool {
        self.has_table(qualified) || pending.tables.iter().any(|(t, _, _)| t == qualified)
    }
}

#[async_trait]
impl ConnectionFactory for MockStore {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let refused = {
            let faults = self.faults();
            faults.refuse_connect
                || faults
                    .connect_limit
                    .map(|limit| self.state().connects >= limit)
                    .unwrap_or(false)
        };
        if refused {
            return Err(Error::connection(format!(
                "could not connect to {}",
                config.redacted_url()
            )));
        }

        let mut state = self.state();
        state.connects += 1;
        state.open += 1;
        state.max_open = state.max_open.max(state.open);
        drop(state);

        Ok(Box::new(MockConnection {
            store: self.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }))
    }
}

/// One mock session
pub struct MockConnection {
    store: MockStore,
    closed: Arc<AtomicBool>,
}

impl MockConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, sql: &str, _params: &[&str]) -> Result<u64> {
        self.ensure_open()?;
        self.store.tick();
        Err(Error::query_with_sql("autocommit statements are not mocked", sql))
    }

    async fn query_flag(&self, sql: &str, params: &[&str]) -> Result<bool> {
        self.ensure_open()?;
        self.store.tick();
        exists_query(&self.store, sql, params, &Pending::default())
    }

    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.ensure_open()?;
        self.store.tick();
        Ok(Box::new(MockTransaction {
            store: self.store.clone(),
            closed: Arc::clone(&self.closed),
            pending: Mutex::new(Pending::default()),
            savepoints: Mutex::new(Vec::new()),
            aborted: AtomicBool::new(false),
        }))
    }

    async fn is_valid(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.state().open -= 1;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
struct Pending {
    /// (qualified name, ddl, is_partition)
    tables: Vec<(String, String, bool)>,
    rows: Vec<(String, String)>,
    locks: usize,
}

#[derive(Debug, Clone, Copy)]
struct Mark {
    tables: usize,
    rows: usize,
}

/// Buffered unit of work on a mock session
pub struct MockTransaction {
    store: MockStore,
    closed: Arc<AtomicBool>,
    pending: Mutex<Pending>,
    savepoints: Mutex<Vec<(String, Mark)>>,
    aborted: AtomicBool,
}

impl MockTransaction {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }

    /// Open and not aborted by an earlier failure
    fn ensure_usable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.aborted.load(Ordering::SeqCst) {
            return Err(Error::query_with_code(
                "current transaction is aborted, commands ignored until end of transaction block",
                "",
                "25P02",
            ));
        }
        Ok(())
    }

    /// Any failed statement aborts the transaction
    fn track<T>(&self, result: Result<T>) -> Result<T> {
        if result.is_err() {
            self.aborted.store(true, Ordering::SeqCst);
        }
        result
    }

    fn lose_connection(&self) -> Error {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.state().open -= 1;
        }
        Error::connection("server closed the connection unexpectedly")
    }

    fn create_table(&self, sql: &str) -> Result<u64> {
        let (schema, name) = ddl_target(sql)
            .ok_or_else(|| Error::query_with_sql("unrecognised DDL", sql))?;
        let qualified = format!("{schema}.{name}");
        let is_partition = sql.contains(" PARTITION OF ");

        {
            let faults = self.store.faults();
            if is_partition && faults.overlap.contains(&name) {
                return Err(Error::query_with_code(
                    format!("partition \"{name}\" would overlap partition \"other\""),
                    sql,
                    "42P17",
                ));
            }
            if !is_partition && faults.parent_denied.contains(&name) {
                return Err(Error::query_with_code(
                    format!("permission denied for schema {schema}"),
                    sql,
                    "42501",
                ));
            }
            let raced = if is_partition {
                faults.race.contains(&name)
            } else {
                faults.parent_race.contains(&name)
            };
            if raced {
                drop(faults);
                self.store.state().tables.insert(qualified.clone());
                return Err(Error::query_with_code(
                    format!("relation \"{name}\" already exists"),
                    sql,
                    "42P07",
                ));
            }
        }

        let mut pending = self.pending.lock().unwrap();
        if self.store.table_visible(&qualified, &pending) {
            return Err(Error::query_with_code(
                format!("relation \"{name}\" already exists"),
                sql,
                "42P07",
            ));
        }
        pending
            .tables
            .push((qualified, sql.to_string(), is_partition));
        Ok(0)
    }
}

#[async_trait]
impl Transaction for MockTransaction {
    async fn execute(&self, sql: &str, params: &[&str]) -> Result<u64> {
        self.ensure_usable()?;
        self.store.tick();
        let result = self.run(sql, params);
        self.track(result)
    }

    async fn query_flag(&self, sql: &str, params: &[&str]) -> Result<bool> {
        self.ensure_usable()?;
        self.store.tick();
        if let Some(name) = params.get(1) {
            if self.store.faults().check_cancelled.contains(*name) {
                return self.track(Err(Error::query_with_code(
                    "canceling statement due to statement timeout",
                    sql,
                    "57014",
                )));
            }
        }
        let pending = self.pending.lock().unwrap().clone();
        let result = exists_query(&self.store, sql, params, &pending);
        self.track(result)
    }

    async fn copy_in(&self, sql: &str, data: Bytes) -> Result<u64> {
        self.ensure_usable()?;
        let result = self.copy(sql, data).await;
        self.track(result)
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        self.ensure_usable()?;
        self.store.tick();
        let pending = self.pending.lock().unwrap();
        let mark = Mark {
            tables: pending.tables.len(),
            rows: pending.rows.len(),
        };
        self.savepoints.lock().unwrap().push((name.to_string(), mark));
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.store.tick();
        let savepoints = self.savepoints.lock().unwrap();
        let (_, mark) = savepoints
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .cloned()
            .ok_or_else(|| Error::transaction(format!("savepoint \"{name}\" does not exist")))?;
        let mut pending = self.pending.lock().unwrap();
        pending.tables.truncate(mark.tables);
        pending.rows.truncate(mark.rows);
        self.aborted.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.ensure_usable()?;
        self.store.tick();
        let mut savepoints = self.savepoints.lock().unwrap();
        let pos = savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| Error::transaction(format!("savepoint \"{name}\" does not exist")))?;
        savepoints.truncate(pos);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        let pending = std::mem::take(&mut *self.pending.lock().unwrap());
        let commit_fails = pending.locks > 0 && self.store.faults().ddl_commit_fails;
        let mut state = self.store.state();
        state.io_ops += 1;

        // The server answers COMMIT of an aborted transaction with ROLLBACK
        if self.aborted.load(Ordering::SeqCst) {
            state.rollbacks += 1;
            return Ok(());
        }
        if commit_fails {
            state.rollbacks += 1;
            return Err(Error::query_with_code(
                "could not serialize access due to concurrent update",
                "COMMIT",
                "40001",
            ));
        }

        state.commits += 1;
        state.locks += pending.locks;
        for (qualified, ddl, is_partition) in pending.tables {
            state.tables.insert(qualified);
            if is_partition {
                state.partition_ddl.push(ddl);
            } else {
                state.parent_ddl.push(ddl);
            }
        }
        for (partition, line) in pending.rows {
            state.rows.entry(partition).or_default().push(line);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.store.state();
        state.io_ops += 1;
        state.rollbacks += 1;
        Ok(())
    }
}

impl MockTransaction {
    fn run(&self, sql: &str, params: &[&str]) -> Result<u64> {
        if sql.starts_with("SELECT pg_advisory_xact_lock") {
            assert_eq!(params.len(), 1, "advisory lock takes the table name");
            if self.store.faults().lock_timeout {
                return Err(Error::query_with_code(
                    "canceling statement due to lock timeout",
                    sql,
                    "55P03",
                ));
            }
            self.pending.lock().unwrap().locks += 1;
            return Ok(1);
        }
        if sql.starts_with("CREATE TABLE") {
            return self.create_table(sql);
        }
        Err(Error::query_with_sql("statement not mocked", sql))
    }

    async fn copy(&self, sql: &str, data: Bytes) -> Result<u64> {
        self.store.tick();
        // Give sibling transfers a chance to interleave
        tokio::task::yield_now().await;

        let (schema, table) = copy_target(sql)
            .ok_or_else(|| Error::query_with_sql("unrecognised COPY", sql))?;
        let text = String::from_utf8(data.to_vec())
            .map_err(|e| Error::query_with_code(e.to_string(), sql, "22021"))?;

        let mut routed = Vec::new();
        for line in text.lines() {
            let period_start = line.rsplit(',').next().unwrap_or_default();
            let date = chrono::NaiveDate::parse_from_str(period_start, "%Y-%m-%d")
                .map_err(|e| Error::query_with_code(e.to_string(), sql, "22007"))?;
            let key = PartitionKey::containing(date)?;
            let partition = key.partition_name(&table);

            {
                let faults = self.store.faults();
                if faults.drop_on_copy.contains(&partition) {
                    drop(faults);
                    return Err(self.lose_connection());
                }
                if faults.bad_copy.contains(&partition) {
                    return Err(Error::query_with_code(
                        "invalid input syntax for type numeric",
                        sql,
                        "22P02",
                    ));
                }
            }

            let pending = self.pending.lock().unwrap();
            if !self
                .store
                .table_visible(&format!("{schema}.{partition}"), &pending)
            {
                return Err(Error::query_with_code(
                    format!("no partition of relation \"{table}\" found for row"),
                    sql,
                    "23514",
                ));
            }
            drop(pending);
            routed.push((partition, line.to_string()));
        }

        let count = routed.len() as u64;
        self.pending.lock().unwrap().rows.extend(routed);
        Ok(count)
    }
}

fn exists_query(store: &MockStore, sql: &str, params: &[&str], pending: &Pending) -> Result<bool> {
    if !sql.starts_with("SELECT EXISTS") {
        return Err(Error::query_with_sql("query not mocked", sql));
    }
    assert_eq!(params.len(), 2, "existence check takes schema and table");
    Ok(store.table_visible(&format!("{}.{}", params[0], params[1]), pending))
}

/// `CREATE TABLE "schema"."name" ...` -> (schema, name)
fn ddl_target(sql: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = sql.split('"').collect();
    if parts.len() < 4 || parts[2] != "." {
        return None;
    }
    Some((parts[1].to_string(), parts[3].to_string()))
}

/// `COPY "schema"."table" (...)` -> (schema, table)
fn copy_target(sql: &str) -> Option<(String, String)> {
    if !sql.starts_with("COPY ") {
        return None;
    }
    ddl_target(sql)
}
