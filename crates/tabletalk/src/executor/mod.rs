//! Sandboxed execution of validated plans against per-platform read-only stores.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OpenFlags, params_from_iter};
use serde_json::{Value, json};
use thiserror::Error;

use crate::config::{ExecutionLimits, PlatformSpec};
use crate::models::{ExecutionResult, Literal};
use crate::validate::ValidatedPlan;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutionError {
    #[error("query exceeded the {timeout_ms} ms execution budget")]
    Timeout { timeout_ms: u64 },

    #[error("query failed: {detail}")]
    Failed { detail: String },
}

impl ExecutionError {
    fn failed(detail: impl Into<String>) -> Self {
        Self::Failed {
            detail: detail.into(),
        }
    }
}

/// Runs validated plans through bounded pools of read-only connections, one pool per platform.
#[derive(Debug)]
pub struct Executor {
    pools: HashMap<String, ConnectionPool>,
    limits: ExecutionLimits,
}

impl Executor {
    #[must_use]
    pub fn new(platforms: &[PlatformSpec], limits: ExecutionLimits) -> Self {
        let pools = platforms
            .iter()
            .map(|spec| {
                (
                    spec.id.clone(),
                    ConnectionPool::new(&spec.store_path, limits.max_connections),
                )
            })
            .collect();
        Self { pools, limits }
    }

    #[must_use]
    pub const fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Executes the plan's rendered statement, waiting for a pooled connection if needed.
    ///
    /// Waiting and running share one deadline; when it passes, the running statement is
    /// interrupted and the connection goes back to the pool.
    pub fn execute(&self, plan: &ValidatedPlan) -> Result<ExecutionResult, ExecutionError> {
        let params = plan.params().iter().map(sql_value_from_literal).collect::<Vec<_>>();
        self.run(plan.platform(), plan.sql(), &params)
    }

    fn run(
        &self,
        platform: &str,
        sql: &str,
        params: &[SqlValue],
    ) -> Result<ExecutionResult, ExecutionError> {
        let pool = self
            .pools
            .get(platform)
            .ok_or_else(|| ExecutionError::failed(format!("no store configured for `{platform}`")))?;
        let started = Instant::now();
        let deadline = started + self.limits.timeout();
        let timeout_ms = self.limits.timeout_ms;

        let connection = pool.acquire(deadline).map_err(|error| match error {
            AcquireError::Timeout => ExecutionError::Timeout { timeout_ms },
            AcquireError::Open(detail) => ExecutionError::failed(detail),
        })?;

        let remaining = deadline.saturating_duration_since(Instant::now());
        let interrupt = connection.get_interrupt_handle();
        let interrupted = AtomicBool::new(false);
        let (done, watchdog) = mpsc::channel::<()>();

        let outcome = thread::scope(|scope| {
            let interrupted = &interrupted;
            scope.spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = watchdog.recv_timeout(remaining) {
                    interrupted.store(true, Ordering::SeqCst);
                    interrupt.interrupt();
                }
            });
            let outcome = read_rows(&connection, sql, params, self.limits.row_cap);
            drop(done);
            outcome
        });

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        match outcome {
            Ok(mut result) => {
                result.duration_ms = duration_ms;
                Ok(result)
            }
            Err(_) if interrupted.load(Ordering::SeqCst) => Err(ExecutionError::Timeout { timeout_ms }),
            Err(error) => Err(ExecutionError::failed(error.to_string())),
        }
    }
}

fn read_rows(
    connection: &Connection,
    sql: &str,
    params: &[SqlValue],
    row_cap: usize,
) -> rusqlite::Result<ExecutionResult> {
    let mut statement = connection.prepare(sql)?;
    let columns = statement
        .column_names()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();

    let mut rows = statement.query(params_from_iter(params.iter()))?;
    let mut result_rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if result_rows.len() >= row_cap {
            truncated = true;
            break;
        }
        let mut record = Vec::with_capacity(columns.len());
        for index in 0..columns.len() {
            record.push(json_value_from_sql(row.get::<usize, SqlValue>(index)?));
        }
        result_rows.push(record);
    }

    Ok(ExecutionResult {
        columns,
        row_count: result_rows.len(),
        rows: result_rows,
        truncated,
        row_cap,
        duration_ms: 0,
    })
}

fn sql_value_from_literal(literal: &Literal) -> SqlValue {
    match literal {
        Literal::Integer(value) => SqlValue::Integer(*value),
        Literal::Real(value) => SqlValue::Real(*value),
        Literal::Text(value) => SqlValue::Text(value.clone()),
    }
}

fn json_value_from_sql(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(value) => json!(value),
        SqlValue::Real(value) => json!(value),
        SqlValue::Text(value) => json!(value),
        SqlValue::Blob(value) => json!(encode_blob_hex(&value)),
    }
}

fn encode_blob_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push(HEX[(byte >> 4) as usize] as char);
        output.push(HEX[(byte & 0x0f) as usize] as char);
    }
    output
}

enum AcquireError {
    Timeout,
    Open(String),
}

#[derive(Debug)]
struct ConnectionPool {
    store_path: PathBuf,
    capacity: usize,
    state: Mutex<PoolState>,
    released: Condvar,
}

#[derive(Debug, Default)]
struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

impl ConnectionPool {
    fn new(store_path: &Path, capacity: usize) -> Self {
        Self {
            store_path: store_path.to_path_buf(),
            capacity: capacity.max(1),
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, deadline: Instant) -> Result<PooledConnection<'_>, AcquireError> {
        let mut state = self.lock();
        loop {
            if let Some(connection) = state.idle.pop() {
                return Ok(PooledConnection {
                    pool: self,
                    connection: Some(connection),
                });
            }
            if state.open < self.capacity {
                state.open += 1;
                drop(state);
                return match open_read_only(&self.store_path) {
                    Ok(connection) => Ok(PooledConnection {
                        pool: self,
                        connection: Some(connection),
                    }),
                    Err(error) => {
                        self.lock().open -= 1;
                        self.released.notify_one();
                        Err(AcquireError::Open(error.to_string()))
                    }
                };
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                return Err(AcquireError::Timeout);
            }
            state = self
                .released
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, connection: Connection) {
        self.lock().idle.push(connection);
        self.released.notify_one();
    }
}

fn open_read_only(store_path: &Path) -> rusqlite::Result<Connection> {
    let connection = Connection::open_with_flags(
        store_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    connection.pragma_update(None, "query_only", true)?;
    tracing::debug!(store = %store_path.display(), "store_connection_opened");
    Ok(connection)
}

/// Returns its connection to the pool on drop, including after an interrupted statement.
struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    connection: Option<Connection>,
}

impl std::ops::Deref for PooledConnection<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection is only taken on drop"))
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.pool.release(connection);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use rusqlite::Connection;
    use rusqlite::types::Value as SqlValue;
    use serde_json::json;

    use super::{ExecutionError, Executor};
    use crate::config::{ExecutionLimits, PlatformSpec};

    fn seeded_store(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be after unix epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("tabletalk-{prefix}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("temp dir should be created");
        let path = dir.join("hr.db");
        let connection = Connection::open(&path).expect("store should open");
        connection
            .execute_batch(
                "CREATE TABLE Items (ItemID INTEGER PRIMARY KEY, Name TEXT, Payload BLOB);
                 WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n WHERE x < 25)
                 INSERT INTO Items (Name, Payload) SELECT 'item ' || x, x'beef' FROM n;",
            )
            .expect("seed should apply");
        path
    }

    fn executor(store: PathBuf, limits: ExecutionLimits) -> Executor {
        let spec = PlatformSpec {
            id: "hr".to_string(),
            display_name: "HR".to_string(),
            ddl_path: store.with_extension("sql"),
            store_path: store,
        };
        Executor::new(&[spec], limits)
    }

    #[test]
    fn row_cap_truncates_and_flags() {
        let limits = ExecutionLimits {
            row_cap: 10,
            ..ExecutionLimits::default()
        };
        let executor = executor(seeded_store("cap"), limits);
        let result = executor
            .run("hr", "SELECT Name, Payload FROM Items ORDER BY ItemID", &[])
            .expect("query should run");
        assert!(result.truncated);
        assert_eq!(result.row_count, 10);
        assert_eq!(result.rows.len(), 10);
        assert_eq!(result.columns, vec!["Name", "Payload"]);
        assert_eq!(result.rows[0], vec![json!("item 1"), json!("beef")]);
    }

    #[test]
    fn binds_parameters() {
        let executor = executor(seeded_store("params"), ExecutionLimits::default());
        let result = executor
            .run(
                "hr",
                "SELECT COUNT(*) AS Count FROM Items WHERE ItemID > ?1",
                &[SqlValue::Integer(20)],
            )
            .expect("query should run");
        assert!(!result.truncated);
        assert_eq!(result.rows, vec![vec![json!(5)]]);
    }

    #[test]
    fn store_rejects_writes_even_without_validation() {
        let executor = executor(seeded_store("readonly"), ExecutionLimits::default());
        let error = executor
            .run("hr", "DELETE FROM Items", &[])
            .expect_err("write should fail on a read-only connection");
        assert!(matches!(error, ExecutionError::Failed { .. }));
    }

    #[test]
    fn timeout_interrupts_and_returns_connection_to_pool() {
        let limits = ExecutionLimits {
            timeout_ms: 50,
            max_connections: 1,
            ..ExecutionLimits::default()
        };
        let executor = executor(seeded_store("timeout"), limits);
        let error = executor
            .run(
                "hr",
                "WITH RECURSIVE n(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM n) SELECT COUNT(*) FROM n",
                &[],
            )
            .expect_err("endless query should time out");
        assert_eq!(error, ExecutionError::Timeout { timeout_ms: 50 });

        let result = executor
            .run("hr", "SELECT COUNT(*) FROM Items", &[])
            .expect("pooled connection should be reusable");
        assert_eq!(result.rows, vec![vec![json!(25)]]);
    }

    #[test]
    fn missing_store_is_an_execution_failure() {
        let executor = executor(PathBuf::from("/nonexistent/tabletalk/hr.db"), ExecutionLimits::default());
        assert!(matches!(
            executor.run("hr", "SELECT 1", &[]),
            Err(ExecutionError::Failed { .. })
        ));
    }
}
