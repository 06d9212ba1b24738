//! SQLite driver backed by [`rusqlite`].
//!
//! Connect arguments:
//!
//! | Argument                         | Meaning                                     |
//! |----------------------------------|---------------------------------------------|
//! | positional `0` / `path` / `database` | database file, or `":memory:"`           |
//! | `busy_timeout_ms`                | busy handler timeout in milliseconds        |
//!
//! SQLite runs in autocommit mode unless a transaction is open. The driver
//! issues a deferred `BEGIN` before the first statement on an idle connection
//! so that the pool's commit/rollback always brackets the work.
//!
//! Every connection to [`MEMORY`] is a separate, private database. A pool
//! opens one connection per worker, so with more than one worker each worker
//! sees its own empty database; use a file path to share data between them.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

use super::{ConnectArgs, Connection, Cursor, Driver, Row, RowSet, Value};
use crate::error::DriverError;

/// Special path that opens a private in-memory database.
///
/// Private per connection: a pool with more than one worker gets one
/// independent database per worker.
pub const MEMORY: &str = ":memory:";

/// Opens [`SqliteConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDriver;

impl SqliteDriver {
    pub fn new() -> Self {
        Self
    }

    fn path(args: &ConnectArgs) -> Result<&str, DriverError> {
        let value = args
            .get(0)
            .or_else(|| args.get_named("path"))
            .or_else(|| args.get_named("database"))
            .ok_or("missing database path")?;
        value
            .as_str()
            .ok_or_else(|| format!("database path must be text, got {value}").into())
    }
}

impl Driver for SqliteDriver {
    type Connection = SqliteConnection;

    fn name(&self) -> &str {
        "sqlite"
    }

    fn check_args(&self, args: &ConnectArgs) -> Result<(), DriverError> {
        Self::path(args)?;
        if let Some(timeout) = args.get_named("busy_timeout_ms") {
            match timeout.as_i64() {
                Some(ms) if ms >= 0 => {}
                _ => return Err(format!("busy_timeout_ms must be a non-negative integer, got {timeout}").into()),
            }
        }
        Ok(())
    }

    fn connect(&self, args: &ConnectArgs) -> Result<SqliteConnection, DriverError> {
        let path = Self::path(args)?;
        let conn = if path == MEMORY {
            rusqlite::Connection::open_in_memory()?
        } else {
            rusqlite::Connection::open(path)?
        };
        if let Some(ms) = args.get_named("busy_timeout_ms").and_then(Value::as_i64) {
            conn.busy_timeout(Duration::from_millis(ms.max(0) as u64))?;
        }
        Ok(SqliteConnection {
            inner: Arc::new(Mutex::new(Some(conn))),
        })
    }
}

type Shared = Arc<Mutex<Option<rusqlite::Connection>>>;

/// A single SQLite database handle.
///
/// Cursors share the handle, so they stay usable until the connection is
/// closed.
pub struct SqliteConnection {
    inner: Shared,
}

impl SqliteConnection {
    /// Runs `f` against the raw [`rusqlite::Connection`].
    ///
    /// Useful from an on-connect hook, e.g. to set pragmas.
    pub fn with_raw<T>(
        &mut self,
        f: impl FnOnce(&rusqlite::Connection) -> rusqlite::Result<T>,
    ) -> Result<T, DriverError> {
        let guard = self.inner.lock();
        let conn = guard.as_ref().ok_or("connection is closed")?;
        Ok(f(conn)?)
    }

    fn finish(&mut self, verb: &str) -> Result<(), DriverError> {
        let guard = self.inner.lock();
        let conn = guard.as_ref().ok_or("connection is closed")?;
        if !conn.is_autocommit() {
            conn.execute_batch(verb)?;
        }
        Ok(())
    }
}

impl Connection for SqliteConnection {
    type Cursor = SqliteCursor;

    fn cursor(&mut self) -> Result<SqliteCursor, DriverError> {
        if self.inner.lock().is_none() {
            return Err("connection is closed".into());
        }
        Ok(SqliteCursor {
            conn: Arc::clone(&self.inner),
            rows: VecDeque::new(),
            columns: Vec::new(),
            rowcount: None,
            closed: false,
        })
    }

    fn commit(&mut self) -> Result<(), DriverError> {
        self.finish("COMMIT")
    }

    fn rollback(&mut self) -> Result<(), DriverError> {
        self.finish("ROLLBACK")
    }

    fn close(&mut self) -> Result<(), DriverError> {
        let mut guard = self.inner.lock();
        if let Some(conn) = guard.take() {
            if let Err((conn, err)) = conn.close() {
                *guard = Some(conn);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

/// Buffered cursor over a [`SqliteConnection`].
///
/// `execute` runs the statement to completion and buffers its rows; fetches
/// drain the buffer.
pub struct SqliteCursor {
    conn: Shared,
    rows: VecDeque<Row>,
    columns: Vec<String>,
    rowcount: Option<u64>,
    closed: bool,
}

impl SqliteCursor {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err("cursor is closed".into());
        }
        Ok(())
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::from(rusqlite::types::Null),
            Value::Integer(i) => ToSqlOutput::from(*i),
            Value::Real(f) => ToSqlOutput::from(*f),
            Value::Text(s) => ToSqlOutput::from(s.as_str()),
            Value::Blob(b) => ToSqlOutput::from(b.as_slice()),
        })
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(f) => Value::Real(f),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

impl Cursor for SqliteCursor {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError> {
        self.check_open()?;
        let guard = self.conn.lock();
        let conn = guard.as_ref().ok_or("connection is closed")?;
        if conn.is_autocommit() {
            conn.execute_batch("BEGIN")?;
        }

        let mut stmt = conn.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = VecDeque::new();
        let rowcount = if columns.is_empty() {
            stmt.execute(rusqlite::params_from_iter(params.iter()))? as u64
        } else {
            let width = columns.len();
            let mut cursor = stmt.query(rusqlite::params_from_iter(params.iter()))?;
            while let Some(row) = cursor.next()? {
                let mut values = Vec::with_capacity(width);
                for i in 0..width {
                    values.push(Value::from(row.get_ref(i)?));
                }
                rows.push_back(values);
            }
            rows.len() as u64
        };
        drop(stmt);
        drop(guard);

        self.columns = columns;
        self.rows = rows;
        self.rowcount = Some(rowcount);
        Ok(())
    }

    fn fetch_one(&mut self) -> Result<Option<Row>, DriverError> {
        self.check_open()?;
        Ok(self.rows.pop_front())
    }

    fn fetch_all(&mut self) -> Result<RowSet, DriverError> {
        self.check_open()?;
        Ok(self.rows.drain(..).collect())
    }

    fn rowcount(&self) -> Option<u64> {
        self.rowcount
    }

    fn columns(&self) -> &[String] {
        &self.columns
    }

    fn close(&mut self) -> Result<(), DriverError> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> SqliteConnection {
        SqliteDriver
            .connect(&ConnectArgs::new().arg(MEMORY))
            .unwrap()
    }

    #[test]
    fn check_args_requires_path() {
        assert!(SqliteDriver.check_args(&ConnectArgs::new()).is_err());
        assert!(SqliteDriver.check_args(&ConnectArgs::new().arg(1)).is_err());
        assert!(SqliteDriver.check_args(&ConnectArgs::new().named("path", MEMORY)).is_ok());
        assert!(
            SqliteDriver
                .check_args(&ConnectArgs::new().arg(MEMORY).named("busy_timeout_ms", -1))
                .is_err()
        );
    }

    #[test]
    fn select_returns_typed_rows() {
        let mut conn = memory();
        let mut cursor = conn.cursor().unwrap();
        cursor
            .execute("SELECT 1, 2.5, 'x', NULL, ?", &[Value::Blob(vec![9])])
            .unwrap();
        assert_eq!(cursor.columns().len(), 5);
        let rows = cursor.fetch_all().unwrap();
        assert_eq!(
            rows,
            vec![vec![
                Value::Integer(1),
                Value::Real(2.5),
                Value::Text("x".into()),
                Value::Null,
                Value::Blob(vec![9]),
            ]]
        );
        assert!(cursor.fetch_one().unwrap().is_none());
    }

    #[test]
    fn rollback_discards_writes() {
        let mut conn = memory();
        let mut cursor = conn.cursor().unwrap();
        cursor.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();
        conn.commit().unwrap();

        cursor.execute("INSERT INTO t VALUES (?)", &[Value::from(1)]).unwrap();
        assert_eq!(cursor.rowcount(), Some(1));
        conn.rollback().unwrap();

        cursor.execute("SELECT COUNT(*) FROM t", &[]).unwrap();
        assert_eq!(cursor.fetch_all().unwrap(), vec![vec![Value::Integer(0)]]);
        conn.commit().unwrap();
    }

    #[test]
    fn memory_connections_are_private() {
        let mut first = memory();
        let mut second = memory();
        let mut cursor = first.cursor().unwrap();
        cursor.execute("CREATE TABLE t (v INTEGER)", &[]).unwrap();
        first.commit().unwrap();

        let mut other = second.cursor().unwrap();
        assert!(other.execute("SELECT v FROM t", &[]).is_err());
        second.rollback().unwrap();
    }

    #[test]
    fn commit_without_transaction_is_noop() {
        let mut conn = memory();
        conn.commit().unwrap();
        conn.rollback().unwrap();
    }

    #[test]
    fn closed_cursor_rejects_use() {
        let mut conn = memory();
        let mut cursor = conn.cursor().unwrap();
        cursor.close().unwrap();
        assert!(cursor.execute("SELECT 1", &[]).is_err());
        assert!(cursor.fetch_one().is_err());
    }

    #[tokio::test]
    async fn pool_runs_units_on_one_in_memory_database() {
        use crate::{ConnectionPool, PoolConfig, PoolError, Statement};

        let pool = ConnectionPool::new(
            SqliteDriver,
            PoolConfig::new()
                .connect_arg(MEMORY)
                .min_workers(1)
                .max_workers(1)
                .verbose(false),
        )
        .unwrap();
        pool.start().unwrap();

        pool.run_operation("CREATE TABLE kv (k TEXT PRIMARY KEY, v INTEGER)")
            .await
            .unwrap();
        pool.run_operation(Statement::new("INSERT INTO kv VALUES (?, ?)").bind("a").bind(1))
            .await
            .unwrap();

        // A failing interaction leaves no trace.
        let err = pool
            .run_interaction(|txn| {
                txn.execute(Statement::new("INSERT INTO kv VALUES (?, ?)").bind("b").bind(2))?;
                txn.execute(Statement::new("INSERT INTO kv VALUES (?, ?)").bind("a").bind(3))?;
                Ok::<_, PoolError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Operation(_)));

        let rows = pool.run_query("SELECT k, v FROM kv ORDER BY k").await.unwrap();
        assert_eq!(rows, vec![vec![Value::from("a"), Value::from(1)]]);
        pool.close();
    }

    #[test]
    fn close_is_idempotent_and_invalidates_cursors() {
        let mut conn = memory();
        let mut cursor = conn.cursor().unwrap();
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(cursor.execute("SELECT 1", &[]).is_err());
        assert!(conn.cursor().is_err());
    }
}
