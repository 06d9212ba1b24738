//! Driver capability contract.
//!
//! The pool never talks to a database directly. It drives a blocking,
//! synchronous driver through three traits:
//!
//! - [`Driver`]: opens connections from [`ConnectArgs`].
//! - [`Connection`]: hands out cursors and owns the transaction boundary.
//! - [`Cursor`]: executes statements and fetches rows.
//!
//! Every call may block; the pool only ever invokes them on a worker thread.
//!
//! ## Drivers
//!
//! - [`sqlite::SqliteDriver`]: bundled SQLite driver (feature `sqlite`).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DriverError;

pub mod value;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
pub(crate) mod mock;

pub use value::{Row, RowSet, Value};

/// Positional and named arguments forwarded verbatim to [`Driver::connect`].
///
/// # Examples
///
/// ```
/// use affinity_pool::driver::{ConnectArgs, Value};
///
/// let args = ConnectArgs::new()
///     .arg("app.db")
///     .named("busy_timeout_ms", 500);
///
/// assert_eq!(args.get(0), Some(&Value::Text("app.db".into())));
/// assert_eq!(args.get_named("busy_timeout_ms"), Some(&Value::Integer(500)));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectArgs {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub named: BTreeMap<String, Value>,
}

impl ConnectArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Sets a named argument, replacing any previous value under `key`.
    pub fn named(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    pub fn get_named(&self, key: &str) -> Option<&Value> {
        self.named.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.named.is_empty()
    }
}

impl fmt::Display for ConnectArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        let mut first = true;
        for value in &self.positional {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{value}")?;
            first = false;
        }
        for (key, value) in &self.named {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{key}={value}")?;
            first = false;
        }
        write!(f, ")")
    }
}

/// A statement and its bound parameters.
///
/// # Examples
///
/// ```
/// use affinity_pool::driver::Statement;
///
/// let stmt = Statement::new("SELECT * FROM users WHERE id = ?").bind(42);
/// assert_eq!(stmt.params().len(), 1);
///
/// let plain: Statement = "SELECT 1".into();
/// assert!(plain.params().is_empty());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    sql: String,
    params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Binds the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

impl From<&str> for Statement {
    fn from(sql: &str) -> Self {
        Statement::new(sql)
    }
}

impl From<String> for Statement {
    fn from(sql: String) -> Self {
        Statement::new(sql)
    }
}

impl<S> From<(S, Vec<Value>)> for Statement
where
    S: Into<String>,
{
    fn from((sql, params): (S, Vec<Value>)) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Opens connections to one kind of backend.
///
/// # Contract
///
/// - `connect` may block and may fail; the pool calls it from a worker thread.
/// - `name` is the driver identifier persisted in [`PoolSnapshot`](crate::config::PoolSnapshot).
pub trait Driver: Send + Sync + 'static {
    type Connection: Connection;

    /// Stable identifier of this driver.
    fn name(&self) -> &str;

    /// Validates connect arguments before any connection is attempted.
    ///
    /// Called once at pool construction; an error here becomes a
    /// configuration error.
    fn check_args(&self, _args: &ConnectArgs) -> Result<(), DriverError> {
        Ok(())
    }

    /// Opens a new connection.
    fn connect(&self, args: &ConnectArgs) -> Result<Self::Connection, DriverError>;
}

/// A live connection owned by exactly one worker.
pub trait Connection: Send + 'static {
    type Cursor: Cursor;

    /// Opens a fresh cursor.
    fn cursor(&mut self) -> Result<Self::Cursor, DriverError>;

    fn commit(&mut self) -> Result<(), DriverError>;

    fn rollback(&mut self) -> Result<(), DriverError>;

    /// Closes the connection. The pool calls this at most once per connection.
    fn close(&mut self) -> Result<(), DriverError>;
}

/// Executes statements and fetches their rows.
pub trait Cursor: Send {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<(), DriverError>;

    /// Fetches the next row, or `None` when the result set is exhausted.
    fn fetch_one(&mut self) -> Result<Option<Row>, DriverError>;

    /// Fetches up to `size` rows.
    fn fetch_many(&mut self, size: usize) -> Result<RowSet, DriverError> {
        let mut rows = Vec::with_capacity(size);
        while rows.len() < size {
            match self.fetch_one()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// Fetches every remaining row.
    fn fetch_all(&mut self) -> Result<RowSet, DriverError> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetch_one()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Rows affected by the last statement, when the driver knows it.
    fn rowcount(&self) -> Option<u64> {
        None
    }

    /// Column names of the last result set.
    fn columns(&self) -> &[String] {
        &[]
    }

    fn close(&mut self) -> Result<(), DriverError>;
}
