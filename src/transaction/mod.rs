//! Transaction handle passed to interactions.

use tracing::debug;

use crate::driver::{Connection, Cursor, Row, RowSet, Statement};
use crate::error::{PoolError, PoolResult};
use crate::executor::WorkerId;

/// A cursor bound to the worker's connection for the length of one interaction.
///
/// Everything executed through a `Transaction` shares one commit/rollback
/// boundary: the pool commits when the interaction returns `Ok` and rolls back
/// when it returns `Err` or panics. The handle never hands out a closed
/// cursor: after [`close`](Self::close), the next call that needs a cursor
/// opens a fresh one.
///
/// Operations the handle does not wrap are available on the driver cursor
/// through [`cursor`](Self::cursor). Close it through the handle, not the
/// driver cursor.
///
/// # Examples
///
/// ```rust,no_run
/// use affinity_pool::{ConnectionPool, PoolConfig, PoolError};
/// use affinity_pool::driver::sqlite::SqliteDriver;
///
/// # async fn run(pool: ConnectionPool<SqliteDriver>) -> Result<(), PoolError> {
/// let total = pool
///     .run_interaction(|txn| {
///         txn.execute("INSERT INTO log (msg) VALUES ('hi')")?;
///         txn.execute("SELECT COUNT(*) FROM log")?;
///         Ok::<_, PoolError>(txn.fetch_one()?)
///     })
///     .await?;
/// # let _ = total;
/// # Ok(())
/// # }
/// ```
pub struct Transaction<'c, C: Connection> {
    worker: WorkerId,
    connection: &'c mut C,
    cursor: C::Cursor,
    closed: bool,
}

impl<'c, C: Connection> Transaction<'c, C> {
    /// Binds a new handle to `connection` and opens its first cursor.
    pub fn new(worker: WorkerId, connection: &'c mut C) -> PoolResult<Self> {
        let cursor = connection.cursor().map_err(PoolError::operation)?;
        Ok(Self {
            worker,
            connection,
            cursor,
            closed: false,
        })
    }

    /// The worker this transaction runs on.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// Replaces the cursor with a fresh one from the same connection.
    ///
    /// The new cursor is opened before the old one is closed; if opening fails
    /// the current cursor is kept.
    pub fn reopen(&mut self) -> PoolResult<()> {
        let fresh = self.connection.cursor().map_err(PoolError::operation)?;
        let mut old = std::mem::replace(&mut self.cursor, fresh);
        if std::mem::replace(&mut self.closed, false) {
            return Ok(());
        }
        old.close().map_err(PoolError::operation)
    }

    // The current cursor, reopened first if it was closed.
    fn live(&mut self) -> PoolResult<&mut C::Cursor> {
        if self.closed {
            debug!(worker = %self.worker, "reopening closed cursor");
            self.reopen()?;
        }
        Ok(&mut self.cursor)
    }

    /// Executes a statement on the current cursor.
    pub fn execute(&mut self, statement: impl Into<Statement>) -> PoolResult<()> {
        let statement = statement.into();
        debug!(worker = %self.worker, sql = statement.sql(), "execute");
        self.live()?
            .execute(statement.sql(), statement.params())
            .map_err(PoolError::operation)
    }

    pub fn fetch_one(&mut self) -> PoolResult<Option<Row>> {
        self.live()?.fetch_one().map_err(PoolError::operation)
    }

    pub fn fetch_many(&mut self, size: usize) -> PoolResult<RowSet> {
        self.live()?.fetch_many(size).map_err(PoolError::operation)
    }

    pub fn fetch_all(&mut self) -> PoolResult<RowSet> {
        self.live()?.fetch_all().map_err(PoolError::operation)
    }

    pub fn rowcount(&self) -> Option<u64> {
        self.cursor.rowcount()
    }

    pub fn columns(&self) -> &[String] {
        self.cursor.columns()
    }

    /// Closes the current cursor. Closing twice is a no-op; the next execute
    /// or fetch works on a fresh cursor.
    pub fn close(&mut self) -> PoolResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.cursor.close().map_err(PoolError::operation)
    }

    /// The underlying driver cursor, reopened first if it was closed.
    pub fn cursor(&mut self) -> PoolResult<&mut C::Cursor> {
        self.live()
    }
}
