//! Connection pool facade. Submit blocking database work, get a future back.
//!
//! [`ConnectionPool`] owns a [`Driver`], a [`ConnectionRegistry`] and an
//! [`Executor`]. Each submitted unit of work runs on a worker thread against
//! the connection that worker owns, inside one commit/rollback boundary:
//!
//! | Call                                   | On success                     | On failure          |
//! |----------------------------------------|--------------------------------|---------------------|
//! | [`run_query`](ConnectionPool::run_query)             | fetch all rows, commit | rollback, error   |
//! | [`run_operation`](ConnectionPool::run_operation)     | commit                 | rollback, error   |
//! | [`run_interaction`](ConnectionPool::run_interaction) | close cursor, commit   | rollback, error   |
//!
//! Submissions never block the caller. There is no ordering between two
//! submissions; statements that must run together belong in one interaction.
//! Dropping the returned [`Pending`] does not cancel work a worker already
//! picked up.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::config::{PoolConfig, PoolSnapshot};
use crate::driver::{Connection, Cursor, Driver, RowSet, Statement};
use crate::error::{DriverError, PoolError, PoolResult};
use crate::executor::{self, Executor, Job, ScopeId, ThreadPool, WorkerId, run_as};
use crate::registry::{ConnectionRegistry, SharedConnection};
use crate::transaction::Transaction;

pub mod pending;

pub use pending::{Pending, Resolver};

/// Hook run once on every newly opened connection.
pub type OnConnect<C> = Arc<dyn Fn(&mut C) -> Result<(), DriverError> + Send + Sync + 'static>;

/// Lifecycle state of a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Constructed; submissions are queued until `start`.
    Created,
    Running,
    /// Closed for good. Set as soon as `close` begins; work already accepted
    /// may still be finishing.
    Stopped,
}

struct Lifecycle {
    state: PoolState,
    // Set by `start`; `Drop` acts as the shutdown hook while it is armed.
    shutdown_hook: bool,
}

// State shared with every job.
struct Shared<D: Driver> {
    driver: D,
    config: PoolConfig,
    on_connect: Option<OnConnect<D::Connection>>,
    registry: ConnectionRegistry<D::Connection>,
}

impl<D: Driver> Shared<D> {
    fn connection(&self, worker: WorkerId) -> PoolResult<SharedConnection<D::Connection>> {
        self.registry.acquire(worker, || self.open())
    }

    fn open(&self) -> PoolResult<D::Connection> {
        let connect_error = |source: DriverError| PoolError::Connection {
            driver: self.driver.name().to_owned(),
            source,
        };
        let mut conn = self
            .driver
            .connect(&self.config.connect_args)
            .map_err(connect_error)?;
        if let Some(hook) = &self.on_connect {
            if let Err(source) = hook(&mut conn) {
                if let Err(err) = conn.close() {
                    warn!(driver = self.driver.name(), error = %err, "closing rejected connection failed");
                }
                return Err(connect_error(source));
            }
        }
        Ok(conn)
    }

    fn disconnect(
        &self,
        worker: WorkerId,
        conn: &SharedConnection<D::Connection>,
    ) -> PoolResult<()> {
        match self.registry.get(worker) {
            Some(registered) if Arc::ptr_eq(&registered, conn) => self.registry.release(worker),
            _ => Err(PoolError::Ownership(format!(
                "connection is not registered to {worker}"
            ))),
        }
    }

    fn run_query(&self, worker: WorkerId, statement: Statement) -> PoolResult<RowSet> {
        let slot = self.connection(worker)?;
        let mut conn = slot.lock();
        transact(&mut *conn, |conn| {
            with_cursor(conn, |cursor| {
                cursor.execute(statement.sql(), statement.params())?;
                cursor.fetch_all()
            })
        })
    }

    fn run_operation(&self, worker: WorkerId, statement: Statement) -> PoolResult<()> {
        let slot = self.connection(worker)?;
        let mut conn = slot.lock();
        transact(&mut *conn, |conn| {
            with_cursor(conn, |cursor| cursor.execute(statement.sql(), statement.params()))
        })
    }

    fn run_interaction<T, F, Er>(&self, worker: WorkerId, interaction: F) -> PoolResult<T>
    where
        F: FnOnce(&mut Transaction<'_, D::Connection>) -> Result<T, Er>,
        Er: Into<PoolError>,
    {
        let slot = self.connection(worker)?;
        let mut conn = slot.lock();
        transact(&mut *conn, |conn| {
            let mut txn = Transaction::new(worker, conn)?;
            match interaction(&mut txn) {
                Ok(value) => {
                    txn.close()?;
                    Ok(value)
                }
                Err(err) => {
                    if let Err(close_err) = txn.close() {
                        debug!(%worker, error = %close_err, "closing cursor after failed interaction");
                    }
                    Err(err.into())
                }
            }
        })
    }
}

// Runs `work`, then commits; rolls back if it fails, panics or the commit fails.
fn transact<C, T, F>(conn: &mut C, work: F) -> PoolResult<T>
where
    C: Connection,
    F: FnOnce(&mut C) -> PoolResult<T>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut *conn)))
        .unwrap_or_else(|payload| Err(PoolError::panicked(payload)));
    match outcome {
        Ok(value) => match conn.commit() {
            Ok(()) => Ok(value),
            Err(err) => {
                rollback(conn);
                Err(PoolError::operation(err))
            }
        },
        Err(err) => {
            rollback(conn);
            Err(err)
        }
    }
}

fn rollback<C: Connection>(conn: &mut C) {
    if let Err(err) = conn.rollback() {
        error!(error = %err, "rollback failed; reporting the first error");
    }
}

// Opens a cursor, runs `f` on it and closes it, also when `f` fails.
fn with_cursor<C, T, F>(conn: &mut C, f: F) -> PoolResult<T>
where
    C: Connection,
    F: FnOnce(&mut C::Cursor) -> Result<T, DriverError>,
{
    let mut cursor = conn.cursor().map_err(PoolError::operation)?;
    match f(&mut cursor) {
        Ok(value) => {
            cursor.close().map_err(PoolError::operation)?;
            Ok(value)
        }
        Err(err) => {
            if let Err(close_err) = cursor.close() {
                debug!(error = %close_err, "closing cursor after failed statement");
            }
            Err(PoolError::operation(err))
        }
    }
}

/// Worker-side view of the pool, handed to [`ConnectionPool::run_on_worker`].
pub struct WorkerContext<'a, D: Driver> {
    worker: WorkerId,
    shared: &'a Shared<D>,
}

impl<D: Driver> WorkerContext<'_, D> {
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    /// This worker's connection, opened on first use.
    pub fn connect(&self) -> PoolResult<SharedConnection<D::Connection>> {
        self.shared.connection(self.worker)
    }

    /// Closes this worker's connection and frees its slot.
    ///
    /// The connection must not be locked by the caller.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ownership`] if `conn` is not this worker's connection.
    pub fn disconnect(&self, conn: &SharedConnection<D::Connection>) -> PoolResult<()> {
        self.shared.disconnect(self.worker, conn)
    }
}

/// A pool of worker threads, each owning one connection to the same backend.
///
/// # Examples
///
/// ```rust,no_run
/// use affinity_pool::{ConnectionPool, PoolConfig, driver::sqlite::SqliteDriver};
///
/// # #[tokio::main] async fn main() -> Result<(), affinity_pool::PoolError> {
/// let pool = ConnectionPool::new(
///     SqliteDriver,
///     PoolConfig::new().connect_arg("app.db").min_workers(1).max_workers(4),
/// )?;
/// pool.start()?;
///
/// pool.run_operation("CREATE TABLE IF NOT EXISTS kv (k TEXT, v TEXT)").await?;
/// let rows = pool.run_query("SELECT k, v FROM kv").await?;
/// println!("{} rows", rows.len());
///
/// pool.close();
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<D: Driver, E: Executor = ThreadPool> {
    // Tags this pool's workers, so calls from another pool's jobs are told apart.
    scope: ScopeId,
    shared: Arc<Shared<D>>,
    executor: E,
    // Held only for short reads and writes, never across executor calls.
    lifecycle: Mutex<Lifecycle>,
    // Serializes `start` and `final_close`.
    transition: Mutex<()>,
    closed: AtomicBool,
}

impl<D: Driver> ConnectionPool<D> {
    /// Creates a pool backed by a [`ThreadPool`] sized from `config`.
    ///
    /// # Errors
    ///
    /// [`PoolError::Configuration`] for zero worker bounds or connect arguments
    /// the driver rejects.
    pub fn new(driver: D, config: PoolConfig) -> PoolResult<Self> {
        Self::builder(driver).config(config).build()
    }

    /// Starts a [`PoolBuilder`].
    pub fn builder(driver: D) -> PoolBuilder<D> {
        PoolBuilder::new(driver)
    }

    /// Rebuilds a disconnected pool from a [`PoolSnapshot`].
    ///
    /// The full constructor runs again; no connection state is restored.
    ///
    /// # Errors
    ///
    /// [`PoolError::Configuration`] if `driver` is not the driver the snapshot
    /// was taken with, or the configuration is invalid.
    pub fn from_snapshot(driver: D, snapshot: &PoolSnapshot) -> PoolResult<Self> {
        if driver.name() != snapshot.driver {
            return Err(PoolError::Configuration(format!(
                "snapshot was taken with driver {}, got {}",
                snapshot.driver,
                driver.name()
            )));
        }
        Self::new(driver, snapshot.config())
    }
}

impl<D: Driver, E: Executor> ConnectionPool<D, E> {
    /// Creates a pool that dispatches work through `executor`.
    pub fn with_executor(driver: D, config: PoolConfig, executor: E) -> PoolResult<Self> {
        Self::assemble(driver, config, None, executor)
    }

    fn assemble(
        driver: D,
        config: PoolConfig,
        on_connect: Option<OnConnect<D::Connection>>,
        executor: E,
    ) -> PoolResult<Self> {
        let config = config.reconcile()?;
        driver.check_args(&config.connect_args).map_err(|err| {
            PoolError::Configuration(format!(
                "invalid connect arguments for driver {}: {err}",
                driver.name()
            ))
        })?;

        let label = format!("{}{}", driver.name(), config.connect_args);
        debug!(
            backend = %label,
            min = config.min_workers,
            max = config.max_workers,
            "connection pool created"
        );
        let registry = ConnectionRegistry::new(label, config.verbose);

        Ok(Self {
            scope: ScopeId::next(),
            shared: Arc::new(Shared {
                driver,
                config,
                on_connect,
                registry,
            }),
            executor,
            lifecycle: Mutex::new(Lifecycle {
                state: PoolState::Created,
                shutdown_hook: false,
            }),
            transition: Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock()
    }

    /// Starts the executor. Calling it again while running is a no-op.
    ///
    /// # Errors
    ///
    /// [`PoolError::Lifecycle`] once the pool is closed, or whatever the
    /// executor reports when it cannot start.
    pub fn start(&self) -> PoolResult<()> {
        // Jobs queued before `start` may run inside `executor.start()` and call
        // back into this pool; they see `Running` here.
        if self.state() == PoolState::Running {
            return Ok(());
        }
        let _transition = self.transition.lock();
        {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                PoolState::Running => return Ok(()),
                PoolState::Stopped => return Err(PoolError::Lifecycle("pool is closed".into())),
                PoolState::Created => {
                    lifecycle.state = PoolState::Running;
                    lifecycle.shutdown_hook = true;
                }
            }
        }
        if let Err(err) = self.executor.start() {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = PoolState::Created;
            lifecycle.shutdown_hook = false;
            return Err(err);
        }
        debug!(driver = self.driver_name(), "connection pool started");
        Ok(())
    }

    /// Disarms the shutdown hook and shuts the pool down.
    ///
    /// Idempotent, and safe on a pool that was never started.
    pub fn close(&self) {
        self.lifecycle().shutdown_hook = false;
        self.final_close();
    }

    /// Stops the executor, letting queued work finish, then closes every
    /// connection exactly once.
    ///
    /// Must not be called from inside one of this pool's units of work; such
    /// calls are refused. Work running on another pool may close this one.
    pub fn final_close(&self) {
        if let Some(worker) = executor::worker_in(self.scope) {
            error!(%worker, "connection pool cannot be closed from one of its workers");
            return;
        }
        let _transition = self.transition.lock();
        {
            let mut lifecycle = self.lifecycle();
            lifecycle.state = PoolState::Stopped;
            self.closed.store(true, Ordering::SeqCst);
        }
        self.executor.stop();
        self.shared.registry.close_all();
        debug!(driver = self.driver_name(), "connection pool closed");
    }

    pub fn state(&self) -> PoolState {
        self.lifecycle().state
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Identifier of the driver behind this pool.
    pub fn driver_name(&self) -> &str {
        self.shared.driver.name()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    /// The serializable configuration of this pool.
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot::new(self.driver_name(), &self.shared.config)
    }

    /// Executes `statement` and resolves with every row it produced.
    ///
    /// The cursor is closed and the transaction committed before the rows are
    /// returned. If execute or fetch fails the transaction is rolled back and
    /// no rows are returned.
    pub fn run_query(&self, statement: impl Into<Statement>) -> Pending<RowSet> {
        let statement = statement.into();
        self.submit(move |shared, worker| shared.run_query(worker, statement))
    }

    /// Executes `statement` without fetching, then commits.
    pub fn run_operation(&self, statement: impl Into<Statement>) -> Pending<()> {
        let statement = statement.into();
        self.submit(move |shared, worker| shared.run_operation(worker, statement))
    }

    /// Runs `interaction` with a [`Transaction`] on a worker's connection.
    ///
    /// `Ok(value)` closes the cursor, commits and resolves with `value`.
    /// `Err(err)` (or a panic) rolls back and resolves with the error.
    ///
    /// The closure runs on a worker thread, not on the caller's.
    pub fn run_interaction<T, F, Er>(&self, interaction: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Transaction<'_, D::Connection>) -> Result<T, Er> + Send + 'static,
        Er: Into<PoolError>,
    {
        self.submit(move |shared, worker| shared.run_interaction(worker, interaction))
    }

    /// Runs `f` on a worker with direct access to that worker's connection slot.
    ///
    /// No transaction wrapping is applied.
    pub fn run_on_worker<T, F>(&self, f: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&WorkerContext<'_, D>) -> PoolResult<T> + Send + 'static,
    {
        self.submit(move |shared, worker| f(&WorkerContext { worker, shared }))
    }

    /// The calling worker's connection, opened on first use.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ownership`] when called off one of this pool's workers.
    pub fn connect(&self) -> PoolResult<SharedConnection<D::Connection>> {
        self.shared.connection(self.calling_worker()?)
    }

    /// Closes the calling worker's connection and frees its slot.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ownership`] when called off one of this pool's workers or
    /// with a connection that belongs to another worker.
    pub fn disconnect(&self, conn: &SharedConnection<D::Connection>) -> PoolResult<()> {
        self.shared.disconnect(self.calling_worker()?, conn)
    }

    fn calling_worker(&self) -> PoolResult<WorkerId> {
        executor::worker_in(self.scope)
            .ok_or_else(|| PoolError::Ownership("not called from a worker of this pool".into()))
    }

    fn submit<T, F>(&self, work: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&Shared<D>, WorkerId) -> PoolResult<T> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Pending::ready(Err(PoolError::Lifecycle("pool is closed".into())));
        }

        let (pending, resolver) = Pending::channel();
        let shared = Arc::clone(&self.shared);
        let scope = self.scope;
        let job: Job = Box::new(move |worker| {
            let outcome = run_as(scope, worker, || {
                panic::catch_unwind(AssertUnwindSafe(|| work(&*shared, worker)))
                    .unwrap_or_else(|payload| Err(PoolError::panicked(payload)))
            });
            resolver.resolve(outcome);
        });

        match self.executor.execute(job) {
            Ok(()) => pending,
            Err(err) => Pending::ready(Err(err)),
        }
    }
}

impl<D: Driver, E: Executor> Drop for ConnectionPool<D, E> {
    fn drop(&mut self) {
        let armed = self.lifecycle().shutdown_hook;
        if armed || self.state() != PoolState::Stopped {
            self.final_close();
        }
    }
}

/// Builder for [`ConnectionPool`].
///
/// # Examples
///
/// ```
/// use affinity_pool::ConnectionPool;
/// use affinity_pool::driver::sqlite::{SqliteDriver, MEMORY};
///
/// let pool = ConnectionPool::builder(SqliteDriver)
///     .connect_arg(MEMORY)
///     .min_workers(1)
///     .max_workers(1)
///     .verbose(false)
///     .on_connect(|conn| conn.with_raw(|raw| raw.execute_batch("PRAGMA foreign_keys = ON")))
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.driver_name(), "sqlite");
/// ```
pub struct PoolBuilder<D: Driver> {
    driver: D,
    config: PoolConfig,
    on_connect: Option<OnConnect<D::Connection>>,
}

impl<D: Driver> PoolBuilder<D> {
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            config: PoolConfig::default(),
            on_connect: None,
        }
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connect_arg(mut self, value: impl Into<crate::driver::Value>) -> Self {
        self.config = self.config.connect_arg(value);
        self
    }

    pub fn named_arg(
        mut self,
        key: impl Into<String>,
        value: impl Into<crate::driver::Value>,
    ) -> Self {
        self.config = self.config.named_arg(key, value);
        self
    }

    pub fn min_workers(mut self, min: usize) -> Self {
        self.config = self.config.min_workers(min);
        self
    }

    pub fn max_workers(mut self, max: usize) -> Self {
        self.config = self.config.max_workers(max);
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config = self.config.verbose(verbose);
        self
    }

    /// Runs `hook` once on every newly opened connection, e.g. to set a
    /// charset or pragmas. A failing hook fails the connect.
    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(&mut D::Connection) -> Result<(), DriverError> + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    /// Builds a pool backed by a [`ThreadPool`].
    pub fn build(self) -> PoolResult<ConnectionPool<D>> {
        let config = self.config.reconcile()?;
        let executor = ThreadPool::new(
            format!("{}-pool", self.driver.name()),
            config.min_workers,
            config.max_workers,
        );
        ConnectionPool::assemble(self.driver, config, self.on_connect, executor)
    }

    /// Builds a pool that dispatches through `executor`.
    pub fn build_with<E: Executor>(self, executor: E) -> PoolResult<ConnectionPool<D, E>> {
        ConnectionPool::assemble(self.driver, self.config, self.on_connect, executor)
    }
}
