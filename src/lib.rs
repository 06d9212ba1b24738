//! # affinity-pool
//!
//! Runs blocking, synchronous database drivers behind futures. A bounded pool
//! of worker threads each owns one persistent connection; every unit of work
//! is routed to a worker and wrapped in commit/rollback.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use affinity_pool::{ConnectionPool, PoolConfig, PoolError};
//! use affinity_pool::driver::sqlite::SqliteDriver;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), PoolError> {
//!     let pool = ConnectionPool::new(SqliteDriver, PoolConfig::new().connect_arg("app.db"))?;
//!     pool.start()?;
//!
//!     pool.run_operation("CREATE TABLE IF NOT EXISTS users (name TEXT)").await?;
//!     let count = pool
//!         .run_interaction(|txn| {
//!             txn.execute("INSERT INTO users (name) VALUES ('ada')")?;
//!             txn.execute("SELECT COUNT(*) FROM users")?;
//!             Ok::<_, PoolError>(txn.fetch_one()?)
//!         })
//!         .await?;
//!     println!("{count:?}");
//!
//!     pool.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod transaction;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use config::{PoolConfig, PoolSnapshot};
pub use driver::{ConnectArgs, Row, RowSet, Statement, Value};
pub use error::{DriverError, PoolError, PoolResult};
pub use executor::{Executor, InlineExecutor, ScopeId, ThreadPool, WorkerId};
pub use pool::{ConnectionPool, Pending, PoolBuilder, PoolState};
pub use transaction::Transaction;
