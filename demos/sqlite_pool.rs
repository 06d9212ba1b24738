//! Runs a handful of concurrent SQLite units of work through a pool.
//!
//! ```text
//! RUST_LOG=debug cargo run --example sqlite_pool
//! ```

use affinity_pool::driver::sqlite::SqliteDriver;
use affinity_pool::{ConnectionPool, PoolError, Statement};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let path = std::env::temp_dir().join("affinity_pool_demo.sqlite");
    let _ = std::fs::remove_file(&path);

    let pool = ConnectionPool::builder(SqliteDriver)
        .connect_arg(path.to_string_lossy().into_owned())
        .named_arg("busy_timeout_ms", 5_000)
        .min_workers(1)
        .max_workers(3)
        .on_connect(|conn| {
            conn.with_raw(|raw| {
                raw.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
                    .map(|_| ())
            })
        })
        .build()?;
    pool.start()?;

    pool.run_operation("CREATE TABLE events (worker TEXT, n INTEGER)")
        .await?;

    let pending: Vec<_> = (0..10)
        .map(|n| {
            pool.run_interaction(move |txn| {
                let worker = txn.worker().to_string();
                txn.execute(
                    Statement::new("INSERT INTO events (worker, n) VALUES (?, ?)")
                        .bind(worker)
                        .bind(n),
                )?;
                Ok::<_, PoolError>(())
            })
        })
        .collect();
    for p in pending {
        p.await?;
    }

    let rows = pool
        .run_query("SELECT worker, COUNT(*) FROM events GROUP BY worker ORDER BY worker")
        .await?;
    for row in rows {
        println!("{} ran {} inserts", row[0], row[1]);
    }
    println!("snapshot: {}", pool.snapshot().to_json()?);

    pool.close();
    Ok(())
}
