//! Connection registry: one connection per worker.
//!
//! The registry is the only structure touched by several threads: each worker
//! inserts and removes its own slot, and the controller scans it at shutdown.
//! Opening a connection happens outside the registry lock, so a slow `connect`
//! on one worker never stalls another.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::driver::Connection;
use crate::error::{PoolError, PoolResult};
use crate::executor::WorkerId;

/// A connection bound to one worker.
///
/// The mutex is only ever taken by the owning worker (and by shutdown once
/// the workers are gone), so it is uncontended.
pub type SharedConnection<C> = Arc<Mutex<C>>;

/// Maps each worker to the connection it opened.
pub struct ConnectionRegistry<C> {
    label: String,
    verbose: bool,
    slots: Mutex<HashMap<WorkerId, SharedConnection<C>>>,
}

impl<C: Connection> ConnectionRegistry<C> {
    /// `label` identifies the backend in log lines; `verbose` enables
    /// informational logging of connection open/close.
    pub fn new(label: impl Into<String>, verbose: bool) -> Self {
        Self {
            label: label.into(),
            verbose,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the connection registered for `worker`, if any.
    pub fn get(&self, worker: WorkerId) -> Option<SharedConnection<C>> {
        self.slots.lock().get(&worker).cloned()
    }

    /// Returns the worker's connection, opening it with `open` on first use.
    ///
    /// If `open` fails the slot stays empty and the next call retries.
    pub fn acquire<F>(&self, worker: WorkerId, open: F) -> PoolResult<SharedConnection<C>>
    where
        F: FnOnce() -> PoolResult<C>,
    {
        if let Some(conn) = self.get(worker) {
            return Ok(conn);
        }

        if self.verbose {
            info!(backend = %self.label, %worker, "connecting");
        }
        let conn = Arc::new(Mutex::new(open()?));

        // Only `worker` fills its own slot, so nothing can have raced us here.
        self.slots.lock().insert(worker, Arc::clone(&conn));
        debug!(backend = %self.label, %worker, "connection registered");
        Ok(conn)
    }

    /// Removes and closes the worker's connection.
    ///
    /// # Errors
    ///
    /// [`PoolError::Ownership`] if the worker has no connection.
    pub fn release(&self, worker: WorkerId) -> PoolResult<()> {
        let conn = self.slots.lock().remove(&worker).ok_or_else(|| {
            PoolError::Ownership(format!("{worker} has no registered connection"))
        })?;
        self.close(worker, &conn);
        Ok(())
    }

    /// Closes every registered connection and empties the registry.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.slots.lock().drain().collect();
        for (worker, conn) in drained {
            self.close(worker, &conn);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    fn close(&self, worker: WorkerId, conn: &SharedConnection<C>) {
        if self.verbose {
            info!(backend = %self.label, %worker, "closing connection");
        }
        if let Err(err) = conn.lock().close() {
            warn!(backend = %self.label, %worker, error = %err, "error while closing connection");
        }
    }
}
