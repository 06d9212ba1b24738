//! Error types shared by the pool, the executor and the drivers.

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

/// Error type returned by driver implementations.
///
/// Drivers are external collaborators, so their failures are carried as opaque
/// boxed errors and classified by the pool according to where they happened.
pub type DriverError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors produced by the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Invalid pool configuration, reported synchronously at construction.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The driver failed to open a connection (or the on-connect hook failed).
    #[error("failed to connect with driver {driver}: {source}")]
    Connection {
        driver: String,
        #[source]
        source: DriverError,
    },

    /// A cursor or commit call failed inside a unit of work.
    #[error("operation failed: {0}")]
    Operation(#[source] DriverError),

    /// The user-supplied interaction returned its own error.
    #[error("interaction failed: {0}")]
    Interaction(#[source] DriverError),

    /// A connection was touched by a worker that does not own it.
    #[error("ownership error: {0}")]
    Ownership(String),

    /// The pool is in the wrong lifecycle state for the request.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The unit of work panicked; the connection was rolled back.
    #[error("unit of work panicked: {0}")]
    Panicked(String),

    /// The unit of work was dropped before a worker ran it.
    #[error("unit of work was abandoned before it ran")]
    Abandoned,
}

impl PoolError {
    /// Wraps an arbitrary error raised by an interaction function.
    ///
    /// # Examples
    ///
    /// ```
    /// use affinity_pool::PoolError;
    ///
    /// let err = PoolError::interaction(std::fmt::Error);
    /// assert!(matches!(err, PoolError::Interaction(_)));
    /// ```
    pub fn interaction<E>(err: E) -> Self
    where
        E: Into<DriverError>,
    {
        PoolError::Interaction(err.into())
    }

    pub(crate) fn operation<E>(err: E) -> Self
    where
        E: Into<DriverError>,
    {
        PoolError::Operation(err.into())
    }

    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_owned()
        };
        PoolError::Panicked(message)
    }

    /// Returns the underlying error of an interaction failure, downcast to `E`.
    pub fn interaction_error<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            PoolError::Interaction(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type PoolResult<T> = Result<T, PoolError>;
