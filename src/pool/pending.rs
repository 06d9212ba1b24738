//! The future returned for every submitted unit of work.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::{PoolError, PoolResult};

/// Resolves exactly once with the outcome of a unit of work.
///
/// Dropping a `Pending` does not cancel the work: a worker that already picked
/// it up runs it to completion (commit or rollback) and discards the result.
///
/// # Examples
///
/// ```
/// use affinity_pool::pool::Pending;
///
/// # #[tokio::main] async fn main() {
/// let (pending, resolver) = Pending::<u32>::channel();
/// resolver.resolve(Ok(5));
/// assert_eq!(pending.await.unwrap(), 5);
/// # }
/// ```
#[must_use = "a Pending does nothing unless awaited or waited on"]
pub struct Pending<T> {
    inner: Inner<T>,
}

enum Inner<T> {
    Waiting(oneshot::Receiver<PoolResult<T>>),
    Ready(Option<PoolResult<T>>),
}

/// Sending half of a [`Pending`].
pub struct Resolver<T> {
    tx: oneshot::Sender<PoolResult<T>>,
}

impl<T> Resolver<T> {
    /// Resolves the paired [`Pending`]. Ignored if it was dropped.
    pub fn resolve(self, result: PoolResult<T>) {
        let _ = self.tx.send(result);
    }
}

impl<T> Pending<T> {
    /// Creates a future and the resolver that completes it.
    pub fn channel() -> (Self, Resolver<T>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Inner::Waiting(rx),
            },
            Resolver { tx },
        )
    }

    /// A future that is already resolved with `result`.
    pub fn ready(result: PoolResult<T>) -> Self {
        Self {
            inner: Inner::Ready(Some(result)),
        }
    }

    /// Blocks the current thread until the work completes.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context; use
    /// `.await` there instead.
    pub fn wait(self) -> PoolResult<T> {
        match self.inner {
            Inner::Waiting(rx) => rx.blocking_recv().unwrap_or(Err(PoolError::Abandoned)),
            Inner::Ready(result) => result.unwrap_or(Err(PoolError::Abandoned)),
        }
    }
}

// `T` is only ever moved out, never pinned.
impl<T> Unpin for Pending<T> {}

impl<T> Future for Pending<T> {
    type Output = PoolResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.inner {
            Inner::Waiting(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(Err(PoolError::Abandoned)),
                Poll::Pending => Poll::Pending,
            },
            Inner::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(PoolError::Abandoned)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_with_sent_value() {
        let (pending, resolver) = Pending::<&str>::channel();
        tokio::spawn(async move { resolver.resolve(Ok("done")) });
        assert_eq!(pending.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn dropped_resolver_is_abandoned() {
        let (pending, resolver) = Pending::<()>::channel();
        drop(resolver);
        assert!(matches!(pending.await, Err(PoolError::Abandoned)));
    }

    #[tokio::test]
    async fn ready_future_resolves_immediately() {
        let pending = Pending::<u8>::ready(Err(PoolError::Lifecycle("closed".into())));
        assert!(matches!(pending.await, Err(PoolError::Lifecycle(_))));
    }

    #[test]
    fn wait_blocks_for_other_thread() {
        let (pending, resolver) = Pending::channel();
        let handle = std::thread::spawn(move || resolver.resolve(Ok(3)));
        assert_eq!(pending.wait().unwrap(), 3);
        handle.join().unwrap();
    }

    #[test]
    fn wait_on_ready() {
        assert_eq!(Pending::ready(Ok(1)).wait().unwrap(), 1);
    }
}
