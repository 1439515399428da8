use std::{future::Future, io, time::Duration};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Deadline and cancellation scope for a network operation
///
/// A `Context` is cheap to clone; clones share the same cancellation state. Children created with
/// [`Context::with_timeout`] or [`Context::child`] are cancelled together with their parent and
/// never outlive its deadline, but cancelling a child leaves the parent untouched.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a child context that expires after `timeout`
    ///
    /// A timeout too large to represent as an instant imposes no deadline of its own.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a child context that expires at `deadline`, or at the parent's deadline if earlier
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            deadline: Some(deadline),
            cancel: self.cancel.child_token(),
        }
    }

    /// Derive a child context with the same deadline that can be cancelled on its own
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            cancel: self.cancel.child_token(),
        }
    }

    /// The instant at which operations bound to this context time out
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and all of its children
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether this context has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Drive `future` until it completes, the context is cancelled, or the deadline passes
    ///
    /// On cancellation or expiry `future` is dropped, aborting whatever it was doing, and an
    /// [`io::ErrorKind::Interrupted`] or [`io::ErrorKind::TimedOut`] error is returned.
    pub async fn run<T, F>(&self, future: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        if self.is_cancelled() {
            return Err(cancelled());
        }
        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, future)
                    .await
                    .unwrap_or_else(|_| Err(timed_out())),
                None => future.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(cancelled()),
            res = bounded => res,
        }
    }
}

/// Releases the context's resources when dropped
///
/// Returned by [`Context::guard`] so that a derived context is cancelled on every exit path.
#[derive(Debug)]
pub struct ContextGuard(Context);

impl ContextGuard {
    /// The guarded context
    pub fn context(&self) -> &Context {
        &self.0
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl Context {
    /// Wrap this context in a guard that cancels it when dropped
    pub fn guard(self) -> ContextGuard {
        ContextGuard(self)
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o timeout")
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation was canceled")
}
