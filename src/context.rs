//! Deadline and cancellation contexts for database calls.
//!
//! A [`Context`] is a value describing how long an operation may run: an optional deadline and an
//! optional cancellation signal. Contexts form a tree; cancelling one cancels everything derived
//! from it. Nothing here touches the database by itself. Callers bound a driver call with
//! [`Context::run`], and [`ContextualTx`](crate::db::ContextualTx) does it for every call it makes.
//!
//! # Timeout derivation
//!
//! [`derive_timeout`] is the helper behind `Db::with_timeout` and `Tx::with_timeout`:
//!
//! - no parent: start from [`Context::background`]
//! - parent already has a deadline: hand it back unchanged with a no-op [`CancelGuard`]
//! - otherwise: deadline = now + configured default (or [`DEFAULT_TIMEOUT`] when unset)
//!
//! The returned [`CancelGuard`] must be released once the context is no longer needed. Calling
//! [`CancelGuard::cancel`] does it explicitly; dropping the guard does it as well.

use crate::error::{DbError, DbResult};
use std::future::{Future, pending};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Timeout used when no default has been configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cancellation state shared by a context and every context derived from it.
#[derive(Debug)]
struct Signal {
    tx: watch::Sender<bool>,
    children: Mutex<Vec<Weak<Signal>>>,
}

impl Signal {
    fn new(parent: Option<&Arc<Signal>>) -> Arc<Self> {
        let (tx, _) = watch::channel(false);
        let signal = Arc::new(Self {
            tx,
            children: Mutex::new(Vec::new()),
        });
        if let Some(parent) = parent {
            parent.adopt(&signal);
        }
        signal
    }

    fn adopt(&self, child: &Arc<Signal>) {
        {
            let mut children = self.children.lock().unwrap_or_else(PoisonError::into_inner);
            if !self.is_cancelled() {
                children.retain(|weak| weak.strong_count() > 0);
                children.push(Arc::downgrade(child));
                return;
            }
        }
        child.cancel();
    }

    fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn cancel(&self) {
        if self.tx.send_replace(true) {
            return;
        }
        let children = std::mem::take(
            &mut *self.children.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only returns once cancelled.
        if rx.wait_for(|cancelled| *cancelled).await.is_err() {
            pending::<()>().await;
        }
    }
}

/// Deadline and cancellation scope for one or more database calls.
#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    signal: Option<Arc<Signal>>,
}

impl Context {
    /// A context that never expires and cannot be cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that is cancelled by the returned guard or by the parent.
    pub fn with_cancel(parent: &Context) -> (Context, CancelGuard) {
        let signal = Signal::new(parent.signal.as_ref());
        let ctx = Context {
            deadline: parent.deadline,
            signal: Some(Arc::clone(&signal)),
        };
        (ctx, CancelGuard::new(signal))
    }

    /// Derive a context expiring at `deadline`, or at the parent's deadline if that is sooner.
    pub fn with_deadline(parent: &Context, deadline: Instant) -> (Context, CancelGuard) {
        let (mut ctx, guard) = Self::with_cancel(parent);
        ctx.deadline = Some(match parent.deadline {
            Some(inherited) => inherited.min(deadline),
            None => deadline,
        });
        (ctx, guard)
    }

    /// Derive a context expiring `timeout` from now.
    pub fn with_timeout(parent: &Context, timeout: Duration) -> (Context, CancelGuard) {
        Self::with_deadline(parent, Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.as_ref().is_some_and(|signal| signal.is_cancelled())
    }

    /// True once the context is cancelled or past its deadline.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Run `fut` within this context.
    ///
    /// Returns [`DbError::Cancelled`] or [`DbError::DeadlineExceeded`] if the context ends first,
    /// in which case `fut` is dropped before completion.
    pub async fn run<F, T>(&self, fut: F) -> DbResult<T>
    where
        F: Future<Output = DbResult<T>>,
    {
        if self.is_cancelled() {
            return Err(DbError::Cancelled);
        }

        let cancelled = async {
            match &self.signal {
                Some(signal) => signal.cancelled().await,
                None => pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancelled => Err(DbError::Cancelled),
            _ = expired => Err(DbError::DeadlineExceeded),
            result = fut => result,
        }
    }
}

/// Releases a derived [`Context`].
///
/// Cancels on [`cancel`](Self::cancel) or on drop, whichever comes first. Keep it alive for as long
/// as the context is in use.
#[must_use = "dropping the guard cancels the context immediately"]
#[derive(Debug)]
pub struct CancelGuard {
    signal: Option<Arc<Signal>>,
}

impl CancelGuard {
    fn new(signal: Arc<Signal>) -> Self {
        Self {
            signal: Some(signal),
        }
    }

    /// A guard that cancels nothing, returned when the caller's own deadline is reused.
    pub fn noop() -> Self {
        Self { signal: None }
    }

    pub fn is_noop(&self) -> bool {
        self.signal.is_none()
    }

    /// Cancel the context. Safe to call more than once.
    pub fn cancel(&self) {
        if let Some(signal) = &self.signal {
            signal.cancel();
        }
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Derive a context bounded by `default`, unless the parent already has a deadline.
pub fn derive_timeout(parent: Option<&Context>, default: Duration) -> (Context, CancelGuard) {
    let base = parent.cloned().unwrap_or_default();

    if base.deadline().is_some() {
        return (base, CancelGuard::noop());
    }

    let timeout = if default.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        default
    };

    Context::with_timeout(&base, timeout)
}
