use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::storage::StorageError;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    next_hook: AtomicU64,
    hooks: Mutex<Vec<(u64, Hook)>>,
}

impl fmt::Debug for CancelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelState")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .field("hooks", &self.hooks.lock().len())
            .finish()
    }
}

/// Cancellation, deadline and diagnostic label for one call into the store.
///
/// Clones share the cancellation state: cancelling any clone cancels them all
/// and runs every hook registered through `on_cancel`.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Arc<CancelState>,
    deadline: Option<Instant>,
    label: Option<Arc<str>>,
}

/// Registration returned by `Context::on_cancel`; dropping it removes the
/// hook if it has not run yet.
#[must_use]
pub struct CancelHook {
    state: Arc<CancelState>,
    id: u64,
}

impl Drop for CancelHook {
    fn drop(&mut self) {
        self.state.hooks.lock().retain(|(id, _)| *id != self.id);
    }
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    /// Shortens the deadline to `timeout` from now. An earlier existing
    /// deadline is kept.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    pub fn with_label(mut self, label: impl Into<Arc<str>>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn cancel(&self) {
        if self.cancel.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.cancel.hooks.lock());
        for (_, hook) in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.cancelled.load(Ordering::SeqCst)
    }

    /// Runs `hook` once when the context is cancelled, immediately if it
    /// already is. Used by backends to interrupt work in flight on the
    /// server.
    pub fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) -> CancelHook {
        let id = self.cancel.next_hook.fetch_add(1, Ordering::SeqCst);
        let registration = CancelHook {
            state: self.cancel.clone(),
            id,
        };
        {
            let mut hooks = self.cancel.hooks.lock();
            // `cancel` sets the flag before draining, so a hook pushed while
            // the flag is clear is always drained.
            if !self.is_cancelled() {
                hooks.push((id, Box::new(hook)));
                return registration;
            }
        }
        hook();
        registration
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn check(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(StorageError::DeadlineExceeded),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_expires() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
        assert!(ctx.label().is_none());
    }

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let ctx = Context::background().with_label("tx 1");
        let clone = ctx.clone();
        clone.cancel();
        assert!(matches!(ctx.check(), Err(StorageError::Cancelled)));
        assert_eq!(ctx.label(), Some("tx 1"));
    }

    #[test]
    fn test_cancel_runs_hooks_once() {
        let ctx = Context::background();
        let fired = Arc::new(AtomicU64::new(0));

        let counter = fired.clone();
        let _hook = ctx.clone().on_cancel(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.cancel();
        ctx.cancel();

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hook_registered_after_cancel_runs_immediately() {
        let ctx = Context::background();
        ctx.cancel();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let _hook = ctx.on_cancel(move || flag.store(true, Ordering::SeqCst));

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropped_hook_does_not_run() {
        let ctx = Context::background();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        drop(ctx.on_cancel(move || flag.store(true, Ordering::SeqCst)));
        ctx.cancel();

        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = Context::background().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(matches!(ctx.check(), Err(StorageError::DeadlineExceeded)));
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_timeout_keeps_earlier_deadline() {
        let early = Instant::now() + Duration::from_secs(1);
        let ctx = Context::background()
            .with_deadline(early)
            .with_timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(early));
    }
}
