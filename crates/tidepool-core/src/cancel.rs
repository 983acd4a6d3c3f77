//! Cancellation handles for standing registrations
//!
//! TigerStyle: Cancel is idempotent; hooks run at most once.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

type Hook = Box<dyn FnOnce() + Send + 'static>;

struct CancelInner {
    cancelled: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

/// Handle that stops a subscription, consumer, or pipe
///
/// Clones share state. Once cancelled, every registration guarded by the
/// handle stops delivering; queued deliveries check the flag at invoke time.
#[derive(Clone)]
pub struct Cancel {
    inner: Arc<CancelInner>,
}

impl Cancel {
    /// Create an uncancelled handle
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel; returns true only for the call that performed the cancel
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }
        let hooks = std::mem::take(&mut *self.inner.hooks.lock());
        for hook in hooks {
            hook();
        }
        true
    }

    /// Check whether the handle was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Check whether both handles share one state
    pub fn same(&self, other: &Cancel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run `hook` on cancel, or now if already cancelled
    pub fn on_cancel<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = self.inner.hooks.lock();
            if !self.is_cancelled() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Cancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancel")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
