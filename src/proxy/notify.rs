use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::proxy::CompositorClient;

/// Coalescing wrapper around the compositor's "new buffer available" hook.
///
/// The hook fires at most once between two [`Notifier::consume`] calls. It is never invoked while
/// the notifier's own mutex is held, and callers invoke [`Notifier::notify`] only after dropping
/// the proxy lock.
#[derive(Default)]
pub(crate) struct Notifier {
    hook: Mutex<Option<Arc<dyn CompositorClient>>>,
    armed: AtomicBool,
}

impl Notifier {
    pub(crate) fn set(&self, client: Arc<dyn CompositorClient>) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = Some(client);
        self.armed.store(false, Ordering::Release);
    }

    pub(crate) fn clear(&self) {
        *self.hook.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Fire the hook unless a notification is already outstanding. Returns whether it fired.
    pub(crate) fn notify(&self) -> bool {
        let hook = {
            let hook = self.hook.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(client) = hook.as_ref() else {
                return false;
            };
            if self.armed.swap(true, Ordering::AcqRel) {
                return false;
            }
            Arc::clone(client)
        };
        hook.on_new_buffer_available();
        true
    }

    /// The compositor picked up pending content; the next push notifies again.
    pub(crate) fn consume(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bound = self
            .hook
            .lock()
            .map(|h| h.is_some())
            .unwrap_or_else(|e| e.into_inner().is_some());
        f.debug_struct("Notifier")
            .field("bound", &bound)
            .field("armed", &self.armed.load(Ordering::Acquire))
            .finish()
    }
}
