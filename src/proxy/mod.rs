use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use crate::foundation::core::{Affine, ContentType, Rect};
use crate::foundation::error::ProxyResult;
use crate::gpu::TextureMapper;
use crate::runloop::RunLoop;

pub(crate) mod cached;
pub(crate) mod direct;
pub(crate) mod layer;
pub(crate) mod notify;

use cached::{CachedHandoffProxy, CachedProxyOpts};
use direct::DirectHandoffProxy;
use notify::Notifier;

/// Compositor-side receiver of "new content is pending" wake-ups.
///
/// Called from producer threads, outside any proxy lock.
pub trait CompositorClient: Send + Sync {
    /// A proxy has a pending buffer the compositor has not swapped in yet.
    fn on_new_buffer_available(&self);
}

/// What a proxy binds to when activated on the compositor.
#[derive(Clone)]
pub struct CompositorHandle {
    /// Wake-up hook.
    pub client: Arc<dyn CompositorClient>,
    /// Scheduling primitive for compositor-thread callbacks.
    pub run_loop: Arc<dyn RunLoop>,
}

impl CompositorHandle {
    /// Bundle a client and a run loop.
    pub fn new(client: Arc<dyn CompositorClient>, run_loop: Arc<dyn RunLoop>) -> Self {
        Self { client, run_loop }
    }
}

impl fmt::Debug for CompositorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositorHandle").finish_non_exhaustive()
    }
}

/// Frame-request counter a compositor loop can block on.
#[derive(Debug, Default)]
pub struct FrameRequests {
    requested: Mutex<u64>,
    cv: Condvar,
}

impl FrameRequests {
    /// Create a counter with no outstanding requests.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outstanding requests.
    pub fn outstanding(&self) -> u64 {
        *self.requested.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take all outstanding requests, returning how many there were.
    pub fn take(&self) -> u64 {
        std::mem::take(&mut *self.requested.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Block until a request is outstanding or `timeout` elapses, then take them.
    pub fn wait(&self, timeout: Duration) -> u64 {
        let guard = self
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (mut guard, _res) = self
            .cv
            .wait_timeout_while(guard, timeout, |n| *n == 0)
            .unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *guard)
    }
}

impl CompositorClient for FrameRequests {
    fn on_new_buffer_available(&self) {
        let mut n = self
            .requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *n += 1;
        self.cv.notify_all();
    }
}

/// Result of [`BufferProxy::swap_buffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The pending buffer is now committed.
    Swapped,
    /// Nothing was pending; the committed buffer is unchanged.
    NoPending,
    /// The proxy is not activated or was invalidated.
    Inactive,
}

/// Result of [`BufferProxy::paint`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaintOutcome {
    /// The committed buffer was drawn.
    Painted,
    /// No buffer has been committed yet.
    NothingCommitted,
    /// The proxy is not activated or was invalidated.
    Inactive,
}

/// Activation and validity of one proxy. Guarded by the proxy lock.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Lifecycle {
    activated: bool,
    invalidated: bool,
}

impl Lifecycle {
    pub(crate) fn is_valid(self) -> bool {
        !self.invalidated
    }

    pub(crate) fn is_active(self) -> bool {
        self.activated && !self.invalidated
    }

    pub(crate) fn activate(&mut self) -> ProxyResult<()> {
        if self.invalidated {
            return Err(crate::ProxyError::NotActive);
        }
        if self.activated {
            return Err(crate::ProxyError::validation(
                "proxy is already activated on a compositor",
            ));
        }
        self.activated = true;
        Ok(())
    }

    /// Returns `true` the first time only.
    pub(crate) fn invalidate(&mut self) -> bool {
        !std::mem::replace(&mut self.invalidated, true)
    }
}

/// Debug-only record of which thread compositor-side calls must come from.
#[derive(Debug, Default)]
pub(crate) struct CompositorThread {
    #[cfg(debug_assertions)]
    id: Mutex<Option<std::thread::ThreadId>>,
}

impl CompositorThread {
    pub(crate) fn bind(&self) {
        #[cfg(debug_assertions)]
        {
            *self.id.lock().unwrap_or_else(PoisonError::into_inner) =
                Some(std::thread::current().id());
        }
    }

    pub(crate) fn assert_current(&self, op: &str) {
        #[cfg(debug_assertions)]
        {
            let bound = *self.id.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(id) = bound {
                assert_eq!(
                    id,
                    std::thread::current().id(),
                    "{op} must be called on the compositor thread"
                );
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = op;
    }

    pub(crate) fn assert_not_current(&self, op: &str) {
        #[cfg(debug_assertions)]
        {
            let bound = *self.id.lock().unwrap_or_else(PoisonError::into_inner);
            assert_ne!(
                bound,
                Some(std::thread::current().id()),
                "{op} would deadlock on the compositor thread"
            );
        }
        #[cfg(not(debug_assertions))]
        let _ = op;
    }
}

/// State shared by both strategies outside the proxy lock.
#[derive(Debug)]
pub(crate) struct ProxyCore {
    pub(crate) content_type: ContentType,
    pub(crate) notifier: Notifier,
    pub(crate) thread: CompositorThread,
}

impl ProxyCore {
    pub(crate) fn new(content_type: ContentType) -> Self {
        Self {
            content_type,
            notifier: Notifier::default(),
            thread: CompositorThread::default(),
        }
    }
}

/// Hand-off point between one producer and the compositor.
///
/// The strategy is fixed at construction. Producers keep the typed `Arc` they built the proxy
/// from; the compositor only needs this enum.
#[derive(Clone, Debug)]
pub enum BufferProxy {
    /// In-process texture hand-off.
    Direct(Arc<DirectHandoffProxy>),
    /// Handle-keyed cache of shared buffers.
    Cached(Arc<CachedHandoffProxy>),
}

impl BufferProxy {
    /// Create a direct proxy, returning the typed producer end alongside the enum.
    pub fn direct(content_type: ContentType) -> (Self, Arc<DirectHandoffProxy>) {
        let p = Arc::new(DirectHandoffProxy::new(content_type));
        (Self::Direct(Arc::clone(&p)), p)
    }

    /// Create a cached proxy, returning the typed producer end alongside the enum.
    pub fn cached(
        content_type: ContentType,
        opts: CachedProxyOpts,
    ) -> ProxyResult<(Self, Arc<CachedHandoffProxy>)> {
        let p = Arc::new(CachedHandoffProxy::new(content_type, opts)?);
        Ok((Self::Cached(Arc::clone(&p)), p))
    }

    /// Producer kind.
    pub fn content_type(&self) -> ContentType {
        match self {
            Self::Direct(p) => p.content_type(),
            Self::Cached(p) => p.content_type(),
        }
    }

    /// Bind to the compositor. Call once, on the compositor thread, before any swap.
    pub fn activate_on_compositor(&self, compositor: CompositorHandle) -> ProxyResult<()> {
        match self {
            Self::Direct(p) => p.activate_on_compositor(compositor),
            Self::Cached(p) => p.activate_on_compositor(compositor),
        }
    }

    /// Tear the proxy down. Any thread, any time; later calls are no-ops.
    pub fn invalidate(&self) {
        match self {
            Self::Direct(p) => p.invalidate(),
            Self::Cached(p) => p.invalidate(),
        }
    }

    /// Whether the proxy is activated and not invalidated.
    pub fn is_active(&self) -> bool {
        match self {
            Self::Direct(p) => p.is_active(),
            Self::Cached(p) => p.is_active(),
        }
    }

    /// Promote the pending buffer to committed. Compositor thread only; never blocks on the
    /// producer.
    pub fn swap_buffer(&self) -> SwapOutcome {
        match self {
            Self::Direct(p) => p.swap_buffer(),
            Self::Cached(p) => p.swap_buffer(),
        }
    }

    /// Draw the committed buffer. Compositor thread only.
    pub fn paint(
        &self,
        mapper: &mut dyn TextureMapper,
        target_rect: Rect,
        transform: Affine,
        opacity: f32,
    ) -> ProxyResult<PaintOutcome> {
        match self {
            Self::Direct(p) => p.paint(mapper, target_rect, transform, opacity),
            Self::Cached(p) => p.paint(mapper, target_rect, transform, opacity),
        }
    }
}

impl From<Arc<DirectHandoffProxy>> for BufferProxy {
    fn from(p: Arc<DirectHandoffProxy>) -> Self {
        Self::Direct(p)
    }
}

impl From<Arc<CachedHandoffProxy>> for BufferProxy {
    fn from(p: Arc<CachedHandoffProxy>) -> Self {
        Self::Cached(p)
    }
}

#[cfg(test)]
#[path = "../../tests/unit/proxy/mod.rs"]
mod tests;
