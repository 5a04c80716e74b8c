use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::buffer::fence::Fence;
use crate::buffer::object::BufferObject;
use crate::foundation::core::{Affine, ContentType, Handle, Rect, TextureFlags};
use crate::foundation::error::{ProxyError, ProxyResult};
use crate::gpu::{DrawParams, SampleableImage, TextureMapper};
use crate::proxy::layer::{Layer, LayerCache, MAX_LAYER_AGE};
use crate::proxy::{CompositorHandle, Lifecycle, PaintOutcome, ProxyCore, SwapOutcome};

/// Options for [`CachedHandoffProxy`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CachedProxyOpts {
    /// Swaps a cached layer survives without being pushed again.
    pub max_layer_age: u32,
}

impl Default for CachedProxyOpts {
    fn default() -> Self {
        Self {
            max_layer_age: MAX_LAYER_AGE,
        }
    }
}

impl CachedProxyOpts {
    /// Reject options the proxy cannot run with.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.max_layer_age == 0 {
            return Err(ProxyError::validation("max_layer_age must be > 0"));
        }
        Ok(())
    }
}

/// Result of [`CachedProxyLock::push_buffer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// The handle was new; a layer was created.
    Inserted,
    /// The handle was cached; its layer was refreshed.
    Reused,
    /// The proxy was invalidated; nothing changed.
    Inactive,
}

/// Invoked on the compositor thread at the start of every swap, outside the proxy lock.
pub type SwapBuffersHook = Box<dyn FnMut(&CachedHandoffProxy) + Send>;

#[derive(Debug, Default)]
struct CachedState {
    lifecycle: Lifecycle,
    cache: LayerCache,
    pending: Option<Handle>,
    committed: Option<Handle>,
    /// Last committed layer known to be drawable. Shown again if the committed one fails to import.
    fallback: Option<Handle>,
}

/// Proxy for shared buffers that recur by handle, typically a small producer-side ring.
///
/// Each handle is imported once and reused for as long as the producer keeps pushing it; handles
/// that stop recurring age out after [`CachedProxyOpts::max_layer_age`] swaps.
pub struct CachedHandoffProxy {
    core: ProxyCore,
    opts: CachedProxyOpts,
    state: Mutex<CachedState>,
    swap_hook: Mutex<Option<SwapBuffersHook>>,
}

impl CachedHandoffProxy {
    /// Create an unactivated proxy.
    pub fn new(content_type: ContentType, opts: CachedProxyOpts) -> ProxyResult<Self> {
        opts.validate()?;
        Ok(Self {
            core: ProxyCore::new(content_type),
            opts,
            state: Mutex::new(CachedState::default()),
            swap_hook: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, CachedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the proxy lock. Pushes happen on the returned guard, so a caller can batch lookups
    /// with the push.
    pub fn lock(&self) -> CachedProxyLock<'_> {
        CachedProxyLock {
            proxy: self,
            state: Some(self.state()),
            notify: false,
            superseded: Vec::new(),
        }
    }

    /// Producer kind.
    pub fn content_type(&self) -> ContentType {
        self.core.content_type
    }

    /// Options the proxy runs with.
    pub fn opts(&self) -> CachedProxyOpts {
        self.opts
    }

    /// Whether the proxy is activated and not invalidated.
    pub fn is_active(&self) -> bool {
        self.state().lifecycle.is_active()
    }

    /// Install or clear the swap-buffers hook.
    pub fn set_swap_buffers_hook(&self, hook: Option<SwapBuffersHook>) {
        *self
            .swap_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = hook;
    }

    /// See [`crate::BufferProxy::activate_on_compositor`].
    pub fn activate_on_compositor(&self, compositor: CompositorHandle) -> ProxyResult<()> {
        let has_pending = {
            let mut st = self.state();
            st.lifecycle.activate()?;
            self.core.thread.bind();
            self.core.notifier.set(compositor.client);
            st.pending.is_some()
        };
        tracing::debug!(content = ?self.core.content_type, "cached proxy activated");
        if has_pending {
            self.core.notifier.notify();
        }
        Ok(())
    }

    /// See [`crate::BufferProxy::invalidate`]. Every cached buffer is released to its producer.
    pub fn invalidate(&self) {
        let layers = {
            let mut st = self.state();
            if !st.lifecycle.invalidate() {
                return;
            }
            st.pending = None;
            st.committed = None;
            st.fallback = None;
            st.cache.drain()
        };
        self.core.notifier.clear();
        self.set_swap_buffers_hook(None);

        let n = layers.len();
        for layer in layers {
            layer.release();
        }
        tracing::debug!(content = ?self.core.content_type, released = n, "cached proxy invalidated");
    }

    /// See [`crate::BufferProxy::swap_buffer`]. Runs the swap-buffers hook first, then ages the
    /// cache and releases layers that expired.
    pub fn swap_buffer(&self) -> SwapOutcome {
        self.core.thread.assert_current("swap_buffer");
        self.run_swap_hook();
        self.core.notifier.consume();

        let expired = {
            let mut st = self.state();
            if !st.lifecycle.is_active() {
                return SwapOutcome::Inactive;
            }
            let Some(next) = st.pending.take() else {
                return SwapOutcome::NoPending;
            };
            let outgoing = st.committed.replace(next);
            let imported = |h: Handle| st.cache.get(h).is_some_and(Layer::is_imported);
            let fallback = if imported(next) {
                None
            } else {
                outgoing.filter(|h| imported(*h)).or(st.fallback)
            };
            st.fallback = fallback;
            st.cache.age_all_except(next, fallback, self.opts.max_layer_age)
        };

        for layer in expired {
            tracing::debug!(handle = ?layer.handle(), "evicting stale layer");
            layer.release();
        }
        SwapOutcome::Swapped
    }

    fn run_swap_hook(&self) {
        let mut hook = self
            .swap_hook
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(hook) = hook.as_mut() {
            hook(self);
        }
    }

    /// See [`crate::BufferProxy::paint`].
    ///
    /// The committed layer's image is imported on first paint, outside the proxy lock. If that
    /// import fails the layer is dropped from the cache and released, the previously shown layer
    /// becomes committed again, and the error is returned. An attached fence is handed to the
    /// mapper before sampling.
    pub fn paint(
        &self,
        mapper: &mut dyn TextureMapper,
        target_rect: Rect,
        transform: Affine,
        opacity: f32,
    ) -> ProxyResult<PaintOutcome> {
        self.core.thread.assert_current("paint");
        let to_import = {
            let st = self.state();
            if !st.lifecycle.is_active() {
                return Ok(PaintOutcome::Inactive);
            }
            let Some(layer) = st.committed.and_then(|h| st.cache.get(h)) else {
                return Ok(PaintOutcome::NothingCommitted);
            };
            (!layer.is_imported()).then(|| layer.object().duplicate())
        };
        if let Some(object) = to_import {
            let imported = mapper.import_image(&object);
            self.finish_import(object.handle, imported)?;
        }

        let (image, fence, flags) = {
            let st = self.state();
            if !st.lifecycle.is_active() {
                return Ok(PaintOutcome::Inactive);
            }
            let Some(layer) = st.committed.and_then(|h| st.cache.get(h)) else {
                return Ok(PaintOutcome::NothingCommitted);
            };
            let Some(image) = layer.imported() else {
                return Ok(PaintOutcome::NothingCommitted);
            };
            (image, layer.fence(), layer.flags())
        };

        if let Some(fence) = fence.as_deref() {
            mapper.wait_fence(fence);
        }
        mapper.draw_texture(
            image.as_ref(),
            &DrawParams {
                target_rect,
                transform,
                opacity,
                flags,
            },
        )?;
        Ok(PaintOutcome::Painted)
    }

    fn finish_import(
        &self,
        handle: Handle,
        imported: ProxyResult<Arc<dyn SampleableImage>>,
    ) -> ProxyResult<()> {
        let (failed, restored, err) = {
            let mut st = self.state();
            let err = match imported {
                Ok(image) => {
                    if let Some(layer) = st.cache.get_mut(handle) {
                        layer.set_image(image);
                    }
                    if st.committed == Some(handle) {
                        st.fallback = None;
                    }
                    return Ok(());
                }
                Err(e) => e,
            };
            if !st.lifecycle.is_valid() {
                return Err(err);
            }
            let failed = st.cache.remove(handle);
            if st.pending == Some(handle) {
                st.pending = None;
            }
            if st.committed == Some(handle) {
                let fallback = st.fallback.take();
                let restored = fallback.filter(|h| st.cache.contains(*h));
                st.committed = restored;
            }
            (failed, st.committed, err)
        };

        tracing::warn!(?handle, ?restored, error = %err, "failed to import committed layer");
        if let Some(layer) = failed {
            layer.release();
        }
        Err(err)
    }

    /// Number of cached layers.
    pub fn cached_layer_count(&self) -> usize {
        self.state().cache.len()
    }

    /// Cached handles, sorted.
    pub fn cached_handles(&self) -> Vec<Handle> {
        self.state().cache.handles()
    }

    /// Handle of the committed layer.
    pub fn committed_handle(&self) -> Option<Handle> {
        self.state().committed
    }

    /// Age of the cached layer for `handle`.
    pub fn layer_age(&self, handle: Handle) -> Option<u32> {
        self.state().cache.get(handle).map(Layer::age)
    }
}

impl fmt::Debug for CachedHandoffProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("CachedHandoffProxy")
            .field("content_type", &self.core.content_type)
            .field("opts", &self.opts)
            .field("lifecycle", &st.lifecycle)
            .field("pending", &st.pending)
            .field("committed", &st.committed)
            .field("cached", &st.cache.len())
            .finish_non_exhaustive()
    }
}

/// Held proxy lock of a [`CachedHandoffProxy`].
///
/// The compositor is notified when the guard drops, after the lock is released.
pub struct CachedProxyLock<'a> {
    proxy: &'a CachedHandoffProxy,
    state: Option<MutexGuard<'a, CachedState>>,
    notify: bool,
    superseded: Vec<Layer>,
}

impl CachedProxyLock<'_> {
    fn st(&mut self) -> &mut CachedState {
        self.state
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("guard is only taken in Drop"))
    }

    /// Whether the proxy still accepts buffers.
    pub fn is_valid(&mut self) -> bool {
        self.st().lifecycle.is_valid()
    }

    /// Whether `handle` has a cached layer.
    pub fn is_cached(&mut self, handle: Handle) -> bool {
        self.st().cache.contains(handle)
    }

    /// Make `object` pending, importing it through `import` only if its handle is not cached.
    ///
    /// On a cache hit `object` is dropped and the cached layer gets the new `flags` and `fence`.
    /// A failing `import` leaves both slots and the cache untouched, so the committed layer stays
    /// visible, and releases the rejected buffer.
    pub fn push_buffer<F>(
        &mut self,
        object: BufferObject,
        import: F,
        flags: TextureFlags,
        fence: Option<Arc<dyn Fence>>,
    ) -> ProxyResult<PushOutcome>
    where
        F: FnOnce(BufferObject) -> ProxyResult<BufferObject>,
    {
        let st = self.st();
        if !st.lifecycle.is_valid() {
            object.release();
            return Ok(PushOutcome::Inactive);
        }
        if let Err(e) = object.validate() {
            // A cached handle's descriptor shares the recycling signal of the live layer.
            if !st.cache.contains(object.handle) {
                object.release();
            }
            return Err(e);
        }

        let handle = object.handle;
        let release_flag = object.release_flag.clone();
        let ensured = st.cache.ensure_with(handle, || {
            let imported = import(object)?;
            if imported.handle != handle {
                return Err(ProxyError::import(format!(
                    "import changed handle {handle:?} to {:?}",
                    imported.handle
                )));
            }
            imported
                .validate()
                .map_err(|e| ProxyError::import(e.to_string()))?;
            Ok(Layer::new(imported, flags))
        });
        let (layer, inserted) = match ensured {
            Ok(found) => found,
            Err(e) => {
                tracing::warn!(?handle, error = %e, "buffer import failed");
                // The buffer never reached the cache; hand it straight back.
                release_flag.release();
                return Err(e);
            }
        };
        layer.refresh(flags, fence);

        // A pending layer replaced before any swap was never shown.
        let replaced = st.pending.replace(handle);
        let stale = replaced
            .filter(|h| *h != handle && Some(*h) != st.committed && Some(*h) != st.fallback)
            .and_then(|h| st.cache.remove(h));
        if let Some(stale) = stale {
            tracing::trace!(handle = ?stale.handle(), "pending layer superseded before swap");
            self.superseded.push(stale);
        }
        self.notify = true;

        if inserted {
            tracing::debug!(?handle, "imported new layer");
            Ok(PushOutcome::Inserted)
        } else {
            tracing::trace!(?handle, "reused cached layer");
            Ok(PushOutcome::Reused)
        }
    }
}

impl Drop for CachedProxyLock<'_> {
    fn drop(&mut self) {
        drop(self.state.take());
        for layer in self.superseded.drain(..) {
            layer.release();
        }
        if self.notify {
            self.proxy.core.notifier.notify();
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/proxy/cached.rs"]
mod tests;
