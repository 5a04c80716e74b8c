use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use crate::buffer::fence::Fence;
use crate::buffer::object::BufferObject;
use crate::foundation::core::{Affine, ContentType, Rect, TextureFlags};
use crate::foundation::error::ProxyResult;
use crate::gpu::{DrawParams, SampleableImage, TextureMapper};
use crate::proxy::{CompositorHandle, Lifecycle, PaintOutcome, ProxyCore, SwapOutcome};
use crate::runloop::OneShotTimer;

/// A texture rendered in-process, optionally still backed by a producer-side buffer.
pub struct TextureBuffer {
    image: Arc<dyn SampleableImage>,
    flags: TextureFlags,
    fence: Option<Arc<dyn Fence>>,
    backing: Option<BufferObject>,
}

impl TextureBuffer {
    /// Wrap a texture the producer finished (or will finish, see [`TextureBuffer::with_fence`]).
    pub fn new(image: Arc<dyn SampleableImage>) -> Self {
        Self {
            image,
            flags: TextureFlags::empty(),
            fence: None,
            backing: None,
        }
    }

    /// Sampling flags.
    pub fn with_flags(mut self, flags: TextureFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Fence the compositor waits on before sampling.
    pub fn with_fence(mut self, fence: Arc<dyn Fence>) -> Self {
        self.fence = Some(fence);
        self
    }

    /// Producer-side buffer the texture lives in. Released once the compositor lets go of it.
    pub fn with_backing(mut self, backing: BufferObject) -> Self {
        self.backing = Some(backing);
        self
    }

    /// Sampling flags.
    pub fn flags(&self) -> TextureFlags {
        self.flags
    }

    /// Whether the producer-side buffer is still attached.
    pub fn has_backing(&self) -> bool {
        self.backing.is_some()
    }

    /// Drop the producer-side buffer, keep the texture.
    fn preserving_texture(mut self) -> Self {
        if let Some(backing) = self.backing.take() {
            backing.release();
        }
        self
    }

    fn retire(self) {
        if let Some(backing) = self.backing {
            backing.release();
        }
    }
}

impl fmt::Debug for TextureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TextureBuffer")
            .field("size", &self.image.size())
            .field("flags", &self.flags)
            .field("fenced", &self.fence.is_some())
            .field("backing", &self.backing.as_ref().map(|b| b.handle))
            .finish()
    }
}

/// Work queued for the compositor thread. Later requests merge into an unfired one.
#[derive(Default)]
struct PendingUpdate {
    callback: Option<Box<dyn FnOnce() + Send>>,
    drop_texture_backing: bool,
    ack_ticket: Option<u64>,
}

#[derive(Default)]
struct DirectState {
    lifecycle: Lifecycle,
    pending: Option<TextureBuffer>,
    committed: Option<TextureBuffer>,
    update_timer: Option<Box<dyn OneShotTimer>>,
    update: Option<PendingUpdate>,
}

#[derive(Debug, Default)]
struct DropHandshake {
    requested: u64,
    completed: u64,
}

/// Single-slot proxy for textures rendered in the same process as the compositor.
pub struct DirectHandoffProxy {
    core: ProxyCore,
    state: Mutex<DirectState>,
    handshake: Mutex<DropHandshake>,
    handshake_cv: Condvar,
}

impl DirectHandoffProxy {
    /// Create an unactivated proxy.
    pub fn new(content_type: ContentType) -> Self {
        Self {
            core: ProxyCore::new(content_type),
            state: Mutex::new(DirectState::default()),
            handshake: Mutex::new(DropHandshake::default()),
            handshake_cv: Condvar::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, DirectState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the proxy lock. Producer operations live on the returned guard.
    pub fn lock(&self) -> DirectProxyLock<'_> {
        DirectProxyLock {
            proxy: self,
            state: Some(self.state()),
            notify: false,
        }
    }

    /// Producer kind.
    pub fn content_type(&self) -> ContentType {
        self.core.content_type
    }

    /// Whether the proxy is activated and not invalidated.
    pub fn is_active(&self) -> bool {
        self.state().lifecycle.is_active()
    }

    /// See [`crate::BufferProxy::activate_on_compositor`]. Creates the compositor update timer.
    pub fn activate_on_compositor(self: &Arc<Self>, compositor: CompositorHandle) -> ProxyResult<()> {
        let has_pending = {
            let mut st = self.state();
            st.lifecycle.activate()?;
            self.core.thread.bind();

            let weak: Weak<Self> = Arc::downgrade(self);
            st.update_timer = Some(compositor.run_loop.create_timer(Box::new(move || {
                if let Some(proxy) = weak.upgrade() {
                    proxy.compositor_update_timer_fired();
                }
            })));
            self.core.notifier.set(compositor.client);
            st.pending.is_some()
        };
        tracing::debug!(content = ?self.core.content_type, "direct proxy activated");
        if has_pending {
            self.core.notifier.notify();
        }
        Ok(())
    }

    /// See [`crate::BufferProxy::invalidate`]. Also wakes any thread blocked in
    /// [`DirectHandoffProxy::drop_current_buffer_while_preserving_texture`].
    pub fn invalidate(&self) {
        let retired = {
            let mut st = self.state();
            if !st.lifecycle.invalidate() {
                return;
            }
            if let Some(timer) = st.update_timer.take() {
                timer.stop();
            }
            st.update = None;
            [st.pending.take(), st.committed.take()]
        };
        self.core.notifier.clear();
        for buffer in retired.into_iter().flatten() {
            buffer.retire();
        }

        let mut hs = self
            .handshake
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        hs.completed = hs.requested;
        self.handshake_cv.notify_all();
        tracing::debug!(content = ?self.core.content_type, "direct proxy invalidated");
    }

    /// Push under an internally taken lock; the wake-up fires after the lock is released.
    ///
    /// Returns `false` (and releases the buffer's backing) if the proxy was invalidated.
    pub fn push_next_buffer(&self, buffer: TextureBuffer) -> bool {
        self.lock().push_next_buffer(buffer)
    }

    /// See [`crate::BufferProxy::swap_buffer`].
    pub fn swap_buffer(&self) -> SwapOutcome {
        self.core.thread.assert_current("swap_buffer");
        self.core.notifier.consume();
        let previous = {
            let mut st = self.state();
            if !st.lifecycle.is_active() {
                return SwapOutcome::Inactive;
            }
            let Some(next) = st.pending.take() else {
                return SwapOutcome::NoPending;
            };
            st.committed.replace(next)
        };
        if let Some(previous) = previous {
            previous.retire();
        }
        SwapOutcome::Swapped
    }

    /// See [`crate::BufferProxy::paint`].
    pub fn paint(
        &self,
        mapper: &mut dyn TextureMapper,
        target_rect: Rect,
        transform: Affine,
        opacity: f32,
    ) -> ProxyResult<PaintOutcome> {
        self.core.thread.assert_current("paint");
        let (image, fence, flags) = {
            let st = self.state();
            if !st.lifecycle.is_active() {
                return Ok(PaintOutcome::Inactive);
            }
            let Some(buffer) = st.committed.as_ref() else {
                return Ok(PaintOutcome::NothingCommitted);
            };
            (
                Arc::clone(&buffer.image),
                buffer.fence.clone(),
                buffer.flags,
            )
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

    /// Run `callback` on the compositor thread on its next run-loop iteration.
    ///
    /// Calls made before the timer fires coalesce: only the latest callback runs. Returns `false`
    /// before activation and after invalidation.
    pub fn schedule_update_on_compositor(&self, callback: Box<dyn FnOnce() + Send>) -> bool {
        let mut st = self.state();
        let Some(timer) = st.update_timer.as_ref() else {
            return false;
        };
        timer.start_one_shot();
        st.update.get_or_insert_with(PendingUpdate::default).callback = Some(callback);
        true
    }

    /// Release the producer-side buffer behind the committed texture while keeping the texture
    /// itself visible.
    ///
    /// With `should_wait`, blocks until the compositor thread processed the drop (or the proxy was
    /// invalidated). Must not be called with `should_wait` from the compositor thread. Returns
    /// `false` if no compositor is bound, in which case nothing is scheduled and nothing waits.
    pub fn drop_current_buffer_while_preserving_texture(&self, should_wait: bool) -> bool {
        if should_wait {
            self.core
                .thread
                .assert_not_current("drop_current_buffer_while_preserving_texture(true)");
        }

        let ticket = {
            let mut st = self.state();
            let Some(timer) = st.update_timer.as_ref() else {
                return false;
            };
            let ticket = if should_wait {
                let mut hs = self
                    .handshake
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                hs.requested += 1;
                Some(hs.requested)
            } else {
                None
            };
            timer.start_one_shot();
            let update = st.update.get_or_insert_with(PendingUpdate::default);
            update.drop_texture_backing = true;
            if ticket.is_some() {
                update.ack_ticket = ticket.max(update.ack_ticket);
            }
            ticket
        };

        if let Some(ticket) = ticket {
            tracing::trace!(ticket, "waiting for compositor to drop buffer");
            let hs = self
                .handshake
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let _hs = self
                .handshake_cv
                .wait_while(hs, |hs| hs.completed < ticket)
                .unwrap_or_else(PoisonError::into_inner);
        }
        true
    }

    fn compositor_update_timer_fired(&self) {
        let (update, retired_backing) = {
            let mut st = self.state();
            let Some(update) = st.update.take() else {
                return;
            };
            let mut retired = false;
            if update.drop_texture_backing && st.lifecycle.is_valid() {
                if let Some(current) = st.committed.take() {
                    retired = current.has_backing();
                    st.committed = Some(current.preserving_texture());
                }
            }
            (update, retired)
        };
        if retired_backing {
            tracing::debug!("dropped committed buffer, texture preserved");
        }

        if let Some(callback) = update.callback {
            callback();
        }
        if let Some(ticket) = update.ack_ticket {
            let mut hs = self
                .handshake
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            hs.completed = hs.completed.max(ticket);
            self.handshake_cv.notify_all();
        }
    }
}

impl fmt::Debug for DirectHandoffProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state();
        f.debug_struct("DirectHandoffProxy")
            .field("content_type", &self.core.content_type)
            .field("lifecycle", &st.lifecycle)
            .field("pending", &st.pending)
            .field("committed", &st.committed)
            .finish_non_exhaustive()
    }
}

/// Held proxy lock of a [`DirectHandoffProxy`].
///
/// The compositor is notified when the guard drops, after the lock is released.
pub struct DirectProxyLock<'a> {
    proxy: &'a DirectHandoffProxy,
    state: Option<MutexGuard<'a, DirectState>>,
    notify: bool,
}

impl DirectProxyLock<'_> {
    fn st(&mut self) -> &mut DirectState {
        self.state
            .as_deref_mut()
            .unwrap_or_else(|| unreachable!("guard is only taken in Drop"))
    }

    /// Whether the proxy still accepts buffers.
    pub fn is_valid(&mut self) -> bool {
        self.st().lifecycle.is_valid()
    }

    /// Replace the pending buffer. A replaced, never-swapped buffer has its backing released.
    pub fn push_next_buffer(&mut self, buffer: TextureBuffer) -> bool {
        let st = self.st();
        if !st.lifecycle.is_valid() {
            buffer.retire();
            return false;
        }
        if let Some(skipped) = st.pending.replace(buffer) {
            tracing::trace!("pending buffer replaced before swap");
            skipped.retire();
        }
        self.notify = true;
        true
    }

    /// Whether a buffer is pending.
    pub fn has_pending(&mut self) -> bool {
        self.st().pending.is_some()
    }
}

impl Drop for DirectProxyLock<'_> {
    fn drop(&mut self) {
        drop(self.state.take());
        if self.notify {
            self.proxy.core.notifier.notify();
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/proxy/direct.rs"]
mod tests;
