use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::buffer::object::BufferObject;
use crate::foundation::core::{ContentType, TextureFlags};
use crate::foundation::error::{ProxyError, ProxyResult};
use crate::proxy::BufferProxy;
use crate::proxy::cached::{CachedHandoffProxy, CachedProxyOpts};

pub(crate) mod channel;

/// Request sent to the process that renders a remote graphics context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DisplayRequest {
    /// Finish the current frame and hand back the buffer holding it.
    PrepareForDisplay,
}

/// Successful reply to [`DisplayRequest::PrepareForDisplay`].
///
/// An empty object means the producer had nothing to show.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DisplayReply {
    /// Buffer holding the prepared frame.
    pub object: BufferObject,
}

/// Synchronous request/reply channel to a remote producer.
///
/// Implementations report failure with an error and never retry on their own.
pub trait DisplayTransport: Send {
    /// Send `request` and block for the reply.
    fn send_sync(&mut self, request: DisplayRequest) -> ProxyResult<DisplayReply>;
}

/// How remote frames are sampled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PresenterOpts {
    /// The context has no alpha channel; frames are drawn without blending.
    pub opaque: bool,
    /// Frames are stored bottom-up.
    pub flip_y: bool,
}

impl Default for PresenterOpts {
    fn default() -> Self {
        Self {
            opaque: false,
            flip_y: true,
        }
    }
}

impl PresenterOpts {
    /// Sampling flags pushed with every frame.
    pub fn texture_flags(&self) -> TextureFlags {
        let mut flags = TextureFlags::empty();
        if self.flip_y {
            flags |= TextureFlags::FLIP_Y;
        }
        if !self.opaque {
            flags |= TextureFlags::BLEND;
        }
        flags
    }
}

/// Compositor-facing end of a remote context.
///
/// Holds the latest presented frame and pushes it into its proxy when the compositor swaps, so a
/// frame presented twice before a swap only reaches the compositor once.
pub struct DisplayDelegate {
    proxy: Arc<CachedHandoffProxy>,
    latest: Arc<Mutex<Option<BufferObject>>>,
}

impl DisplayDelegate {
    /// Create the delegate and its cached proxy.
    pub fn new(opts: PresenterOpts, cache: CachedProxyOpts) -> ProxyResult<Self> {
        let proxy = Arc::new(CachedHandoffProxy::new(ContentType::WebGl, cache)?);
        let latest: Arc<Mutex<Option<BufferObject>>> = Arc::new(Mutex::new(None));

        let flags = opts.texture_flags();
        let slot = Arc::clone(&latest);
        proxy.set_swap_buffers_hook(Some(Box::new(move |proxy: &CachedHandoffProxy| {
            let next = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            let Some(object) = next else {
                return;
            };
            let handle = object.handle;
            if let Err(e) = proxy.lock().push_buffer(object, Ok, flags, None) {
                tracing::warn!(?handle, error = %e, "dropping remote frame");
            }
        })));

        Ok(Self { proxy, latest })
    }

    /// Record `object` as the frame to show at the next swap, replacing an unswapped one.
    pub fn present(&self, object: BufferObject) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let next = (!object.is_empty()).then_some(object);
        if let Some(skipped) = std::mem::replace(&mut *latest, next) {
            tracing::trace!(handle = ?skipped.handle, "remote frame replaced before swap");
        }
    }

    /// Whether a presented frame is waiting for the next swap.
    pub fn has_pending_frame(&self) -> bool {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The proxy the compositor draws from.
    pub fn proxy(&self) -> &Arc<CachedHandoffProxy> {
        &self.proxy
    }

    /// The proxy as the compositor-side variant.
    pub fn platform_layer(&self) -> BufferProxy {
        BufferProxy::Cached(Arc::clone(&self.proxy))
    }
}

impl Drop for DisplayDelegate {
    fn drop(&mut self) {
        self.proxy.set_swap_buffers_hook(None);
    }
}

impl fmt::Debug for DisplayDelegate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayDelegate")
            .field("proxy", &self.proxy)
            .field("pending_frame", &self.has_pending_frame())
            .finish()
    }
}

/// Client side of a graphics context rendered in another process.
///
/// Each [`RemoteFramePresenter::prepare_for_display`] asks the remote side for its latest frame
/// and presents it through a [`DisplayDelegate`]. The first failed request loses the context for
/// good.
pub struct RemoteFramePresenter<T> {
    transport: T,
    delegate: DisplayDelegate,
    context_lost: bool,
}

impl<T: DisplayTransport> RemoteFramePresenter<T> {
    /// Create a presenter talking over `transport`.
    pub fn new(transport: T, opts: PresenterOpts, cache: CachedProxyOpts) -> ProxyResult<Self> {
        Ok(Self {
            transport,
            delegate: DisplayDelegate::new(opts, cache)?,
            context_lost: false,
        })
    }

    /// Request the next frame and present it.
    ///
    /// Fails with [`ProxyError::ContextLost`] once any request has failed; no further requests
    /// are sent after that.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn prepare_for_display(&mut self) -> ProxyResult<()> {
        if self.context_lost {
            return Err(ProxyError::ContextLost);
        }
        match self.transport.send_sync(DisplayRequest::PrepareForDisplay) {
            Ok(reply) => {
                self.delegate.present(reply.object);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "prepare-for-display failed, marking context lost");
                self.context_lost = true;
                Err(ProxyError::ContextLost)
            }
        }
    }

    /// Whether a request has failed.
    pub fn is_context_lost(&self) -> bool {
        self.context_lost
    }

    /// The delegate the compositor draws through.
    pub fn delegate(&self) -> &DisplayDelegate {
        &self.delegate
    }
}

impl<T> fmt::Debug for RemoteFramePresenter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFramePresenter")
            .field("delegate", &self.delegate)
            .field("context_lost", &self.context_lost)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/remote/mod.rs"]
mod tests;
