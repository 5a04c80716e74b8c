#![forbid(unsafe_code)]
//! Hand-off of GPU buffers from a producing thread or process to a single compositor thread.
//!
//! A [`BufferProxy`] sits between one producer and the compositor. Producers push buffers under
//! the proxy lock; the compositor swaps the most recent one in and paints it through a
//! [`TextureMapper`]. Two strategies exist:
//!
//! - [`DirectHandoffProxy`] for textures rendered in-process, with a blocking teardown handshake.
//! - [`CachedHandoffProxy`] for shared buffers that recur by handle, imported once and evicted
//!   once they stop recurring.
//!
//! [`RemoteFramePresenter`] feeds a cached proxy from a producer in another process.

mod buffer;
mod config;
mod foundation;
mod gpu;
mod proxy;
mod remote;
mod runloop;

pub use buffer::fence::Fence;
pub use buffer::object::{BufferObject, PlaneDesc, ReleaseFlag};
pub use config::HandoffConfig;
pub use foundation::core::{
    Affine, ContentType, FourCc, Handle, Modifier, Point, Rect, Size, TextureFlags,
};
pub use foundation::error::{ProxyError, ProxyResult};
pub use gpu::soft::{MapperEvent, SoftDevice, SoftFence, SoftImage, SoftTextureMapper};
pub use gpu::{DrawParams, SampleableImage, TextureMapper};
pub use proxy::cached::{
    CachedHandoffProxy, CachedProxyLock, CachedProxyOpts, PushOutcome, SwapBuffersHook,
};
pub use proxy::direct::{DirectHandoffProxy, DirectProxyLock, TextureBuffer};
pub use proxy::layer::{Layer, MAX_LAYER_AGE};
pub use proxy::{
    BufferProxy, CompositorClient, CompositorHandle, FrameRequests, PaintOutcome, SwapOutcome,
};
pub use remote::channel::{
    ChannelEndpoint, ChannelTransport, RingOpts, RingProducer, RingStats, channel_pair,
};
pub use remote::{
    DisplayDelegate, DisplayReply, DisplayRequest, DisplayTransport, PresenterOpts,
    RemoteFramePresenter,
};
pub use runloop::{ManualRunLoop, OneShotTimer, RunLoop};
