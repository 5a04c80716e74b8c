use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::buffer::fence::Fence;
use crate::buffer::object::BufferObject;
use crate::foundation::core::{Affine, Rect, TextureFlags};
use crate::foundation::error::ProxyResult;

pub(crate) mod soft;

/// A buffer imported into the compositor's GPU context, ready to be sampled.
pub trait SampleableImage: Send + Sync + fmt::Debug {
    /// Size in pixels.
    fn size(&self) -> (u32, u32);

    /// Downcast hook for the context that created the image.
    fn as_any(&self) -> &dyn Any;
}

/// Per-draw sampling parameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DrawParams {
    /// Destination rectangle in layer space.
    pub target_rect: Rect,
    /// Layer-to-target transform.
    pub transform: Affine,
    /// Opacity in `[0, 1]`.
    pub opacity: f32,
    /// Flip and blend parameters.
    pub flags: TextureFlags,
}

/// The compositor-side GPU context a proxy paints with.
///
/// Only the compositor thread drives a `TextureMapper`.
pub trait TextureMapper {
    /// Build a sampleable image from a shared buffer. Expensive; proxies call it at most once per
    /// cached layer.
    fn import_image(&mut self, object: &BufferObject) -> ProxyResult<Arc<dyn SampleableImage>>;

    /// Order subsequent sampling after `fence`.
    fn wait_fence(&mut self, fence: &dyn Fence) {
        fence.server_wait();
    }

    /// Draw `image` into the current target.
    fn draw_texture(&mut self, image: &dyn SampleableImage, params: &DrawParams)
    -> ProxyResult<()>;
}
