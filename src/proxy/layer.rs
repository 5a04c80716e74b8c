use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::buffer::fence::Fence;
use crate::buffer::object::BufferObject;
use crate::foundation::core::{Handle, TextureFlags};
use crate::foundation::error::ProxyResult;
use crate::gpu::SampleableImage;

/// Default number of swaps a cached layer survives without being pushed again.
pub const MAX_LAYER_AGE: u32 = 16;

/// A shared buffer together with its imported, sampleable form.
pub struct Layer {
    object: BufferObject,
    image: Option<Arc<dyn SampleableImage>>,
    fence: Option<Arc<dyn Fence>>,
    flags: TextureFlags,
    age: u32,
}

impl Layer {
    pub(crate) fn new(object: BufferObject, flags: TextureFlags) -> Self {
        Self {
            object,
            image: None,
            fence: None,
            flags,
            age: 0,
        }
    }

    /// Cache key.
    pub fn handle(&self) -> Handle {
        self.object.handle
    }

    /// Wrapped buffer.
    pub fn object(&self) -> &BufferObject {
        &self.object
    }

    /// Sampling flags of the latest push.
    pub fn flags(&self) -> TextureFlags {
        self.flags
    }

    /// Swaps since the layer was last pushed.
    pub fn age(&self) -> u32 {
        self.age
    }

    /// Whether the sampleable image was built.
    pub fn is_imported(&self) -> bool {
        self.image.is_some()
    }

    /// Whether a fence is attached.
    pub fn has_fence(&self) -> bool {
        self.fence.is_some()
    }

    /// A push refreshed this layer: new fence and flags, age back to zero.
    pub(crate) fn refresh(&mut self, flags: TextureFlags, fence: Option<Arc<dyn Fence>>) {
        self.flags = flags;
        self.fence = fence;
        self.age = 0;
    }

    pub(crate) fn fence(&self) -> Option<Arc<dyn Fence>> {
        self.fence.clone()
    }

    /// The sampleable image, once a paint imported it.
    pub(crate) fn imported(&self) -> Option<Arc<dyn SampleableImage>> {
        self.image.clone()
    }

    pub(crate) fn set_image(&mut self, image: Arc<dyn SampleableImage>) {
        self.image = Some(image);
    }

    /// Tell the producer the buffer may be reused. Only the first call has an effect.
    pub(crate) fn release(&self) -> bool {
        self.object.release()
    }
}

impl fmt::Debug for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Layer")
            .field("handle", &self.object.handle)
            .field("flags", &self.flags)
            .field("age", &self.age)
            .field("imported", &self.image.is_some())
            .field("fenced", &self.fence.is_some())
            .finish()
    }
}

/// Sole owner of cached layers, keyed by buffer handle.
///
/// Proxy slots refer to entries by handle only.
#[derive(Debug, Default)]
pub(crate) struct LayerCache {
    layers: HashMap<Handle, Layer>,
}

impl LayerCache {
    pub(crate) fn len(&self) -> usize {
        self.layers.len()
    }

    pub(crate) fn contains(&self, handle: Handle) -> bool {
        self.layers.contains_key(&handle)
    }

    pub(crate) fn get(&self, handle: Handle) -> Option<&Layer> {
        self.layers.get(&handle)
    }

    pub(crate) fn get_mut(&mut self, handle: Handle) -> Option<&mut Layer> {
        self.layers.get_mut(&handle)
    }

    pub(crate) fn handles(&self) -> Vec<Handle> {
        let mut out: Vec<Handle> = self.layers.keys().copied().collect();
        out.sort();
        out
    }

    /// Look `handle` up, creating the layer with `create` on a miss.
    ///
    /// Returns the layer and whether it was created. A failed `create` leaves the cache unchanged.
    pub(crate) fn ensure_with(
        &mut self,
        handle: Handle,
        create: impl FnOnce() -> ProxyResult<Layer>,
    ) -> ProxyResult<(&mut Layer, bool)> {
        use std::collections::hash_map::Entry;
        match self.layers.entry(handle) {
            Entry::Occupied(e) => Ok((e.into_mut(), false)),
            Entry::Vacant(e) => {
                let layer = create()?;
                Ok((e.insert(layer), true))
            }
        }
    }

    pub(crate) fn remove(&mut self, handle: Handle) -> Option<Layer> {
        self.layers.remove(&handle)
    }

    /// Age every layer except `keep`, removing those older than `max_age`.
    ///
    /// A `pinned` layer ages but is never removed.
    pub(crate) fn age_all_except(
        &mut self,
        keep: Handle,
        pinned: Option<Handle>,
        max_age: u32,
    ) -> Vec<Layer> {
        let mut expired = Vec::new();
        for (handle, layer) in &mut self.layers {
            if *handle == keep {
                continue;
            }
            layer.age = layer.age.saturating_add(1);
            if layer.age > max_age && pinned != Some(*handle) {
                expired.push(*handle);
            }
        }
        expired.sort();
        expired
            .into_iter()
            .filter_map(|h| self.layers.remove(&h))
            .collect()
    }

    /// Remove every layer.
    pub(crate) fn drain(&mut self) -> Vec<Layer> {
        self.layers.drain().map(|(_, layer)| layer).collect()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/proxy/layer.rs"]
mod tests;
