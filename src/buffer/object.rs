use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::foundation::core::{FourCc, Handle, Modifier};
use crate::foundation::error::{ProxyError, ProxyResult};

/// Memory description of one plane of a shared buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlaneDesc {
    /// Shareable memory descriptor (dma-buf fd or equivalent).
    pub fd: i32,
    /// Bytes per row.
    pub stride: u32,
    /// Byte offset of the first row inside the memory object.
    pub offset: u32,
}

#[derive(Debug, Default)]
struct ReleaseState {
    released: AtomicBool,
    transitions: AtomicU32,
}

/// Recycling signal shared between the producer and the consumer of a buffer.
///
/// The consumer calls [`ReleaseFlag::release`] once it no longer references the buffer; the
/// producer observes [`ReleaseFlag::is_released`] and calls [`ReleaseFlag::rearm`] when it hands
/// the same physical buffer out again (a new generation).
#[derive(Clone, Debug, Default)]
pub struct ReleaseFlag {
    state: Arc<ReleaseState>,
}

impl ReleaseFlag {
    /// Create an armed (not yet released) flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the producer that the buffer may be reused.
    ///
    /// Returns `true` only for the call that actually flipped the flag in this generation.
    pub fn release(&self) -> bool {
        let first = !self.state.released.swap(true, Ordering::AcqRel);
        if first {
            self.state.transitions.fetch_add(1, Ordering::AcqRel);
        }
        first
    }

    /// Whether the consumer released the current generation.
    pub fn is_released(&self) -> bool {
        self.state.released.load(Ordering::Acquire)
    }

    /// Start a new generation. Producer side.
    pub fn rearm(&self) {
        self.state.released.store(false, Ordering::Release);
    }

    /// Number of generations released so far.
    pub fn release_count(&self) -> u32 {
        self.state.transitions.load(Ordering::Acquire)
    }
}

/// One shared GPU buffer as handed from a producer to the compositor.
///
/// Not `Clone`: a buffer object is moved along the hand-off path and owned by exactly one layer at
/// a time. The recycling signal does not travel over the wire; the receiving side attaches its own.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct BufferObject {
    /// Cache key identifying the physical buffer.
    pub handle: Handle,
    /// Pixel format.
    pub format: FourCc,
    /// Memory layout modifier.
    pub modifier: Modifier,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Per-plane memory descriptors.
    pub planes: SmallVec<[PlaneDesc; 4]>,
    /// Consumer-to-producer "safe to reuse" signal.
    #[serde(skip)]
    pub release_flag: ReleaseFlag,
}

impl BufferObject {
    /// Describe a buffer without planes; add them with [`BufferObject::with_plane`].
    pub fn new(handle: Handle, format: FourCc, width: u32, height: u32) -> Self {
        Self {
            handle,
            format,
            modifier: Modifier::LINEAR,
            width,
            height,
            planes: SmallVec::new(),
            release_flag: ReleaseFlag::new(),
        }
    }

    /// The "no buffer" placeholder.
    pub fn empty() -> Self {
        Self::new(Handle::NONE, FourCc::ARGB8888, 0, 0)
    }

    /// Return `true` for the placeholder produced by [`BufferObject::empty`].
    pub fn is_empty(&self) -> bool {
        self.handle.is_none()
    }

    /// Append a plane descriptor.
    pub fn with_plane(mut self, fd: i32, stride: u32, offset: u32) -> Self {
        self.planes.push(PlaneDesc { fd, stride, offset });
        self
    }

    /// Override the memory layout modifier.
    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        self.modifier = modifier;
        self
    }

    /// Replace the recycling signal, e.g. with one shared with a producer.
    pub fn with_release_flag(mut self, flag: ReleaseFlag) -> Self {
        self.release_flag = flag;
        self
    }

    /// Describe the same physical buffer again for another hand-off.
    ///
    /// The copy shares this object's recycling signal.
    pub fn duplicate(&self) -> Self {
        Self {
            handle: self.handle,
            format: self.format,
            modifier: self.modifier,
            width: self.width,
            height: self.height,
            planes: self.planes.clone(),
            release_flag: self.release_flag.clone(),
        }
    }

    /// Check the descriptor is importable in principle.
    pub fn validate(&self) -> ProxyResult<()> {
        if self.handle.is_none() {
            return Err(ProxyError::validation("buffer object has no handle"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ProxyError::validation(format!(
                "buffer {:?} has empty size {}x{}",
                self.handle, self.width, self.height
            )));
        }
        let want = self.format.plane_count();
        if self.planes.len() != want {
            return Err(ProxyError::validation(format!(
                "buffer {:?} format {:?} expects {want} plane(s), got {}",
                self.handle,
                self.format,
                self.planes.len()
            )));
        }
        if let Some(p) = self.planes.iter().find(|p| p.fd < 0) {
            return Err(ProxyError::validation(format!(
                "buffer {:?} has invalid plane fd {}",
                self.handle, p.fd
            )));
        }
        let min_stride = if self.format == FourCc::NV12 {
            self.width
        } else {
            self.width.saturating_mul(4)
        };
        if self.planes[0].stride < min_stride {
            return Err(ProxyError::validation(format!(
                "buffer {:?} stride {} is smaller than row size {min_stride}",
                self.handle, self.planes[0].stride
            )));
        }
        Ok(())
    }

    /// Signal the producer that this buffer may be reused.
    pub fn release(&self) -> bool {
        self.release_flag.release()
    }
}

#[cfg(test)]
#[path = "../../tests/unit/buffer/object.rs"]
mod tests;
