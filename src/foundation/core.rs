pub use kurbo::{Affine, Point, Rect, Size};

/// Process-local identifier of one physical shared buffer.
///
/// Handles are unique while the producer keeps the buffer alive and may be reused after the
/// producer recycles it. `Handle(0)` is reserved as "no buffer".
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Handle(pub u64);

impl Handle {
    /// The reserved empty handle.
    pub const NONE: Self = Self(0);

    /// Return `true` for the reserved empty handle.
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// DRM fourcc pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FourCc(pub u32);

impl FourCc {
    /// `AR24`: 32bpp, alpha in the high byte.
    pub const ARGB8888: Self = Self::from_chars(*b"AR24");
    /// `XR24`: 32bpp, padding in the high byte.
    pub const XRGB8888: Self = Self::from_chars(*b"XR24");
    /// `AB24`: 32bpp RGBA byte order in memory.
    pub const ABGR8888: Self = Self::from_chars(*b"AB24");
    /// `NV12`: two-plane 4:2:0 YUV.
    pub const NV12: Self = Self::from_chars(*b"NV12");

    /// Build a code from its four ASCII characters.
    pub const fn from_chars(c: [u8; 4]) -> Self {
        Self(u32::from_le_bytes(c))
    }

    /// Number of memory planes this format uses.
    pub fn plane_count(self) -> usize {
        if self == Self::NV12 { 2 } else { 1 }
    }

    /// Whether the format carries a meaningful alpha channel.
    pub fn has_alpha(self) -> bool {
        self == Self::ARGB8888 || self == Self::ABGR8888
    }
}

impl std::fmt::Debug for FourCc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_le_bytes();
        if b.iter().all(|c| c.is_ascii_graphic()) {
            write!(
                f,
                "FourCc({}{}{}{})",
                b[0] as char, b[1] as char, b[2] as char, b[3] as char
            )
        } else {
            write!(f, "FourCc({:#010x})", self.0)
        }
    }
}

/// DRM format modifier describing the memory layout (tiling, compression).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Modifier(pub u64);

impl Modifier {
    /// Plain row-major layout.
    pub const LINEAR: Self = Self(0);
    /// Layout is implied by the allocator and must not be passed explicitly.
    pub const INVALID: Self = Self(0x00ff_ffff_ffff_ffff);
}

bitflags::bitflags! {
    /// Sampling parameters applied when a buffer is drawn.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TextureFlags: u8 {
        /// Content is stored bottom-up and must be flipped vertically when sampled.
        const FLIP_Y = 1 << 0;
        /// Content has meaningful alpha and must be blended over the target.
        const BLEND = 1 << 1;
    }
}

/// What kind of producer feeds a proxy. Diagnostics only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// WebGL / GPU context output.
    #[default]
    WebGl,
    /// Accelerated 2D canvas.
    Canvas,
    /// Video frames.
    Video,
}

#[cfg(test)]
#[path = "../../tests/unit/foundation/core.rs"]
mod tests;
