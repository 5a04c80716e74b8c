use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use crate::buffer::fence::Fence;
use crate::buffer::object::BufferObject;
use crate::foundation::core::{FourCc, Handle, Point, TextureFlags};
use crate::foundation::error::{ProxyError, ProxyResult};
use crate::gpu::{DrawParams, SampleableImage, TextureMapper};

type Memory = Arc<RwLock<Vec<u8>>>;

const FIRST_FD: i32 = 100;

#[derive(Debug, Default)]
struct DeviceState {
    next_fd: i32,
    next_handle: u64,
    memory: HashMap<i32, Memory>,
    imports: u64,
}

/// Software stand-in for a GPU device with shareable buffer memory.
///
/// Allocations are addressed by fake file descriptors so buffer objects look exactly like the ones
/// a dma-buf exporter hands out. Imports share the backing memory instead of copying it. Pixel
/// data is premultiplied RGBA8 regardless of the fourcc; `XRGB8888` only marks alpha as ignored.
#[derive(Clone, Debug, Default)]
pub struct SoftDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl SoftDevice {
    /// Create an empty device.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a single-plane 32bpp buffer.
    pub fn allocate(&self, width: u32, height: u32, format: FourCc) -> ProxyResult<BufferObject> {
        if format.plane_count() != 1 {
            return Err(ProxyError::validation(format!(
                "soft device cannot allocate {format:?}"
            )));
        }
        if width == 0 || height == 0 {
            return Err(ProxyError::validation("allocation size must be non-zero"));
        }
        let stride = width
            .checked_mul(4)
            .ok_or_else(|| ProxyError::validation("allocation stride overflows u32"))?;
        let len = (stride as usize).saturating_mul(height as usize);

        let mut st = self.state();
        let fd = FIRST_FD + st.next_fd;
        st.next_fd += 1;
        st.next_handle += 1;
        let handle = Handle(st.next_handle);
        st.memory.insert(fd, Arc::new(RwLock::new(vec![0u8; len])));

        Ok(BufferObject::new(handle, format, width, height).with_plane(fd, stride, 0))
    }

    fn memory_for(&self, object: &BufferObject) -> ProxyResult<Memory> {
        let plane = object
            .planes
            .first()
            .ok_or_else(|| ProxyError::import("buffer object has no planes"))?;
        self.state()
            .memory
            .get(&plane.fd)
            .cloned()
            .ok_or_else(|| ProxyError::import(format!("fd {} is not a live allocation", plane.fd)))
    }

    /// Fill every pixel of `object` with a premultiplied color.
    pub fn fill(&self, object: &BufferObject, rgba_premul: [u8; 4]) -> ProxyResult<()> {
        let memory = self.memory_for(object)?;
        let mut bytes = memory.write().unwrap_or_else(PoisonError::into_inner);
        for px in bytes.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba_premul);
        }
        Ok(())
    }

    /// Overwrite the buffer contents with tightly packed premultiplied RGBA8 rows.
    pub fn write(&self, object: &BufferObject, data: &[u8]) -> ProxyResult<()> {
        let memory = self.memory_for(object)?;
        let mut bytes = memory.write().unwrap_or_else(PoisonError::into_inner);
        if data.len() != bytes.len() {
            return Err(ProxyError::validation(format!(
                "write expects {} bytes, got {}",
                bytes.len(),
                data.len()
            )));
        }
        bytes.copy_from_slice(data);
        Ok(())
    }

    /// Free the allocation behind `fd`. Later imports of buffers using it fail.
    pub fn close(&self, fd: i32) -> bool {
        self.state().memory.remove(&fd).is_some()
    }

    /// Number of successful imports so far.
    pub fn import_count(&self) -> u64 {
        self.state().imports
    }

    /// Wrap a buffer object as a sampleable image without copying its memory.
    pub fn import(&self, object: &BufferObject) -> ProxyResult<Arc<SoftImage>> {
        object
            .validate()
            .map_err(|e| ProxyError::import(e.to_string()))?;
        if object.format.plane_count() != 1 {
            return Err(ProxyError::import(format!(
                "soft device cannot sample {:?}",
                object.format
            )));
        }
        let plane = object.planes[0];
        let memory = self.memory_for(object)?;
        let needed = (plane.offset as usize)
            .saturating_add((plane.stride as usize).saturating_mul(object.height as usize));
        let available = memory.read().unwrap_or_else(PoisonError::into_inner).len();
        if needed > available {
            return Err(ProxyError::import(format!(
                "buffer {:?} needs {needed} bytes but fd {} holds {available}",
                object.handle, plane.fd
            )));
        }

        self.state().imports += 1;
        Ok(Arc::new(SoftImage {
            width: object.width,
            height: object.height,
            stride: plane.stride,
            offset: plane.offset,
            opaque: !object.format.has_alpha(),
            memory,
        }))
    }
}

/// Image imported by a [`SoftDevice`].
#[derive(Debug)]
pub struct SoftImage {
    width: u32,
    height: u32,
    stride: u32,
    offset: u32,
    opaque: bool,
    memory: Memory,
}

impl SoftImage {
    fn texel(&self, bytes: &[u8], x: u32, y: u32) -> [u8; 4] {
        let i = self.offset as usize + y as usize * self.stride as usize + x as usize * 4;
        let mut px = [bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]];
        if self.opaque {
            px[3] = 255;
        }
        px
    }
}

impl SampleableImage for SoftImage {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
struct FenceState {
    signaled: Mutex<bool>,
    cv: Condvar,
    waits: AtomicU32,
}

/// Fence controlled by the test or producer code that owns it.
#[derive(Clone, Debug, Default)]
pub struct SoftFence {
    state: Arc<FenceState>,
}

impl SoftFence {
    /// Create an unsignaled fence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an already signaled fence.
    pub fn signaled() -> Self {
        let f = Self::new();
        f.signal();
        f
    }

    /// Mark the writer's commands complete.
    pub fn signal(&self) {
        let mut s = self
            .state
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *s = true;
        self.state.cv.notify_all();
    }

    /// Signal from a helper thread after `delay`.
    pub fn signal_after(&self, delay: Duration) -> std::thread::JoinHandle<()> {
        let fence = self.clone();
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            fence.signal();
        })
    }

    /// Number of times a reader waited on this fence.
    pub fn wait_count(&self) -> u32 {
        self.state.waits.load(Ordering::Acquire)
    }
}

impl Fence for SoftFence {
    fn is_signaled(&self) -> bool {
        *self
            .state
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn server_wait(&self) {
        self.state.waits.fetch_add(1, Ordering::AcqRel);
        let guard = self
            .state
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let _done = self
            .state
            .cv
            .wait_while(guard, |s| !*s)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

/// Something the [`SoftTextureMapper`] did, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum MapperEvent {
    /// A buffer was imported.
    Import {
        /// Imported buffer.
        handle: Handle,
    },
    /// The mapper waited on a fence; `signaled` is the fence state once the wait returned.
    FenceWait {
        /// Fence state after the wait.
        signaled: bool,
    },
    /// An image was sampled into the target.
    Draw {
        /// Source image size.
        size: (u32, u32),
        /// Sampling flags used.
        flags: TextureFlags,
    },
}

/// CPU texture mapper drawing into an owned premultiplied RGBA8 target.
#[derive(Debug)]
pub struct SoftTextureMapper {
    device: SoftDevice,
    width: u32,
    height: u32,
    target: Vec<u8>,
    events: Vec<MapperEvent>,
}

impl SoftTextureMapper {
    /// Create a mapper importing from `device` and drawing into a `width`x`height` target.
    pub fn new(device: SoftDevice, width: u32, height: u32) -> Self {
        Self {
            device,
            width,
            height,
            target: vec![0u8; (width as usize) * (height as usize) * 4],
            events: Vec::new(),
        }
    }

    /// Target size in pixels.
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Fill the target with a premultiplied color.
    pub fn clear(&mut self, rgba_premul: [u8; 4]) {
        for px in self.target.chunks_exact_mut(4) {
            px.copy_from_slice(&rgba_premul);
        }
    }

    /// Target pixels, row-major premultiplied RGBA8.
    pub fn pixels(&self) -> &[u8] {
        &self.target
    }

    /// One target pixel.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = ((y * self.width + x) * 4) as usize;
        [
            self.target[i],
            self.target[i + 1],
            self.target[i + 2],
            self.target[i + 3],
        ]
    }

    /// Recorded events since creation or the last [`SoftTextureMapper::take_events`].
    pub fn events(&self) -> &[MapperEvent] {
        &self.events
    }

    /// Drain recorded events.
    pub fn take_events(&mut self) -> Vec<MapperEvent> {
        std::mem::take(&mut self.events)
    }
}

impl TextureMapper for SoftTextureMapper {
    fn import_image(&mut self, object: &BufferObject) -> ProxyResult<Arc<dyn SampleableImage>> {
        let image = self.device.import(object)?;
        self.events.push(MapperEvent::Import {
            handle: object.handle,
        });
        Ok(image)
    }

    fn wait_fence(&mut self, fence: &dyn Fence) {
        fence.server_wait();
        self.events.push(MapperEvent::FenceWait {
            signaled: fence.is_signaled(),
        });
    }

    fn draw_texture(
        &mut self,
        image: &dyn SampleableImage,
        params: &DrawParams,
    ) -> ProxyResult<()> {
        let Some(img) = image.as_any().downcast_ref::<SoftImage>() else {
            return Err(ProxyError::import(
                "image was not created by the soft device",
            ));
        };
        self.events.push(MapperEvent::Draw {
            size: img.size(),
            flags: params.flags,
        });

        let rect = params.target_rect;
        if rect.width() <= 0.0 || rect.height() <= 0.0 || img.width == 0 || img.height == 0 {
            return Ok(());
        }
        let inv = params.transform.inverse();
        let bbox = params.transform.transform_rect_bbox(rect);
        let x0 = bbox.x0.floor().max(0.0) as u32;
        let y0 = bbox.y0.floor().max(0.0) as u32;
        let x1 = (bbox.x1.ceil().max(0.0) as u32).min(self.width);
        let y1 = (bbox.y1.ceil().max(0.0) as u32).min(self.height);

        let bytes = img.memory.read().unwrap_or_else(PoisonError::into_inner);
        let blend = params.flags.contains(TextureFlags::BLEND);
        let flip = params.flags.contains(TextureFlags::FLIP_Y);

        for y in y0..y1 {
            for x in x0..x1 {
                let p = inv * Point::new(f64::from(x) + 0.5, f64::from(y) + 0.5);
                if p.x < rect.x0 || p.x >= rect.x1 || p.y < rect.y0 || p.y >= rect.y1 {
                    continue;
                }
                let u = (((p.x - rect.x0) / rect.width() * f64::from(img.width)) as u32)
                    .min(img.width - 1);
                let mut v = (((p.y - rect.y0) / rect.height() * f64::from(img.height)) as u32)
                    .min(img.height - 1);
                if flip {
                    v = img.height - 1 - v;
                }
                let src = img.texel(&bytes, u, v);

                let di = ((y * self.width + x) * 4) as usize;
                let dst = [
                    self.target[di],
                    self.target[di + 1],
                    self.target[di + 2],
                    self.target[di + 3],
                ];
                let out = if blend {
                    over(dst, src, params.opacity)
                } else {
                    scale(src, params.opacity)
                };
                self.target[di..di + 4].copy_from_slice(&out);
            }
        }
        Ok(())
    }
}

fn opacity_u16(opacity: f32) -> u16 {
    ((opacity.clamp(0.0, 1.0) * 255.0).round() as i32).clamp(0, 255) as u16
}

fn over(dst: [u8; 4], src: [u8; 4], opacity: f32) -> [u8; 4] {
    let op = opacity_u16(opacity);
    let sa = mul_div255(u16::from(src[3]), op);
    if op == 0 || sa == 0 {
        return dst;
    }
    let inv = 255u16 - u16::from(sa);

    let mut out = [0u8; 4];
    out[3] = sa.saturating_add(mul_div255(u16::from(dst[3]), inv));
    for i in 0..3 {
        let sc = mul_div255(u16::from(src[i]), op);
        let dc = mul_div255(u16::from(dst[i]), inv);
        out[i] = sc.saturating_add(dc);
    }
    out
}

fn scale(src: [u8; 4], opacity: f32) -> [u8; 4] {
    let op = opacity_u16(opacity);
    src.map(|c| mul_div255(u16::from(c), op))
}

fn mul_div255(x: u16, y: u16) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

#[cfg(test)]
#[path = "../../tests/unit/gpu/soft.rs"]
mod tests;
