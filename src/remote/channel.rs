use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;

use crate::buffer::object::BufferObject;
use crate::foundation::core::FourCc;
use crate::foundation::error::{ProxyError, ProxyResult};
use crate::gpu::soft::SoftDevice;
use crate::remote::{DisplayReply, DisplayRequest, DisplayTransport};

/// In-process [`DisplayTransport`] backed by a pair of channels.
///
/// Buffer objects cross unchanged, recycling signal included, so a [`RingProducer`] on the other
/// end sees the compositor's releases.
#[derive(Debug)]
pub struct ChannelTransport {
    requests: Sender<DisplayRequest>,
    replies: Receiver<ProxyResult<DisplayReply>>,
}

/// Producer end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelEndpoint {
    requests: Receiver<DisplayRequest>,
    replies: Sender<ProxyResult<DisplayReply>>,
}

/// Create a connected transport/endpoint pair.
pub fn channel_pair() -> (ChannelTransport, ChannelEndpoint) {
    let (req_tx, req_rx) = mpsc::channel();
    let (rep_tx, rep_rx) = mpsc::channel();
    (
        ChannelTransport {
            requests: req_tx,
            replies: rep_rx,
        },
        ChannelEndpoint {
            requests: req_rx,
            replies: rep_tx,
        },
    )
}

impl DisplayTransport for ChannelTransport {
    fn send_sync(&mut self, request: DisplayRequest) -> ProxyResult<DisplayReply> {
        self.requests
            .send(request)
            .map_err(|_| ProxyError::transport("remote producer is gone"))?;
        self.replies
            .recv()
            .map_err(|_| ProxyError::transport("remote producer hung up before replying"))?
    }
}

impl ChannelEndpoint {
    /// Block for the next request. `None` once the transport is dropped.
    pub fn recv(&self) -> Option<DisplayRequest> {
        self.requests.recv().ok()
    }

    /// Answer the request last received. Returns `false` once the transport is dropped.
    pub fn reply(&self, reply: ProxyResult<DisplayReply>) -> bool {
        self.replies.send(reply).is_ok()
    }
}

/// Options for [`RingProducer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingOpts {
    /// Number of physical buffers rotated through.
    pub ring_size: usize,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Stop answering (simulating a crashed GPU process) after this many frames.
    pub fail_after: Option<u64>,
}

impl Default for RingOpts {
    fn default() -> Self {
        Self {
            ring_size: 3,
            width: 64,
            height: 64,
            fail_after: None,
        }
    }
}

/// Counters reported when a [`RingProducer`] stops.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingStats {
    /// Frames handed out.
    pub frames: u64,
    /// Times a slot was reused after the compositor released it.
    pub recycled: u64,
    /// Times a slot was reused while the compositor still held it.
    pub overwritten: u64,
}

/// Stand-in for a remote GPU process: renders into a small ring of shared buffers and answers
/// [`DisplayRequest::PrepareForDisplay`] with the buffer just rendered.
#[derive(Debug)]
pub struct RingProducer {
    device: SoftDevice,
    ring: Vec<BufferObject>,
    next: usize,
    opts: RingOpts,
    stats: RingStats,
}

impl RingProducer {
    /// Allocate the ring on `device`.
    pub fn new(device: SoftDevice, opts: RingOpts) -> ProxyResult<Self> {
        if opts.ring_size == 0 {
            return Err(ProxyError::validation("ring_size must be > 0"));
        }
        let ring = (0..opts.ring_size)
            .map(|_| device.allocate(opts.width, opts.height, FourCc::ARGB8888))
            .collect::<ProxyResult<Vec<_>>>()?;
        Ok(Self {
            device,
            ring,
            next: 0,
            opts,
            stats: RingStats::default(),
        })
    }

    /// Counters so far.
    pub fn stats(&self) -> RingStats {
        self.stats
    }

    /// Render the next frame and return its descriptor.
    pub fn render_next(&mut self) -> ProxyResult<BufferObject> {
        let slot = &self.ring[self.next];
        let flag = &slot.release_flag;
        if self.stats.frames >= self.ring.len() as u64 {
            if flag.is_released() {
                self.stats.recycled += 1;
            } else {
                self.stats.overwritten += 1;
            }
        }
        flag.rearm();

        let shade = (self.stats.frames % 256) as u8;
        self.device.fill(slot, [shade, 255 - shade, 128, 255])?;
        let out = slot.duplicate();

        self.stats.frames += 1;
        self.next = (self.next + 1) % self.ring.len();
        Ok(out)
    }

    /// Answer requests on `endpoint` until the transport goes away or the configured failure point
    /// is reached.
    pub fn serve(mut self, endpoint: ChannelEndpoint) -> RingStats {
        while let Some(request) = endpoint.recv() {
            let DisplayRequest::PrepareForDisplay = request;
            if self.opts.fail_after.is_some_and(|n| self.stats.frames >= n) {
                tracing::debug!(frames = self.stats.frames, "ring producer failing on purpose");
                endpoint.reply(Err(ProxyError::transport("gpu process crashed")));
                break;
            }
            let reply = self.render_next().map(|object| DisplayReply { object });
            if !endpoint.reply(reply) {
                break;
            }
        }
        tracing::debug!(stats = ?self.stats, "ring producer stopped");
        self.stats
    }

    /// Run [`RingProducer::serve`] on its own thread.
    pub fn spawn(self, endpoint: ChannelEndpoint) -> JoinHandle<RingStats> {
        std::thread::spawn(move || self.serve(endpoint))
    }
}

#[cfg(test)]
#[path = "../../tests/unit/remote/channel.rs"]
mod tests;
