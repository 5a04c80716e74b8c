use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::*;
use crate::buffer::object::ReleaseFlag;
use crate::foundation::core::FourCc;
use crate::gpu::soft::{MapperEvent, SoftDevice, SoftFence, SoftTextureMapper};
use crate::proxy::FrameRequests;
use crate::runloop::ManualRunLoop;

struct Rig {
    dev: SoftDevice,
    mapper: SoftTextureMapper,
    run_loop: ManualRunLoop,
    requests: Arc<FrameRequests>,
    proxy: Arc<DirectHandoffProxy>,
}

fn rig() -> Rig {
    let dev = SoftDevice::new();
    let run_loop = ManualRunLoop::new();
    let requests = Arc::new(FrameRequests::new());
    let proxy = Arc::new(DirectHandoffProxy::new(ContentType::WebGl));
    proxy
        .activate_on_compositor(CompositorHandle::new(
            requests.clone(),
            Arc::new(run_loop.clone()),
        ))
        .unwrap();
    Rig {
        mapper: SoftTextureMapper::new(dev.clone(), 4, 4),
        dev,
        run_loop,
        requests,
        proxy,
    }
}

impl Rig {
    /// A texture backed by a producer buffer; returns the buffer's recycling signal too.
    fn texture(&self, rgba: [u8; 4]) -> (TextureBuffer, ReleaseFlag) {
        let obj = self.dev.allocate(4, 4, FourCc::ARGB8888).unwrap();
        self.dev.fill(&obj, rgba).unwrap();
        let image = self.dev.import(&obj).unwrap();
        let flag = obj.release_flag.clone();
        (TextureBuffer::new(image).with_backing(obj), flag)
    }

    fn paint(&mut self) -> PaintOutcome {
        self.proxy
            .paint(
                &mut self.mapper,
                Rect::new(0.0, 0.0, 4.0, 4.0),
                Affine::IDENTITY,
                1.0,
            )
            .unwrap()
    }

    /// Block until the proxy armed its update timer.
    fn await_update(&self) {
        assert!(self.run_loop.wait_for_work(Duration::from_secs(5)));
    }
}

#[test]
fn swap_commits_latest_push_and_retires_skipped() {
    let mut r = rig();
    let (first, first_flag) = r.texture([255, 0, 0, 255]);
    let (second, second_flag) = r.texture([0, 255, 0, 255]);

    assert!(r.proxy.push_next_buffer(first));
    assert!(r.proxy.push_next_buffer(second));
    assert_eq!(first_flag.release_count(), 1);

    assert_eq!(r.proxy.swap_buffer(), SwapOutcome::Swapped);
    assert_eq!(r.paint(), PaintOutcome::Painted);
    assert_eq!(r.mapper.pixel(0, 0), [0, 255, 0, 255]);
    assert!(!second_flag.is_released());
}

#[test]
fn swap_retires_previous_committed() {
    let r = rig();
    let (a, a_flag) = r.texture([1, 1, 1, 255]);
    let (b, b_flag) = r.texture([2, 2, 2, 255]);
    r.proxy.push_next_buffer(a);
    r.proxy.swap_buffer();
    assert!(!a_flag.is_released());

    r.proxy.push_next_buffer(b);
    r.proxy.swap_buffer();
    assert_eq!(a_flag.release_count(), 1);
    assert!(!b_flag.is_released());
}

#[test]
fn swap_without_pending_keeps_committed() {
    let mut r = rig();
    assert_eq!(r.proxy.swap_buffer(), SwapOutcome::NoPending);
    assert_eq!(r.paint(), PaintOutcome::NothingCommitted);

    let (a, _) = r.texture([9, 9, 9, 255]);
    r.proxy.push_next_buffer(a);
    r.proxy.swap_buffer();
    assert_eq!(r.proxy.swap_buffer(), SwapOutcome::NoPending);
    assert_eq!(r.paint(), PaintOutcome::Painted);
}

#[test]
fn paint_waits_on_texture_fence() {
    let mut r = rig();
    let fence = SoftFence::new();
    let (tex, _) = r.texture([0, 0, 0, 255]);
    r.proxy
        .push_next_buffer(tex.with_fence(Arc::new(fence.clone())));
    r.proxy.swap_buffer();

    let signaler = fence.signal_after(Duration::from_millis(20));
    r.paint();
    signaler.join().unwrap();
    assert_eq!(fence.wait_count(), 1);
    assert_eq!(
        r.mapper.events().first(),
        Some(&MapperEvent::FenceWait { signaled: true })
    );
}

#[test]
fn guard_batches_checks_with_push() {
    let r = rig();
    let (tex, _) = r.texture([0, 0, 0, 255]);
    {
        let mut lock = r.proxy.lock();
        assert!(lock.is_valid());
        assert!(!lock.has_pending());
        assert!(lock.push_next_buffer(tex));
        assert!(lock.has_pending());
        // Still locked: the wake-up waits for the guard.
        assert_eq!(r.requests.outstanding(), 0);
    }
    assert_eq!(r.requests.outstanding(), 1);
}

#[test]
fn wake_ups_coalesce_until_swap() {
    let r = rig();
    for _ in 0..4 {
        let (tex, _) = r.texture([0, 0, 0, 255]);
        r.proxy.push_next_buffer(tex);
    }
    assert_eq!(r.requests.take(), 1);
    r.proxy.swap_buffer();
    let (tex, _) = r.texture([0, 0, 0, 255]);
    r.proxy.push_next_buffer(tex);
    assert_eq!(r.requests.take(), 1);
}

#[test]
fn schedule_requires_activation() {
    let proxy = DirectHandoffProxy::new(ContentType::Canvas);
    assert!(!proxy.schedule_update_on_compositor(Box::new(|| {})));
    assert!(!proxy.drop_current_buffer_while_preserving_texture(false));
}

#[test]
fn scheduled_updates_coalesce_to_latest() {
    let r = rig();
    let ran = Arc::new(AtomicUsize::new(0));
    for i in 1..=3 {
        let ran = Arc::clone(&ran);
        assert!(
            r.proxy
                .schedule_update_on_compositor(Box::new(move || ran.store(i, Ordering::SeqCst)))
        );
    }
    assert_eq!(r.run_loop.run_pending(), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(r.run_loop.run_pending(), 0);
}

#[test]
fn drop_without_wait_happens_on_next_tick() {
    let mut r = rig();
    let (tex, flag) = r.texture([7, 7, 7, 255]);
    r.proxy.push_next_buffer(tex);
    r.proxy.swap_buffer();

    assert!(r.proxy.drop_current_buffer_while_preserving_texture(false));
    assert!(!flag.is_released());
    r.run_loop.run_pending();
    assert_eq!(flag.release_count(), 1);

    assert_eq!(r.paint(), PaintOutcome::Painted);
    assert_eq!(r.mapper.pixel(3, 3), [7, 7, 7, 255]);
}

#[test]
fn waiting_drop_returns_only_after_compositor_processed_it() {
    let mut r = rig();
    let (tex, flag) = r.texture([5, 6, 7, 255]);
    r.proxy.push_next_buffer(tex);
    r.proxy.swap_buffer();

    let returned = Arc::new(AtomicBool::new(false));
    let producer = {
        let proxy = Arc::clone(&r.proxy);
        let returned = Arc::clone(&returned);
        std::thread::spawn(move || {
            let scheduled = proxy.drop_current_buffer_while_preserving_texture(true);
            returned.store(true, Ordering::SeqCst);
            scheduled
        })
    };

    r.await_update();
    std::thread::sleep(Duration::from_millis(20));
    assert!(!returned.load(Ordering::SeqCst));
    assert!(!flag.is_released());

    assert_eq!(r.run_loop.run_pending(), 1);
    assert!(producer.join().unwrap());
    assert!(returned.load(Ordering::SeqCst));
    assert_eq!(flag.release_count(), 1);

    // The texture outlives its backing buffer.
    assert_eq!(r.paint(), PaintOutcome::Painted);
    assert_eq!(r.mapper.pixel(0, 0), [5, 6, 7, 255]);
}

#[test]
fn drop_merges_with_scheduled_callback() {
    let r = rig();
    let ran = Arc::new(AtomicBool::new(false));
    let hit = Arc::clone(&ran);
    r.proxy
        .schedule_update_on_compositor(Box::new(move || hit.store(true, Ordering::SeqCst)));

    let producer = {
        let proxy = Arc::clone(&r.proxy);
        std::thread::spawn(move || proxy.drop_current_buffer_while_preserving_texture(true))
    };
    // The timer is already armed by the callback; give the producer time to merge its drop.
    std::thread::sleep(Duration::from_millis(20));
    r.run_loop.run_pending();

    // A drop that lost the race to the first tick is acknowledged on the next one.
    while !producer.is_finished() {
        r.run_loop.wait_for_work(Duration::from_millis(10));
        r.run_loop.run_pending();
    }
    assert!(producer.join().unwrap());
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn invalidate_wakes_waiting_drop() {
    let r = rig();
    let (tex, flag) = r.texture([0, 0, 0, 255]);
    r.proxy.push_next_buffer(tex);
    r.proxy.swap_buffer();

    let producer = {
        let proxy = Arc::clone(&r.proxy);
        std::thread::spawn(move || proxy.drop_current_buffer_while_preserving_texture(true))
    };
    r.await_update();
    r.proxy.invalidate();

    assert!(producer.join().unwrap());
    assert_eq!(flag.release_count(), 1);
    // The stopped timer never fires.
    assert_eq!(r.run_loop.run_pending(), 0);
}

#[test]
fn operations_after_invalidate_are_noops() {
    let mut r = rig();
    let (a, a_flag) = r.texture([0, 0, 0, 255]);
    let (b, b_flag) = r.texture([0, 0, 0, 255]);
    r.proxy.push_next_buffer(a);
    r.proxy.swap_buffer();
    r.proxy.push_next_buffer(b);
    r.requests.take();

    r.proxy.invalidate();
    r.proxy.invalidate();
    assert_eq!(a_flag.release_count(), 1);
    assert_eq!(b_flag.release_count(), 1);
    assert!(!r.proxy.is_active());

    let (late, late_flag) = r.texture([0, 0, 0, 255]);
    assert!(!r.proxy.push_next_buffer(late));
    assert!(late_flag.is_released());
    assert_eq!(r.proxy.swap_buffer(), SwapOutcome::Inactive);
    assert_eq!(r.paint(), PaintOutcome::Inactive);
    assert!(!r.proxy.schedule_update_on_compositor(Box::new(|| {})));
    assert!(!r.proxy.drop_current_buffer_while_preserving_texture(false));
    assert_eq!(r.requests.outstanding(), 0);
    assert!(r.mapper.events().is_empty());
}

#[test]
fn activation_after_invalidate_fails() {
    let proxy = Arc::new(DirectHandoffProxy::new(ContentType::WebGl));
    proxy.invalidate();
    let err = proxy
        .activate_on_compositor(CompositorHandle::new(
            Arc::new(FrameRequests::new()),
            Arc::new(ManualRunLoop::new()),
        ))
        .unwrap_err();
    assert!(matches!(err, crate::ProxyError::NotActive));
}
