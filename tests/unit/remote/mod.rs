use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::*;
use crate::foundation::core::{Affine, FourCc, Rect};
use crate::gpu::soft::{MapperEvent, SoftDevice, SoftTextureMapper};
use crate::proxy::{CompositorHandle, FrameRequests, PaintOutcome, SwapOutcome};
use crate::runloop::ManualRunLoop;

struct Scripted {
    replies: VecDeque<ProxyResult<DisplayReply>>,
    sent: Arc<AtomicUsize>,
}

impl DisplayTransport for Scripted {
    fn send_sync(&mut self, request: DisplayRequest) -> ProxyResult<DisplayReply> {
        assert_eq!(request, DisplayRequest::PrepareForDisplay);
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.replies
            .pop_front()
            .unwrap_or_else(|| Err(ProxyError::transport("script exhausted")))
    }
}

fn activate(proxy: &CachedHandoffProxy) -> Arc<FrameRequests> {
    let requests = Arc::new(FrameRequests::new());
    proxy
        .activate_on_compositor(CompositorHandle::new(
            requests.clone(),
            Arc::new(ManualRunLoop::new()),
        ))
        .unwrap();
    requests
}

#[test]
fn flags_follow_opacity() {
    assert_eq!(
        PresenterOpts::default().texture_flags(),
        TextureFlags::FLIP_Y | TextureFlags::BLEND
    );
    let opaque = PresenterOpts {
        opaque: true,
        ..PresenterOpts::default()
    };
    assert_eq!(opaque.texture_flags(), TextureFlags::FLIP_Y);
}

#[test]
fn request_wire_format() {
    let json = serde_json::to_string(&DisplayRequest::PrepareForDisplay).unwrap();
    assert_eq!(json, r#"{"type":"prepare_for_display"}"#);
}

#[test]
fn delegate_pushes_latest_frame_at_swap() {
    let dev = SoftDevice::new();
    let delegate = DisplayDelegate::new(PresenterOpts::default(), CachedProxyOpts::default())
        .unwrap();
    let proxy = Arc::clone(delegate.proxy());
    assert_eq!(proxy.content_type(), ContentType::WebGl);
    activate(&proxy);

    let skipped = dev.allocate(2, 2, FourCc::ARGB8888).unwrap();
    let skipped_flag = skipped.release_flag.clone();
    let shown = dev.allocate(2, 2, FourCc::ARGB8888).unwrap();
    let shown_handle = shown.handle;
    delegate.present(skipped);
    delegate.present(shown);
    assert!(delegate.has_pending_frame());

    assert_eq!(proxy.swap_buffer(), SwapOutcome::Swapped);
    assert!(!delegate.has_pending_frame());
    assert_eq!(proxy.committed_handle(), Some(shown_handle));
    assert_eq!(proxy.cached_layer_count(), 1);
    assert!(!skipped_flag.is_released());

    let mut mapper = SoftTextureMapper::new(dev, 2, 2);
    let layer = delegate.platform_layer();
    assert_eq!(
        layer
            .paint(&mut mapper, Rect::new(0.0, 0.0, 2.0, 2.0), Affine::IDENTITY, 1.0)
            .unwrap(),
        PaintOutcome::Painted
    );
    assert!(mapper.events().contains(&MapperEvent::Draw {
        size: (2, 2),
        flags: TextureFlags::FLIP_Y | TextureFlags::BLEND,
    }));
}

#[test]
fn empty_present_clears_pending_frame() {
    let dev = SoftDevice::new();
    let delegate = DisplayDelegate::new(PresenterOpts::default(), CachedProxyOpts::default())
        .unwrap();
    activate(delegate.proxy());

    delegate.present(dev.allocate(2, 2, FourCc::ARGB8888).unwrap());
    delegate.present(BufferObject::empty());
    assert!(!delegate.has_pending_frame());
    assert_eq!(delegate.proxy().swap_buffer(), SwapOutcome::NoPending);
}

#[test]
fn dropping_delegate_detaches_it_from_the_proxy() {
    let dev = SoftDevice::new();
    let delegate = DisplayDelegate::new(PresenterOpts::default(), CachedProxyOpts::default())
        .unwrap();
    let proxy = Arc::clone(delegate.proxy());
    activate(&proxy);

    delegate.present(dev.allocate(2, 2, FourCc::ARGB8888).unwrap());
    drop(delegate);
    assert_eq!(proxy.swap_buffer(), SwapOutcome::NoPending);
}

#[test]
fn failed_request_loses_context_for_good() {
    let dev = SoftDevice::new();
    let sent = Arc::new(AtomicUsize::new(0));
    let transport = Scripted {
        replies: VecDeque::from([
            Ok(DisplayReply {
                object: dev.allocate(2, 2, FourCc::ARGB8888).unwrap(),
            }),
            Err(ProxyError::transport("connection reset")),
            Ok(DisplayReply {
                object: dev.allocate(2, 2, FourCc::ARGB8888).unwrap(),
            }),
        ]),
        sent: Arc::clone(&sent),
    };
    let mut presenter =
        RemoteFramePresenter::new(transport, PresenterOpts::default(), CachedProxyOpts::default())
            .unwrap();

    presenter.prepare_for_display().unwrap();
    assert!(presenter.delegate().has_pending_frame());
    assert!(!presenter.is_context_lost());

    let err = presenter.prepare_for_display().unwrap_err();
    assert!(matches!(err, ProxyError::ContextLost));
    assert!(presenter.is_context_lost());

    for _ in 0..3 {
        assert!(matches!(
            presenter.prepare_for_display(),
            Err(ProxyError::ContextLost)
        ));
    }
    assert_eq!(sent.load(Ordering::SeqCst), 2);
    // The frame presented before the failure is still delivered.
    assert!(presenter.delegate().has_pending_frame());
}
