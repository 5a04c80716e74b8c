use super::*;
use crate::foundation::core::FourCc;
use crate::foundation::error::ProxyError;
use crate::gpu::soft::{SoftDevice, SoftFence};

fn layer_for(dev: &SoftDevice) -> Layer {
    Layer::new(
        dev.allocate(2, 2, FourCc::ARGB8888).unwrap(),
        TextureFlags::empty(),
    )
}

#[test]
fn ensure_with_creates_only_on_miss() {
    let dev = SoftDevice::new();
    let mut cache = LayerCache::default();
    let layer = layer_for(&dev);
    let h = layer.handle();

    let (_, created) = cache.ensure_with(h, || Ok(layer)).unwrap();
    assert!(created);

    let (found, created) = cache
        .ensure_with(h, || panic!("cached handle must not be created again"))
        .unwrap();
    assert!(!created);
    assert_eq!(found.handle(), h);
    assert_eq!(cache.len(), 1);
}

#[test]
fn failed_create_leaves_cache_unchanged() {
    let mut cache = LayerCache::default();
    let err = cache
        .ensure_with(Handle(7), || Err(ProxyError::import("no memory")))
        .unwrap_err();
    assert!(matches!(err, ProxyError::Import(_)));
    assert_eq!(cache.len(), 0);
    assert!(!cache.contains(Handle(7)));
}

#[test]
fn aging_skips_kept_handle_and_expires_past_max() {
    let dev = SoftDevice::new();
    let mut cache = LayerCache::default();
    let keep = layer_for(&dev);
    let stale = layer_for(&dev);
    let (keep_h, stale_h) = (keep.handle(), stale.handle());
    cache.ensure_with(keep_h, || Ok(keep)).unwrap();
    cache.ensure_with(stale_h, || Ok(stale)).unwrap();

    for _ in 0..3 {
        assert!(cache.age_all_except(keep_h, None, 3).is_empty());
    }
    assert_eq!(cache.get(keep_h).unwrap().age(), 0);
    assert_eq!(cache.get(stale_h).unwrap().age(), 3);

    let expired = cache.age_all_except(keep_h, None, 3);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].handle(), stale_h);
    assert_eq!(cache.handles(), vec![keep_h]);
}

#[test]
fn refresh_resets_age_and_replaces_fence() {
    let dev = SoftDevice::new();
    let mut cache = LayerCache::default();
    let a = layer_for(&dev);
    let b = layer_for(&dev);
    let (ah, bh) = (a.handle(), b.handle());
    cache.ensure_with(ah, || Ok(a)).unwrap();
    cache.ensure_with(bh, || Ok(b)).unwrap();
    cache.age_all_except(ah, None, MAX_LAYER_AGE);
    cache.age_all_except(ah, None, MAX_LAYER_AGE);

    let layer = cache.get_mut(bh).unwrap();
    assert_eq!(layer.age(), 2);
    assert!(!layer.has_fence());
    layer.refresh(TextureFlags::FLIP_Y, Some(Arc::new(SoftFence::signaled())));
    assert_eq!(layer.age(), 0);
    assert!(layer.has_fence());
    assert_eq!(layer.flags(), TextureFlags::FLIP_Y);
}

#[test]
fn pinned_layer_ages_but_stays() {
    let dev = SoftDevice::new();
    let mut cache = LayerCache::default();
    let keep = layer_for(&dev);
    let pinned = layer_for(&dev);
    let (keep_h, pinned_h) = (keep.handle(), pinned.handle());
    cache.ensure_with(keep_h, || Ok(keep)).unwrap();
    cache.ensure_with(pinned_h, || Ok(pinned)).unwrap();

    for _ in 0..4 {
        assert!(cache.age_all_except(keep_h, Some(pinned_h), 1).is_empty());
    }
    assert_eq!(cache.get(pinned_h).unwrap().age(), 4);

    let expired = cache.age_all_except(keep_h, None, 1);
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].handle(), pinned_h);
}

#[test]
fn stored_image_marks_layer_imported() {
    let dev = SoftDevice::new();
    let mut layer = layer_for(&dev);
    assert!(!layer.is_imported());
    assert!(layer.imported().is_none());

    let image: Arc<dyn SampleableImage> = dev.import(layer.object()).unwrap();
    layer.set_image(Arc::clone(&image));
    assert!(layer.is_imported());
    assert!(Arc::ptr_eq(&layer.imported().unwrap(), &image));
}

#[test]
fn remove_hands_back_the_layer() {
    let dev = SoftDevice::new();
    let mut cache = LayerCache::default();
    let layer = layer_for(&dev);
    let h = layer.handle();
    cache.ensure_with(h, || Ok(layer)).unwrap();

    assert_eq!(cache.remove(h).map(|l| l.handle()), Some(h));
    assert!(cache.remove(h).is_none());
    assert_eq!(cache.len(), 0);
}

#[test]
fn release_flips_signal_once() {
    let dev = SoftDevice::new();
    let layer = layer_for(&dev);
    let flag = layer.object().release_flag.clone();
    assert!(layer.release());
    assert!(!layer.release());
    assert!(flag.is_released());
    assert_eq!(flag.release_count(), 1);
}

#[test]
fn drain_empties_cache() {
    let dev = SoftDevice::new();
    let mut cache = LayerCache::default();
    for _ in 0..3 {
        let layer = layer_for(&dev);
        cache.ensure_with(layer.handle(), || Ok(layer)).unwrap();
    }
    assert_eq!(cache.drain().len(), 3);
    assert_eq!(cache.len(), 0);
}
