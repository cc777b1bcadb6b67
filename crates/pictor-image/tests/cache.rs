//! End-to-end cache behavior: load, visibility, budget, grace, locks.

use pictor_image::{
    CacheConfig, ContentProvider, EvictionPolicy, Image, ImageError, ImageListener, ImageManager,
    ListenerId, LoadStatus, MemoryProvider, ProviderId,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minimal GIF89a builder: global 2-color palette (red, blue), each
/// frame is the full 1x1 canvas showing one palette index.
fn gif_1x1(frames: &[u8], loop_forever: bool) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(b"GIF89a");
    out.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0xF0, 0x00, 0x00]);
    out.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00, 0x00, 0xFF]);
    if loop_forever {
        out.extend_from_slice(b"\x21\xFF\x0BNETSCAPE2.0\x03\x01\x00\x00\x00");
    }
    for &index in frames {
        // GCE: do-not-dispose, 10cs delay, no transparency
        out.extend_from_slice(&[0x21, 0xF9, 0x04, 0x04, 0x0A, 0x00, 0x00, 0x00]);
        out.extend_from_slice(&[0x2C, 0, 0, 0, 0, 0x01, 0x00, 0x01, 0x00, 0x00]);
        // LZW min code 2: clear, <index>, end-of-information
        let data = 0x04 | (index << 3) | 0x40;
        out.extend_from_slice(&[0x02, 0x02, data, 0x01, 0x00]);
    }
    out.push(0x3B);
    out
}

fn tiny_config(cache_size: usize) -> CacheConfig {
    CacheConfig {
        cache_size,
        grace_time: Duration::ZERO,
        ..CacheConfig::default()
    }
}

#[derive(Default)]
struct RecordingListener {
    decoded: Cell<u32>,
    errors: RefCell<Vec<ImageError>>,
}

impl ImageListener for RecordingListener {
    fn on_portion_decoded(&self) {
        self.decoded.set(self.decoded.get() + 1);
    }

    fn on_error(&self, error: &ImageError) {
        self.errors.borrow_mut().push(error.clone());
    }
}

fn subscribe(
    manager: &mut ImageManager,
    image: &Image,
    id: ListenerId,
) -> Rc<RecordingListener> {
    let listener = Rc::new(RecordingListener::default());
    let as_dyn: Rc<dyn ImageListener> = listener.clone();
    manager.inc_visible(image, id, Rc::downgrade(&as_dyn));
    listener
}

fn pixel(bitmap: &pictor_image::SharedBitmap) -> [u8; 4] {
    let b = bitmap.borrow();
    let px = b.pixels();
    [px[0], px[1], px[2], px[3]]
}

#[test]
fn test_animated_gif_loads_and_composites() {
    init_logging();
    let mut manager = ImageManager::new(CacheConfig::default());
    let image = manager.get_image(ProviderId(1), "image/gif");
    let viewer = ListenerId(1);
    let listener = subscribe(&mut manager, &image, viewer);

    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0, 1], true));
    let status = manager.on_more_data(&image, &mut provider).unwrap();
    assert_eq!(status, LoadStatus::Finished);
    assert!(listener.decoded.get() > 0);

    assert_eq!((image.width(), image.height()), (1, 1));
    assert_eq!(image.frame_count(), 2);
    assert!(image.is_fully_decoded());

    let frame0 = manager.frame_bitmap(&image, viewer).unwrap();
    assert_eq!(pixel(&frame0), [255, 0, 0, 255]);
    assert!(manager.animate(&image, viewer));
    let frame1 = manager.frame_bitmap(&image, viewer).unwrap();
    assert_eq!(pixel(&frame1), [0, 0, 255, 255]);
    // Loop forever: wraps back to the first frame
    assert!(manager.animate(&image, viewer));
    let frame0_again = manager.frame_bitmap(&image, viewer).unwrap();
    assert_eq!(pixel(&frame0_again), [255, 0, 0, 255]);
}

#[test]
fn test_bytewise_feed_matches_whole_load() {
    let bytes = gif_1x1(&[0, 1], false);

    let mut whole_manager = ImageManager::new(CacheConfig::default());
    let whole = whole_manager.get_image(ProviderId(1), "image/gif");
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &bytes);
    whole_manager.on_more_data(&whole, &mut provider).unwrap();

    let mut manager = ImageManager::new(CacheConfig::default());
    let image = manager.get_image(ProviderId(2), "image/gif");
    let viewer = ListenerId(1);
    subscribe(&mut manager, &image, viewer);
    let mut provider = MemoryProvider::new(ProviderId(2), "image/gif");
    for (i, byte) in bytes.iter().enumerate() {
        provider.append(&[*byte]);
        if i + 1 == bytes.len() {
            provider.finish();
        }
        let status = manager.on_more_data(&image, &mut provider).unwrap();
        if i + 1 == bytes.len() {
            assert_eq!(status, LoadStatus::Finished);
        }
    }

    assert_eq!(image.frame_count(), whole.frame_count());
    let a = manager.frame_bitmap(&image, viewer).unwrap();
    let b = whole_manager.frame_bitmap(&whole, ListenerId(9)).unwrap();
    assert_eq!(pixel(&a), pixel(&b));
}

#[test]
fn test_invisible_image_evicted_over_budget() {
    let mut manager = ImageManager::new(tiny_config(1));
    let image = manager.get_image(ProviderId(1), "image/gif");
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();

    // Invisible, unlocked, no grace: evicted as soon as the budget trips
    assert_eq!(manager.used_mem(), 0);
    assert!(manager.stats().evictions >= 1);
    // Dimensions survive eviction
    assert_eq!((image.width(), image.height()), (1, 1));
    assert!(image.bitmap().is_none());
}

#[test]
fn test_visible_image_survives_over_budget() {
    let mut manager = ImageManager::new(tiny_config(1));
    let image = manager.get_image(ProviderId(1), "image/gif");
    subscribe(&mut manager, &image, ListenerId(1));
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();

    assert!(manager.used_mem() > 0);
    assert_eq!(manager.stats().evictions, 0);
    assert!(image.bitmap().is_some());
}

#[test]
fn test_lock_defers_eviction_until_unlock() {
    let mut manager = ImageManager::new(tiny_config(1));
    let image = manager.get_image(ProviderId(1), "image/gif");
    subscribe(&mut manager, &image, ListenerId(1));
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();

    manager.lock_cache();
    manager.dec_visible(&image, ListenerId(1));
    // Over budget but locked: nothing freed yet
    assert!(manager.used_mem() > 0);
    manager.unlock_cache();
    // Grace time is zero, so the deferred free lands immediately
    assert_eq!(manager.used_mem(), 0);
}

#[test]
fn test_grace_time_retains_recently_hidden() {
    let config = CacheConfig {
        cache_size: 1,
        grace_time: Duration::from_secs(60),
        ..CacheConfig::default()
    };
    let mut manager = ImageManager::new(config);
    let image = manager.get_image(ProviderId(1), "image/gif");
    subscribe(&mut manager, &image, ListenerId(1));
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();

    manager.dec_visible(&image, ListenerId(1));
    manager.free_memory();
    assert!(manager.used_mem() > 0, "grace window must block eviction");
}

#[test]
fn test_grace_span_protects_until_end() {
    let mut manager = ImageManager::new(tiny_config(1));
    let image = manager.get_image(ProviderId(1), "image/gif");
    subscribe(&mut manager, &image, ListenerId(1));
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();

    manager.begin_grace();
    manager.dec_visible(&image, ListenerId(1));
    manager.free_memory();
    assert!(manager.used_mem() > 0, "pending grace blocks eviction");
    manager.end_grace();
    // Grace time is zero, so the stamped window is already over
    manager.free_memory();
    assert_eq!(manager.used_mem(), 0);
}

#[test]
fn test_cooperative_step_budget_yields() {
    let config = CacheConfig {
        decode_step_bytes: Some(8),
        ..CacheConfig::default()
    };
    let mut manager = ImageManager::new(config);
    let image = manager.get_image(ProviderId(1), "image/gif");
    // Bounded window so each pull sees at most 16 bytes; the budget
    // then forces a yield between pulls
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0, 1], true))
        .with_window(16, 16);

    let mut status = manager.on_more_data(&image, &mut provider).unwrap();
    assert_eq!(status, LoadStatus::Yielded);
    let mut steps = 0;
    while status == LoadStatus::Yielded {
        let id = manager.take_pending().expect("yielded loader stays queued");
        assert_eq!(id, ProviderId(1));
        status = manager.on_more_data(&image, &mut provider).unwrap();
        steps += 1;
        assert!(steps < 100, "decode must make forward progress");
    }
    assert_eq!(status, LoadStatus::Finished);
    assert!(manager.take_pending().is_none());
    assert_eq!(image.frame_count(), 2);
}

#[test]
fn test_soft_policy_spares_loading_strict_does_not() {
    let bytes = gif_1x1(&[0], false);
    let partial = &bytes[..bytes.len() - 2];

    let mut soft = ImageManager::new(tiny_config(1));
    let image = soft.get_image(ProviderId(1), "image/gif");
    let mut provider = MemoryProvider::new(ProviderId(1), "image/gif");
    provider.append(partial);
    let status = soft.on_more_data(&image, &mut provider).unwrap();
    assert_eq!(status, LoadStatus::NeedMoreData);
    soft.free_memory();
    assert!(soft.used_mem() > 0, "soft policy keeps loading reps");

    let config = CacheConfig {
        policy: EvictionPolicy::Strict,
        ..tiny_config(1)
    };
    let mut strict = ImageManager::new(config);
    let image = strict.get_image(ProviderId(1), "image/gif");
    let mut provider = MemoryProvider::new(ProviderId(1), "image/gif");
    provider.append(partial);
    strict.on_more_data(&image, &mut provider).unwrap();
    strict.free_memory();
    assert_eq!(strict.used_mem(), 0, "strict policy evicts loading reps");
}

#[test]
fn test_predecoding_rep_is_evictable_under_soft() {
    let bytes = gif_1x1(&[0], false);
    let partial = &bytes[..bytes.len() - 2];

    let mut manager = ImageManager::new(tiny_config(1));
    let image = manager.get_image(ProviderId(1), "image/gif");
    assert!(manager.pre_decode(&image));
    let mut provider = MemoryProvider::new(ProviderId(1), "image/gif");
    provider.append(partial);
    manager.on_more_data(&image, &mut provider).unwrap();
    manager.free_memory();
    assert_eq!(manager.used_mem(), 0);
}

#[test]
fn test_oversized_header_rejected_before_decode() {
    let mut manager = ImageManager::new(CacheConfig::default());
    let image = manager.get_image(ProviderId(1), "image/gif");
    let listener = subscribe(&mut manager, &image, ListenerId(1));

    // 65535x65535 logical screen
    let header = [
        b'G', b'I', b'F', b'8', b'9', b'a', 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00,
    ];
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &header);
    let err = manager.on_more_data(&image, &mut provider).unwrap_err();
    assert!(matches!(err, ImageError::SizeRejected { .. }));
    assert!(err.is_oom());
    assert!(image.is_failed());
    assert!(image.is_oom());
    assert_eq!(manager.used_mem(), 0);
    assert_eq!(listener.errors.borrow().len(), 1);
}

#[test]
fn test_unrecognized_bytes_fail_with_fanout() {
    let mut manager = ImageManager::new(CacheConfig::default());
    let image = manager.get_image(ProviderId(1), "application/octet-stream");
    let listener = subscribe(&mut manager, &image, ListenerId(1));

    let mut provider =
        MemoryProvider::loaded(ProviderId(1), "application/octet-stream", b"this is not an image");
    let err = manager.on_more_data(&image, &mut provider).unwrap_err();
    assert_eq!(err, ImageError::TypeUnrecognized);
    assert!(image.is_failed());
    assert!(!image.is_oom());
    assert_eq!(listener.errors.borrow().as_slice(), &[ImageError::TypeUnrecognized]);
    // Failure is sticky until reset
    let err = manager.on_more_data(&image, &mut provider).unwrap_err();
    assert_eq!(err, ImageError::TypeUnrecognized);
}

#[test]
fn test_same_provider_id_maps_to_same_rep() {
    let mut manager = ImageManager::new(CacheConfig::default());
    let first = manager.get_image(ProviderId(7), "image/gif");
    let second = manager.get_image(ProviderId(7), "image/gif");
    assert!(first.ptr_eq(&second));
    let stats = manager.stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[test]
fn test_release_unreferenced_drops_orphans() {
    let mut manager = ImageManager::new(CacheConfig::default());
    let image = manager.get_image(ProviderId(1), "image/gif");
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();
    assert!(manager.used_mem() > 0);

    manager.release_unreferenced();
    assert_eq!(manager.stats().entries, 1, "live handle keeps the entry");

    drop(image);
    manager.release_unreferenced();
    let stats = manager.stats();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.used_mem, 0);
}

#[test]
fn test_synthetic_bitmap_image() {
    let mut manager = ImageManager::new(CacheConfig::default());
    let mut bitmap = pictor_raster::Bitmap::new(2, 1, false, true).unwrap();
    bitmap
        .set_line(0, &[10, 20, 30, 255, 40, 50, 60, 255])
        .unwrap();
    let image = manager.insert_bitmap_image(ProviderId(5), bitmap);

    assert_eq!((image.width(), image.height()), (2, 1));
    assert!(!image.is_failed());
    assert!(image.is_fully_decoded());
    let shared = image.bitmap().unwrap();
    assert_eq!(pixel(&shared), [10, 20, 30, 255]);
    assert_eq!(manager.used_mem(), 8);
}

#[test]
fn test_png_loads_through_buffered_decoder() {
    let mut bytes = Vec::new();
    {
        let mut encoder = png::Encoder::new(&mut bytes, 1, 1);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        let mut writer = encoder.write_header().unwrap();
        writer.write_image_data(&[7, 8, 9, 255]).unwrap();
    }

    let mut manager = ImageManager::new(CacheConfig::default());
    let image = manager.get_image(ProviderId(1), "image/png");
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/png", &bytes);
    let status = manager.on_more_data(&image, &mut provider).unwrap();
    assert_eq!(status, LoadStatus::Finished);
    assert_eq!((image.width(), image.height()), (1, 1));
    assert_eq!(image.frame_count(), 1);
    let bitmap = image.bitmap().unwrap();
    assert_eq!(pixel(&bitmap), [7, 8, 9, 255]);
}

#[test]
fn test_wall_clock_timeout_evicts_idle() {
    let config = CacheConfig {
        cache_timeout: Some(Duration::ZERO),
        grace_time: Duration::ZERO,
        ..CacheConfig::default()
    };
    let mut manager = ImageManager::new(config);
    let image = manager.get_image(ProviderId(1), "image/gif");
    let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &gif_1x1(&[0], false));
    manager.on_more_data(&image, &mut provider).unwrap();
    assert!(manager.used_mem() > 0, "under budget, nothing evicted yet");

    manager.run_timeout();
    assert_eq!(manager.used_mem(), 0);
    assert!(manager.stats().evictions >= 1);
}
