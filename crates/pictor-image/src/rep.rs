//! Image rep: the cache entry
//!
//! One rep exists per content-provider identity and is the single
//! point of truth an `Image` handle refers to. It owns the content,
//! the in-flight loader, the failure flags and the visibility/lock
//! bookkeeping the cache evictor consults.

use crate::config::EvictionPolicy;
use crate::content::{ContentKind, ImgContent};
use crate::error::ImageError;
use crate::loader::ImageLoader;
use crate::provider::ProviderId;
use crate::ListenerId;
use pictor_codec::ImageFormat;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Visibility subscriber: notified of decode progress and failures.
/// Held weakly, so a listener dropping its handle never leaks the rep.
pub trait ImageListener {
    /// More of the image decoded; repaint incrementally if desired.
    fn on_portion_decoded(&self) {}

    /// The load failed. Reported once per failure.
    fn on_error(&self, _error: &ImageError) {}
}

/// Load-state flags of a rep
#[derive(Debug, Clone, Copy, Default)]
pub struct RepFlags {
    pub loaded: bool,
    pub type_known: bool,
    pub oom: bool,
    pub type_failed: bool,
    pub size_failed: bool,
    pub loading_failed: bool,
    /// Synthetic image supplied as a finished bitmap
    pub synthetic: bool,
    /// Every byte of the resource has arrived
    pub data_loaded: bool,
    /// Being decoded speculatively; evictable at any time
    pub predecoding: bool,
}

/// The cache entry for one image source
pub struct ImageRep {
    provider_id: ProviderId,
    content_type: String,
    format: Option<ImageFormat>,
    content: ImgContent,
    loader: Option<ImageLoader>,
    listeners: Vec<(ListenerId, Weak<dyn ImageListener>)>,
    lock_count: u32,
    /// Bytes currently charged to the manager for this rep
    mem_used: usize,
    /// Subset of `mem_used` held by animation composites
    anim_used: usize,
    last_used: Instant,
    /// Exempt from eviction until this instant
    grace_until: Option<Instant>,
    /// Became invisible inside a locked span; grace starts at unlock
    grace_pending: bool,
    flags: RepFlags,
    error: Option<ImageError>,
}

impl ImageRep {
    pub fn new(provider_id: ProviderId, content_type: &str) -> Self {
        Self {
            provider_id,
            content_type: content_type.to_string(),
            format: None,
            content: ImgContent::Null,
            loader: None,
            listeners: Vec::new(),
            lock_count: 0,
            mem_used: 0,
            anim_used: 0,
            last_used: Instant::now(),
            grace_until: None,
            grace_pending: false,
            flags: RepFlags::default(),
            error: None,
        }
    }

    /// Rep for an externally supplied raster
    pub fn synthetic(provider_id: ProviderId, content: ImgContent) -> Self {
        let mut rep = Self::new(provider_id, "");
        rep.mem_used = content.memory_used();
        rep.content = content;
        rep.flags.synthetic = true;
        rep.flags.loaded = true;
        rep.flags.type_known = true;
        rep
    }

    pub fn provider_id(&self) -> ProviderId {
        self.provider_id
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn format(&self) -> Option<ImageFormat> {
        self.format
    }

    pub fn content(&self) -> &ImgContent {
        &self.content
    }

    pub fn content_mut(&mut self) -> &mut ImgContent {
        &mut self.content
    }

    pub fn flags(&self) -> RepFlags {
        self.flags
    }

    pub fn error(&self) -> Option<&ImageError> {
        self.error.as_ref()
    }

    /// Any terminal failure state
    pub fn is_failed(&self) -> bool {
        self.flags.oom
            || self.flags.type_failed
            || self.flags.size_failed
            || self.flags.loading_failed
    }

    pub fn is_oom(&self) -> bool {
        self.flags.oom
    }

    pub fn is_visible(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn mem_used(&self) -> usize {
        self.mem_used
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_used = now;
    }

    pub(crate) fn set_grace_until(&mut self, until: Option<Instant>) {
        self.grace_until = until;
    }

    pub(crate) fn set_grace_pending(&mut self, pending: bool) {
        self.grace_pending = pending;
    }

    pub(crate) fn grace_pending(&self) -> bool {
        self.grace_pending
    }

    pub(crate) fn grace_deadline(&self) -> Option<Instant> {
        self.grace_until
    }

    pub fn in_grace(&self, now: Instant) -> bool {
        self.grace_pending || self.grace_until.is_some_and(|until| until > now)
    }

    pub(crate) fn loader_mut(&mut self) -> &mut Option<ImageLoader> {
        &mut self.loader
    }

    pub(crate) fn take_loader(&mut self) -> Option<ImageLoader> {
        self.loader.take()
    }

    pub(crate) fn set_loader(&mut self, loader: ImageLoader) {
        self.flags.type_known = true;
        self.format = Some(loader.format());
        self.loader = Some(loader);
    }

    pub fn is_loading(&self) -> bool {
        self.loader.is_some()
    }

    pub fn set_predecoding(&mut self, on: bool) {
        self.flags.predecoding = on;
    }

    pub fn set_data_loaded(&mut self) {
        self.flags.data_loaded = true;
    }

    /// Subscribe a visibility listener. Returns true when this was the
    /// first listener (the rep just became visible).
    pub fn add_listener(&mut self, id: ListenerId, listener: Weak<dyn ImageListener>) -> bool {
        let was_visible = self.is_visible();
        if !self.listeners.iter().any(|(lid, _)| *lid == id) {
            self.listeners.push((id, listener));
        }
        if let Some(animated) = self.content.as_animated_mut() {
            animated.add_listener(id);
        }
        !was_visible
    }

    /// Unsubscribe. Returns true when the last listener just left.
    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners.retain(|(lid, _)| *lid != id);
        if let Some(animated) = self.content.as_animated_mut() {
            animated.remove_listener(id);
        }
        !self.is_visible()
    }

    /// Live listener callbacks, for a fan-out outside the rep borrow
    pub fn collect_listeners(&mut self) -> Vec<Rc<dyn ImageListener>> {
        self.listeners.retain(|(_, weak)| weak.strong_count() > 0);
        self.listeners.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    /// Bracket raw pixel access; eviction is deferred while locked.
    pub fn inc_lock(&mut self) {
        self.lock_count += 1;
    }

    /// Returns true when the lock count just reached zero.
    pub fn dec_lock(&mut self) -> bool {
        self.lock_count = self.lock_count.saturating_sub(1);
        self.lock_count == 0
    }

    pub fn mark_loaded(&mut self) {
        self.flags.loaded = true;
        self.loader = None;
    }

    /// Record a terminal failure and drop the loader. The caller fans
    /// the error out to listeners.
    pub fn record_failure(&mut self, error: ImageError) {
        match &error {
            ImageError::OutOfMemory => self.flags.oom = true,
            ImageError::TypeUnrecognized => self.flags.type_failed = true,
            ImageError::SizeUnknown | ImageError::SizeRejected { .. } => {
                self.flags.size_failed = true
            }
            ImageError::MalformedData(_) => self.flags.loading_failed = true,
        }
        tracing::warn!(provider = self.provider_id.0, %error, "image load failed");
        self.error = Some(error);
        self.loader = None;
    }

    /// Bring charged memory in line with what the content holds.
    /// Returns `(total delta, animation delta)` for the manager.
    pub fn sync_mem(&mut self) -> (isize, isize) {
        let new_total = self.content.memory_used();
        let new_anim = self.content.animation_memory_used();
        let delta = new_total as isize - self.mem_used as isize;
        let anim_delta = new_anim as isize - self.anim_used as isize;
        self.mem_used = new_total;
        self.anim_used = new_anim;
        (delta, anim_delta)
    }

    pub fn anim_used(&self) -> usize {
        self.anim_used
    }

    /// May the evictor clear this rep right now?
    pub fn evictable(&self, policy: EvictionPolicy, now: Instant) -> bool {
        if self.lock_count > 0 || self.is_visible() || self.in_grace(now) {
            return false;
        }
        match policy {
            // Soft spares reps with a real load in flight; speculative
            // decodes are fair game
            EvictionPolicy::Soft => !self.is_loading() || self.flags.predecoding,
            EvictionPolicy::Strict => true,
        }
    }

    /// Release all pixel memory, keeping dimension knowledge. Returns
    /// the bytes freed; calling it again is a no-op.
    pub fn clear(&mut self) -> usize {
        let freed = self.mem_used;
        self.content.clear();
        self.loader = None;
        self.mem_used = 0;
        self.anim_used = 0;
        self.flags.loaded = false;
        self.flags.predecoding = false;
        freed
    }

    /// `clear` plus a clean slate for a retry: failure flags drop too.
    pub fn reset(&mut self) -> usize {
        let freed = self.clear();
        self.flags.oom = false;
        self.flags.type_failed = false;
        self.flags.size_failed = false;
        self.flags.loading_failed = false;
        self.error = None;
        freed
    }
}

/// Ref-counted handle to a cached image. Cloning is cheap; the rep
/// stays registered while any handle (or the cache itself) holds it.
#[derive(Clone)]
pub struct Image {
    rep: Rc<RefCell<ImageRep>>,
}

impl Image {
    pub(crate) fn from_rep(rep: Rc<RefCell<ImageRep>>) -> Self {
        Self { rep }
    }

    pub(crate) fn rep(&self) -> &Rc<RefCell<ImageRep>> {
        &self.rep
    }

    pub fn provider_id(&self) -> ProviderId {
        self.rep.borrow().provider_id()
    }

    pub fn width(&self) -> u32 {
        self.rep.borrow().content().width()
    }

    pub fn height(&self) -> u32 {
        self.rep.borrow().content().height()
    }

    pub fn frame_count(&self) -> u32 {
        self.rep.borrow().content().frame_count()
    }

    pub fn content_kind(&self) -> ContentKind {
        self.rep.borrow().content().kind()
    }

    pub fn is_transparent(&self) -> bool {
        self.rep.borrow().content().is_transparent()
    }

    pub fn has_alpha(&self) -> bool {
        self.rep.borrow().content().has_alpha()
    }

    pub fn is_failed(&self) -> bool {
        self.rep.borrow().is_failed()
    }

    pub fn is_oom(&self) -> bool {
        self.rep.borrow().is_oom()
    }

    pub fn is_fully_decoded(&self) -> bool {
        self.rep.borrow().content().is_fully_decoded()
    }

    pub fn last_decoded_line(&self) -> Option<u32> {
        self.rep.borrow().content().last_decoded_line()
    }

    pub fn last_error(&self) -> Option<ImageError> {
        self.rep.borrow().error().cloned()
    }

    /// The displayable raster for non-animated content. Animated
    /// images go through `ImageManager::frame_bitmap`.
    pub fn bitmap(&self) -> Option<crate::SharedBitmap> {
        self.rep.borrow().content().bitmap()
    }

    /// Handles are the same when they refer to the same rep
    pub fn ptr_eq(&self, other: &Image) -> bool {
        Rc::ptr_eq(&self.rep, &other.rep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_is_idempotent() {
        let mut rep = ImageRep::new(ProviderId(1), "image/gif");
        rep.content_mut().set_dimensions(2, 2);
        rep.content_mut()
            .start_first_frame(&pictor_codec::FrameDescriptor {
                rect: pictor_raster::Rect::of_size(2, 2),
                ..Default::default()
            })
            .unwrap();
        let (delta, _) = rep.sync_mem();
        assert!(delta > 0);
        let freed_first = rep.clear();
        assert_eq!(freed_first as isize, delta);
        let freed_second = rep.clear();
        assert_eq!(freed_second, 0);
    }

    #[test]
    fn test_failure_flags() {
        let mut rep = ImageRep::new(ProviderId(1), "");
        assert!(!rep.is_failed());
        rep.record_failure(ImageError::OutOfMemory);
        assert!(rep.is_failed());
        assert!(rep.is_oom());
        rep.reset();
        assert!(!rep.is_failed());
        rep.record_failure(ImageError::MalformedData("bad".into()));
        assert!(rep.is_failed());
        assert!(!rep.is_oom());
    }

    #[test]
    fn test_visibility_counting() {
        struct Quiet;
        impl ImageListener for Quiet {}
        let mut rep = ImageRep::new(ProviderId(1), "");
        let listener: Rc<dyn ImageListener> = Rc::new(Quiet);
        assert!(rep.add_listener(ListenerId(1), Rc::downgrade(&listener)));
        assert!(!rep.add_listener(ListenerId(2), Rc::downgrade(&listener)));
        assert!(!rep.remove_listener(ListenerId(1)));
        assert!(rep.remove_listener(ListenerId(2)));
        assert!(!rep.is_visible());
    }

    #[test]
    fn test_lock_blocks_eviction() {
        let now = Instant::now();
        let mut rep = ImageRep::new(ProviderId(1), "");
        assert!(rep.evictable(EvictionPolicy::Soft, now));
        rep.inc_lock();
        assert!(!rep.evictable(EvictionPolicy::Soft, now));
        assert!(!rep.evictable(EvictionPolicy::Strict, now));
        assert!(rep.dec_lock());
        assert!(rep.evictable(EvictionPolicy::Soft, now));
    }
}
