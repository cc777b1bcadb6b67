//! Image cache manager
//!
//! Owns every rep, charges decoded pixel memory against a byte
//! budget, and evicts least-recently-used invisible reps when the
//! budget is exceeded. All scheduling is cooperative and
//! single-threaded: loaders that yield are queued on a pending list
//! the embedder pumps with [`ImageManager::take_pending`] followed by
//! [`ImageManager::on_more_data`].

use crate::color::ColorManager;
use crate::config::{CacheConfig, EvictionPolicy};
use crate::content::{BitmapContent, Effect, ImgContent};
use crate::error::ImageError;
use crate::loader::{ImageLoader, LoadStatus};
use crate::provider::{ContentProvider, ProviderId};
use crate::rep::{Image, ImageListener, ImageRep};
use crate::{ListenerId, SharedBitmap};
use pictor_codec::registry::{DecoderRegistry, TypeCheck};
use pictor_codec::SizeCheck;
use pictor_raster::Bitmap;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};
use std::time::Instant;

/// Cache counters, for diagnostics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub used_mem: usize,
    pub anim_mem: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// The image cache. One instance per browsing context group; never
/// shared across threads.
pub struct ImageManager {
    registry: DecoderRegistry,
    color_manager: Option<Rc<dyn ColorManager>>,
    config: CacheConfig,
    reps: HashMap<ProviderId, Rc<RefCell<ImageRep>>>,
    /// Invisible reps in recency order, oldest first
    lru: Vec<ProviderId>,
    used_mem: usize,
    anim_mem: usize,
    /// Raw-pixel-access depth; eviction is deferred while nonzero
    lock_depth: u32,
    /// Set when a free was requested inside a locked span
    suppressed_free: bool,
    /// Grace-suspension depth; grace windows are stamped at exit
    grace_depth: u32,
    /// Loaders that yielded mid-decode, waiting for another step
    pending: VecDeque<ProviderId>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ImageManager {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            registry: DecoderRegistry::with_builtin(),
            color_manager: None,
            config,
            reps: HashMap::new(),
            lru: Vec::new(),
            used_mem: 0,
            anim_mem: 0,
            lock_depth: 0,
            suppressed_free: false,
            grace_depth: 0,
            pending: VecDeque::new(),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn with_color_manager(mut self, color_manager: Rc<dyn ColorManager>) -> Self {
        self.color_manager = Some(color_manager);
        self
    }

    pub fn registry_mut(&mut self) -> &mut DecoderRegistry {
        &mut self.registry
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Retarget the budget and policy at runtime; shrinking triggers
    /// an immediate eviction pass.
    pub fn set_cache_size(&mut self, cache_size: usize, policy: EvictionPolicy) {
        self.config.cache_size = cache_size;
        self.config.policy = policy;
        self.free_memory();
    }

    pub fn used_mem(&self) -> usize {
        self.used_mem
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.reps.len(),
            used_mem: self.used_mem,
            anim_mem: self.anim_mem,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }

    /// Handle for the image identified by `provider_id`. The same id
    /// always maps to the same rep while any handle is alive.
    pub fn get_image(&mut self, provider_id: ProviderId, content_type: &str) -> Image {
        if let Some(rep) = self.reps.get(&provider_id) {
            self.hits += 1;
            rep.borrow_mut().touch(Instant::now());
            return Image::from_rep(Rc::clone(rep));
        }
        self.misses += 1;
        let rep = Rc::new(RefCell::new(ImageRep::new(provider_id, content_type)));
        self.reps.insert(provider_id, Rc::clone(&rep));
        self.lru.push(provider_id);
        Image::from_rep(rep)
    }

    /// Register an externally produced raster under an id, bypassing
    /// the decode pipeline.
    pub fn insert_bitmap_image(&mut self, provider_id: ProviderId, bitmap: Bitmap) -> Image {
        let content = ImgContent::Bitmap(BitmapContent::new(bitmap));
        let rep = Rc::new(RefCell::new(ImageRep::synthetic(provider_id, content)));
        self.used_mem += rep.borrow().mem_used();
        self.reps.insert(provider_id, Rc::clone(&rep));
        self.lru.push(provider_id);
        self.check_budget();
        Image::from_rep(rep)
    }

    /// A viewer started showing the image. The rep becomes exempt from
    /// eviction and, if its data is still streaming, its loader is
    /// queued for a decode step.
    pub fn inc_visible(
        &mut self,
        image: &Image,
        listener_id: ListenerId,
        listener: Weak<dyn ImageListener>,
    ) {
        let provider_id;
        let became_visible;
        let wants_step;
        {
            let mut rep = image.rep().borrow_mut();
            provider_id = rep.provider_id();
            became_visible = rep.add_listener(listener_id, listener);
            if became_visible {
                rep.set_grace_until(None);
                rep.set_grace_pending(false);
                rep.set_predecoding(false);
            }
            wants_step = rep.is_loading();
        }
        if became_visible {
            self.lru.retain(|id| *id != provider_id);
            if wants_step {
                self.enqueue(provider_id);
            }
        }
    }

    /// The viewer went away. When it was the last one the rep enters
    /// its grace window (deferred to unlock inside locked or
    /// grace-suspended spans) and rejoins the eviction order.
    pub fn dec_visible(&mut self, image: &Image, listener_id: ListenerId) {
        let now = Instant::now();
        let provider_id;
        let became_invisible;
        {
            let mut rep = image.rep().borrow_mut();
            provider_id = rep.provider_id();
            became_invisible = rep.remove_listener(listener_id);
            if became_invisible {
                rep.touch(now);
                if self.lock_depth > 0 || self.grace_depth > 0 {
                    rep.set_grace_pending(true);
                } else {
                    rep.set_grace_until(Some(now + self.config.grace_time));
                }
            }
        }
        if became_invisible {
            self.lru.retain(|id| *id != provider_id);
            self.lru.push(provider_id);
            self.check_budget();
        }
    }

    /// Start decoding an off-screen image speculatively. Does nothing
    /// when predecoding is disabled, the image already has pixels, or
    /// cache headroom is below the configured fraction.
    pub fn pre_decode(&mut self, image: &Image) -> bool {
        if !self.config.predecode {
            return false;
        }
        let free = self.config.cache_size.saturating_sub(self.used_mem);
        let need = (self.config.cache_size as f32 * self.config.predecode_headroom) as usize;
        if free < need {
            return false;
        }
        let (provider_id, resume) = {
            let mut rep = image.rep().borrow_mut();
            if rep.is_failed() || rep.is_visible() || rep.content().is_fully_decoded() {
                return false;
            }
            rep.set_predecoding(true);
            (rep.provider_id(), rep.is_loading())
        };
        if resume {
            self.enqueue(provider_id);
        }
        true
    }

    /// Feed newly arrived bytes (or an end-of-stream signal) into the
    /// image's loader. Creates the loader lazily once enough bytes
    /// exist to identify the format.
    pub fn on_more_data(
        &mut self,
        image: &Image,
        provider: &mut dyn ContentProvider,
    ) -> Result<LoadStatus, ImageError> {
        let rep_rc = Rc::clone(image.rep());
        {
            let mut rep = rep_rc.borrow_mut();
            if rep.is_failed() {
                return Err(rep
                    .error()
                    .cloned()
                    .unwrap_or(ImageError::MalformedData("load already failed".into())));
            }
            if provider.is_loaded() {
                rep.set_data_loaded();
            }
            if rep.content().is_fully_decoded() && !rep.is_loading() {
                return Ok(LoadStatus::Finished);
            }
            if !rep.is_loading() {
                let (bytes, _) = provider.data();
                if let TypeCheck::Maybe = self.registry.check_type(bytes) {
                    if !provider.is_loaded() {
                        return Ok(LoadStatus::NeedMoreData);
                    }
                }
                // Header-peek fast path: throw out absurd dimensions
                // before any decoder state is allocated
                if let SizeCheck::Rejected(width, height) = self.registry.check_size(bytes) {
                    let err = ImageError::SizeRejected { width, height };
                    drop(rep);
                    self.fail(&rep_rc, err.clone());
                    return Err(err);
                }
                match ImageLoader::new(
                    &self.registry,
                    provider.content_type(),
                    bytes,
                    self.config.premultiply_alpha,
                    self.config.retain_composite_below_px,
                    self.color_manager.clone(),
                ) {
                    Ok(loader) => rep.set_loader(loader),
                    Err(err) => {
                        drop(rep);
                        self.fail(&rep_rc, err.clone());
                        return Err(err);
                    }
                }
            }
        }

        let mut loader = match rep_rc.borrow_mut().take_loader() {
            Some(loader) => loader,
            None => return Ok(LoadStatus::Finished),
        };
        let result = {
            let mut rep = rep_rc.borrow_mut();
            loader.on_more_data(provider, rep.content_mut(), self.config.decode_step_bytes)
        };
        match result {
            Ok(progress) => {
                {
                    let mut rep = rep_rc.borrow_mut();
                    match progress.status {
                        LoadStatus::Finished => rep.mark_loaded(),
                        LoadStatus::NeedMoreData => *rep.loader_mut() = Some(loader),
                        LoadStatus::Yielded => *rep.loader_mut() = Some(loader),
                    }
                }
                if progress.status == LoadStatus::Yielded {
                    let id = rep_rc.borrow().provider_id();
                    self.enqueue(id);
                }
                self.charge(&rep_rc);
                if progress.decoded_anything {
                    let listeners = rep_rc.borrow_mut().collect_listeners();
                    for listener in listeners {
                        listener.on_portion_decoded();
                    }
                }
                Ok(progress.status)
            }
            Err(err) => {
                self.fail(&rep_rc, err.clone());
                Err(err)
            }
        }
    }

    /// One queued cooperative decode step. Returns the id whose loader
    /// still wants the provider's bytes, for the embedder to resupply
    /// via [`Self::on_more_data`]. Queue order is FIFO.
    pub fn take_pending(&mut self) -> Option<ProviderId> {
        while let Some(id) = self.pending.pop_front() {
            if let Some(rep) = self.reps.get(&id) {
                if rep.borrow().is_loading() {
                    return Some(id);
                }
            }
        }
        None
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Advance one viewer's animation clock. Returns true when the
    /// displayed frame changed.
    pub fn animate(&mut self, image: &Image, listener_id: ListenerId) -> bool {
        let rep_rc = Rc::clone(image.rep());
        let advanced = {
            let mut rep = rep_rc.borrow_mut();
            match rep.content_mut().as_animated_mut() {
                Some(animated) => {
                    // The content may have turned animated after the
                    // viewer subscribed
                    animated.add_listener(listener_id);
                    animated.animate(listener_id)
                }
                None => false,
            }
        };
        if advanced {
            self.charge(&rep_rc);
        }
        advanced
    }

    /// Composited bitmap for the viewer's current animation frame.
    /// Non-animated content falls back to its single raster.
    pub fn frame_bitmap(
        &mut self,
        image: &Image,
        listener_id: ListenerId,
    ) -> Result<SharedBitmap, ImageError> {
        let rep_rc = Rc::clone(image.rep());
        let result = {
            let mut rep = rep_rc.borrow_mut();
            match rep.content_mut().as_animated_mut() {
                Some(animated) => animated.bitmap_for(listener_id),
                None => rep.content().bitmap().ok_or(ImageError::SizeUnknown),
            }
        };
        self.charge(&rep_rc);
        self.check_anim_budget();
        result
    }

    /// Raster tiled up to at least `width` x `height`, cached on the rep
    pub fn tile_bitmap(
        &mut self,
        image: &Image,
        width: u32,
        height: u32,
    ) -> Result<SharedBitmap, ImageError> {
        let rep_rc = Rc::clone(image.rep());
        let result = rep_rc.borrow_mut().content_mut().tile_bitmap(width, height);
        self.charge(&rep_rc);
        result
    }

    /// Raster with a paint effect applied, cached on the rep
    pub fn effect_bitmap(
        &mut self,
        image: &Image,
        effect: Effect,
    ) -> Result<SharedBitmap, ImageError> {
        let rep_rc = Rc::clone(image.rep());
        let result = rep_rc.borrow_mut().content_mut().effect_bitmap(effect);
        self.charge(&rep_rc);
        result
    }

    /// Enter a raw-pixel-access span. While any lock is held nothing
    /// is evicted; frees requested meanwhile run at the final unlock.
    pub fn lock_cache(&mut self) {
        self.lock_depth += 1;
    }

    pub fn unlock_cache(&mut self) {
        debug_assert!(self.lock_depth > 0);
        self.lock_depth = self.lock_depth.saturating_sub(1);
        if self.lock_depth > 0 {
            return;
        }
        self.stamp_pending_grace();
        if self.suppressed_free {
            self.suppressed_free = false;
            self.free_memory();
        }
    }

    /// Pin one image's pixels irrespective of cache-wide locks
    pub fn inc_lock(&mut self, image: &Image) {
        image.rep().borrow_mut().inc_lock();
    }

    pub fn dec_lock(&mut self, image: &Image) {
        let unlocked = image.rep().borrow_mut().dec_lock();
        if unlocked {
            self.check_budget();
        }
    }

    /// Suspend grace-window stamping, e.g. across a page teardown
    /// where visibility flaps should not grant every image a fresh
    /// grace period.
    pub fn begin_grace(&mut self) {
        self.grace_depth += 1;
    }

    pub fn end_grace(&mut self) {
        debug_assert!(self.grace_depth > 0);
        self.grace_depth = self.grace_depth.saturating_sub(1);
        if self.grace_depth == 0 && self.lock_depth == 0 {
            self.stamp_pending_grace();
        }
    }

    /// Earliest instant at which a timed action (grace expiry or
    /// wall-clock timeout) becomes due. The embedder arms a timer for
    /// it and calls [`Self::run_timeout`] when it fires.
    pub fn next_timeout(&self) -> Option<Instant> {
        let now = Instant::now();
        let mut earliest: Option<Instant> = None;
        let mut consider = |t: Instant| {
            earliest = Some(match earliest {
                Some(e) if e <= t => e,
                _ => t,
            });
        };
        for rep in self.reps.values() {
            let rep = rep.borrow();
            if rep.is_visible() || rep.lock_count() > 0 {
                continue;
            }
            if rep.in_grace(now) && self.used_mem > self.config.cache_size {
                // Grace expiry only matters while over budget
                if let Some(deadline) = rep.grace_deadline() {
                    consider(deadline);
                }
            }
            if let Some(timeout) = self.config.cache_timeout {
                if rep.mem_used() > 0 {
                    consider(rep.last_used() + timeout);
                }
            }
        }
        earliest
    }

    /// Evict reps whose wall-clock timeout elapsed, then retry any
    /// over-budget free that grace windows blocked earlier.
    pub fn run_timeout(&mut self) {
        let now = Instant::now();
        if let Some(timeout) = self.config.cache_timeout {
            let expired: Vec<ProviderId> = self
                .lru
                .iter()
                .copied()
                .filter(|id| {
                    self.reps.get(id).is_some_and(|rep| {
                        let rep = rep.borrow();
                        rep.mem_used() > 0
                            && now.duration_since(rep.last_used()) >= timeout
                            && rep.evictable(self.config.policy, now)
                    })
                })
                .collect();
            for id in expired {
                self.evict(id);
            }
        }
        self.check_budget();
    }

    /// Drop map entries nothing outside the cache refers to any more
    pub fn release_unreferenced(&mut self) {
        let mut dropped: Vec<ProviderId> = Vec::new();
        self.reps.retain(|id, rep| {
            let keep = Rc::strong_count(rep) > 1
                || rep.borrow().is_visible()
                || rep.borrow().lock_count() > 0;
            if !keep {
                dropped.push(*id);
            }
            keep
        });
        for id in &dropped {
            self.lru.retain(|lid| lid != id);
        }
        // Dropped reps took their pixels with them
        self.recount();
    }

    /// Evict until the budget holds, oldest invisible rep first.
    /// Deferred when any cache lock is held.
    pub fn free_memory(&mut self) {
        if self.lock_depth > 0 {
            self.suppressed_free = true;
            return;
        }
        let now = Instant::now();
        let order: Vec<ProviderId> = self.lru.clone();
        for id in order {
            if self.used_mem <= self.config.cache_size {
                break;
            }
            let evictable = self
                .reps
                .get(&id)
                .is_some_and(|rep| rep.borrow().evictable(self.config.policy, now));
            if evictable {
                self.evict(id);
            }
        }
        if self.used_mem > self.config.cache_size {
            tracing::debug!(
                used = self.used_mem,
                budget = self.config.cache_size,
                "cache still over budget after eviction pass"
            );
        }
    }

    fn check_budget(&mut self) {
        if self.used_mem > self.config.cache_size {
            self.free_memory();
        }
    }

    /// Enforce the separate animation-composite budget: drop unpinned
    /// composites everywhere, then all composites on invisible reps.
    fn check_anim_budget(&mut self) {
        let Some(budget) = self.config.animation_cache_size else {
            return;
        };
        if self.anim_mem <= budget {
            return;
        }
        let ids: Vec<ProviderId> = self.reps.keys().copied().collect();
        for id in &ids {
            if self.anim_mem <= budget {
                return;
            }
            if let Some(rep_rc) = self.reps.get(id).cloned() {
                if let Some(animated) = rep_rc.borrow_mut().content_mut().as_animated_mut() {
                    animated.release_unpinned();
                }
                self.charge(&rep_rc);
            }
        }
        for id in &ids {
            if self.anim_mem <= budget {
                return;
            }
            if let Some(rep_rc) = self.reps.get(id).cloned() {
                {
                    let mut rep = rep_rc.borrow_mut();
                    if rep.is_visible() {
                        continue;
                    }
                    if let Some(animated) = rep.content_mut().as_animated_mut() {
                        animated.release_all_composites();
                    }
                }
                self.charge(&rep_rc);
            }
        }
    }

    fn evict(&mut self, id: ProviderId) {
        let Some(rep_rc) = self.reps.get(&id).cloned() else {
            return;
        };
        let mut rep = rep_rc.borrow_mut();
        let anim = rep.anim_used();
        let freed = rep.clear();
        if freed > 0 {
            self.used_mem = self.used_mem.saturating_sub(freed);
            self.anim_mem = self.anim_mem.saturating_sub(anim);
            self.evictions += 1;
            tracing::debug!(provider = id.0, freed, "evicted image");
        }
    }

    /// Re-sync one rep's charged memory after a content mutation
    fn charge(&mut self, rep_rc: &Rc<RefCell<ImageRep>>) {
        let (delta, anim_delta) = rep_rc.borrow_mut().sync_mem();
        self.apply_delta(delta, anim_delta);
        if delta > 0 {
            self.check_budget();
        }
    }

    fn apply_delta(&mut self, delta: isize, anim_delta: isize) {
        self.used_mem = (self.used_mem as isize + delta).max(0) as usize;
        self.anim_mem = (self.anim_mem as isize + anim_delta).max(0) as usize;
    }

    fn recount(&mut self) {
        self.used_mem = self.reps.values().map(|rep| rep.borrow().mem_used()).sum();
        self.anim_mem = self.reps.values().map(|rep| rep.borrow().anim_used()).sum();
    }

    fn stamp_pending_grace(&mut self) {
        let until = Instant::now() + self.config.grace_time;
        for rep in self.reps.values() {
            let mut rep = rep.borrow_mut();
            if rep.grace_pending() {
                rep.set_grace_pending(false);
                rep.set_grace_until(Some(until));
            }
        }
    }

    fn enqueue(&mut self, id: ProviderId) {
        if !self.pending.contains(&id) {
            self.pending.push_back(id);
        }
    }

    /// Record a terminal failure and notify listeners. The borrow is
    /// released before the fan-out so callbacks can query the image.
    fn fail(&mut self, rep_rc: &Rc<RefCell<ImageRep>>, err: ImageError) {
        let listeners = {
            let mut rep = rep_rc.borrow_mut();
            rep.record_failure(err.clone());
            rep.collect_listeners()
        };
        self.charge(rep_rc);
        for listener in listeners {
            listener.on_error(&err);
        }
    }
}
