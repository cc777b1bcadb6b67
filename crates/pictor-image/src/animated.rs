//! Animated image content and frame compositing
//!
//! An animated content owns the ordered frame list and produces, per
//! independent viewer, the composited bitmap for whatever frame that
//! viewer is currently showing. Frames are only ever appended while
//! decoding; they are never compacted, because viewers advance at
//! their own pace and may lag arbitrarily far behind.

use crate::error::ImageError;
use crate::{ListenerId, SharedBitmap};
use pictor_codec::{DisposalMethod, FrameDescriptor};
use pictor_raster::{Bitmap, Palette, Rect};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// One animation frame: raw decoded pixels plus composition state
pub struct FrameElm {
    /// Raw decoded frame, sized to `rect`
    bitmap: SharedBitmap,
    /// Placement within the canvas
    rect: Rect,
    /// Display duration in centiseconds
    duration_cs: u32,
    /// Disposal after normalization (a RestorePrevious right after a
    /// clear-all boundary is demoted to RestoreBackground)
    disposal: DisposalMethod,
    dont_blend_prev: bool,
    /// The raw bitmap is the displayable composite; no buffer needed
    use_original: bool,
    /// After this frame's disposal the whole canvas is transparent
    clear_all: bool,
    /// Composite carries partial alpha
    combined_alpha: bool,
    /// Composite carries fully transparent pixels
    combined_transparent: bool,
    /// Nearest prior frame this one composites against; never crosses
    /// a clear-all boundary
    pred_combine: Option<usize>,
    /// Materialized composite, if any viewer needed one
    composite: Option<SharedBitmap>,
    /// Bytes held by the composite buffer
    mem_used: usize,
    /// Palette for indexed scanlines while this frame decodes
    palette: Option<Palette>,
    /// Scanlines arrive in interlaced order
    interlaced: bool,
}

impl FrameElm {
    pub fn rect(&self) -> Rect {
        self.rect
    }

    pub fn duration_cs(&self) -> u32 {
        self.duration_cs
    }

    pub fn disposal(&self) -> DisposalMethod {
        self.disposal
    }

    /// The raw decode target for this frame
    pub fn bitmap(&self) -> SharedBitmap {
        self.bitmap.clone()
    }

    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }
}

/// Per-viewer playback cursor
#[derive(Default)]
struct AnimationCursor {
    frame_nr: u32,
    loop_nr: u32,
    last_frame_painted: Option<u32>,
    /// Pins the displayed composite so it is not released mid-paint
    last_composite: Option<SharedBitmap>,
}

/// Multi-frame image content with per-viewer playback
pub struct AnimatedContent {
    width: u32,
    height: u32,
    frames: Vec<FrameElm>,
    /// 0 = loop forever, N = play N times
    repeat_count: u32,
    /// Decoding has finished; the frame list is final
    complete: bool,
    cursors: HashMap<ListenerId, AnimationCursor>,
    /// Keep unpinned composites for canvases up to this many pixels
    retain_below_px: u32,
}

impl AnimatedContent {
    /// Promote a static image: its canvas raster becomes frame 0.
    pub fn from_first_frame(
        width: u32,
        height: u32,
        bitmap: Bitmap,
        descriptor: &FrameDescriptor,
        retain_below_px: u32,
    ) -> Self {
        let mut content = Self {
            width,
            height,
            frames: Vec::new(),
            repeat_count: 0,
            complete: false,
            cursors: HashMap::new(),
            retain_below_px,
        };
        // Frame 0 was decoded into a canvas-sized raster already
        // composited over transparency, so it is its own display.
        let mut first = content.build_frame(
            Rc::new(RefCell::new(bitmap)),
            &FrameDescriptor { rect: Rect::of_size(width, height), ..descriptor.clone() },
        );
        first.use_original = true;
        content.frames.push(first);
        content
    }

    fn build_frame(&self, bitmap: SharedBitmap, descriptor: &FrameDescriptor) -> FrameElm {
        let index = self.frames.len();
        let pred_combine = self.pred_for(index);
        let mut disposal = descriptor.disposal;
        if disposal == DisposalMethod::RestorePrevious && pred_combine.is_none() {
            // Nothing meaningful to restore across a clear boundary
            disposal = DisposalMethod::RestoreBackground;
        }
        let covers = descriptor.rect.covers(self.width, self.height);
        let blends = descriptor.alpha || descriptor.transparent;
        FrameElm {
            bitmap,
            rect: descriptor.rect,
            duration_cs: descriptor.duration_cs,
            disposal,
            dont_blend_prev: descriptor.dont_blend_prev,
            use_original: covers
                && (descriptor.dont_blend_prev || !blends || pred_combine.is_none()),
            clear_all: disposal == DisposalMethod::RestoreBackground && covers,
            combined_alpha: descriptor.alpha,
            combined_transparent: descriptor.transparent,
            pred_combine,
            composite: None,
            mem_used: 0,
            palette: descriptor.palette.clone(),
            interlaced: descriptor.interlaced,
        }
    }

    /// Nearest prior frame a frame at `index` composites against.
    /// Walks past RestorePrevious frames (their contribution vanishes)
    /// and stops at clear-all boundaries.
    fn pred_for(&self, index: usize) -> Option<usize> {
        if index == 0 {
            return None;
        }
        let mut cur = index - 1;
        loop {
            let frame = &self.frames[cur];
            if frame.clear_all {
                return None;
            }
            if frame.disposal == DisposalMethod::RestorePrevious {
                match frame.pred_combine {
                    Some(p) => cur = p,
                    None => return None,
                }
            } else {
                return Some(cur);
            }
        }
    }

    /// Append a frame reported by the decoder. Allocates the raw
    /// decode target sized to the frame rect.
    pub fn append_frame(&mut self, descriptor: &FrameDescriptor) -> Result<(), ImageError> {
        let rect = descriptor.rect.clipped_to(self.width, self.height);
        if rect.width == 0 || rect.height == 0 {
            return Err(ImageError::MalformedData("frame outside the canvas".into()));
        }
        let bitmap = Bitmap::new(rect.width, rect.height, descriptor.transparent, true)?;
        let descriptor = FrameDescriptor { rect, ..descriptor.clone() };
        let frame = self.build_frame(Rc::new(RefCell::new(bitmap)), &descriptor);
        tracing::debug!(
            frame = self.frames.len(),
            pred = ?frame.pred_combine,
            use_original = frame.use_original,
            "append animation frame"
        );
        self.frames.push(frame);
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn frame_count(&self) -> u32 {
        self.frames.len() as u32
    }

    pub fn frame(&self, index: u32) -> Option<&FrameElm> {
        self.frames.get(index as usize)
    }

    /// The frame currently receiving decoded scanlines
    pub fn decoding_frame(&self) -> &FrameElm {
        self.frames.last().expect("animated content always has a frame")
    }

    pub fn repeat_count(&self) -> u32 {
        self.repeat_count
    }

    pub fn set_repeat_count(&mut self, repeat_count: u32) {
        self.repeat_count = repeat_count;
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
    }

    pub fn has_alpha(&self) -> bool {
        self.frames.iter().any(|f| f.combined_alpha)
    }

    pub fn is_transparent(&self) -> bool {
        self.frames.iter().any(|f| f.combined_transparent)
    }

    /// Bytes held by raw frames plus composites
    pub fn memory_used(&self) -> usize {
        let raw: usize = self.frames.iter().map(|f| f.bitmap.borrow().memory_used()).sum();
        raw + self.animation_memory_used()
    }

    /// Bytes held by composited buffers only
    pub fn animation_memory_used(&self) -> usize {
        self.frames.iter().map(|f| f.mem_used).sum()
    }

    /// Register a viewer; its cursor starts at frame 0, loop 0.
    pub fn add_listener(&mut self, listener: ListenerId) {
        self.cursors.entry(listener).or_default();
    }

    /// Drop a viewer's cursor and release whatever it pinned.
    pub fn remove_listener(&mut self, listener: ListenerId) {
        self.cursors.remove(&listener);
        self.release_unpinned();
    }

    /// The frame a viewer is currently on
    pub fn current_frame(&self, listener: ListenerId) -> u32 {
        self.cursors.get(&listener).map_or(0, |c| c.frame_nr)
    }

    /// Duration of the viewer's current frame, for scheduling the next
    /// `animate` call.
    pub fn current_duration_cs(&self, listener: ListenerId) -> u32 {
        let nr = self.current_frame(listener) as usize;
        self.frames.get(nr).map_or(0, |f| f.duration_cs)
    }

    /// Advance one viewer to its next frame. Returns false when the
    /// caller must not advance yet: the next frame is still being
    /// decoded (retry on the next decode notification), or the
    /// animation has played out its loop count.
    pub fn animate(&mut self, listener: ListenerId) -> bool {
        let frame_total = self.frames.len() as u32;
        let complete = self.complete;
        let repeat = self.repeat_count;
        let Some(cursor) = self.cursors.get_mut(&listener) else {
            return false;
        };
        let next = cursor.frame_nr + 1;
        if next < frame_total {
            cursor.frame_nr = next;
            return true;
        }
        if !complete {
            // Next frame's timing is not known yet
            return false;
        }
        if repeat == 0 || cursor.loop_nr + 1 < repeat {
            cursor.frame_nr = 0;
            cursor.loop_nr += 1;
            return true;
        }
        false
    }

    /// Composited bitmap for the viewer's current frame, pinning it as
    /// that viewer's displayed buffer.
    pub fn bitmap_for(&mut self, listener: ListenerId) -> Result<SharedBitmap, ImageError> {
        self.add_listener(listener);
        let target = {
            let cursor = &self.cursors[&listener];
            (cursor.frame_nr as usize).min(self.frames.len() - 1)
        };
        let composite = self.composite_for(target)?;
        let cursor = self.cursors.get_mut(&listener).expect("cursor just ensured");
        cursor.last_composite = Some(composite.clone());
        cursor.last_frame_painted = Some(target as u32);
        self.release_unpinned();
        Ok(composite)
    }

    /// Produce (and cache) the display composite for a frame.
    fn composite_for(&mut self, target: usize) -> Result<SharedBitmap, ImageError> {
        let frame = &self.frames[target];
        if frame.use_original {
            return Ok(frame.bitmap.clone());
        }
        if let Some(composite) = &frame.composite {
            return Ok(composite.clone());
        }

        // Walk back collecting frames whose composites are missing,
        // stopping at a materialized composite, a use-original frame,
        // or the clear-all boundary (no predecessor).
        let mut chain = vec![target];
        let mut base = None;
        let mut cur = target;
        while let Some(pred) = self.frames[cur].pred_combine {
            let p = &self.frames[pred];
            if p.composite.is_some() || p.use_original {
                base = Some(pred);
                break;
            }
            chain.push(pred);
            cur = pred;
        }

        // Seed the canvas from the stopping frame (or transparency)
        let mut canvas = Bitmap::new(self.width, self.height, true, true)?;
        if let Some(b) = base {
            let frame = &self.frames[b];
            match &frame.composite {
                Some(c) => {
                    canvas.overwrite_at(&c.borrow(), Rect::of_size(self.width, self.height))?
                }
                None => canvas.overwrite_at(&frame.bitmap.borrow(), frame.rect)?,
            }
            self.apply_post_disposal(&mut canvas, b)?;
        }

        // Replay forward, materializing each missing composite
        for &index in chain.iter().rev() {
            let frame = &self.frames[index];
            let raw = frame.bitmap.borrow();
            if frame.dont_blend_prev {
                canvas.overwrite_at(&raw, frame.rect)?;
            } else {
                canvas.blend_at(&raw, frame.rect)?;
            }
            drop(raw);
            let snapshot = Rc::new(RefCell::new(canvas.clone()));
            let frame = &mut self.frames[index];
            frame.mem_used = snapshot.borrow().memory_used();
            frame.composite = Some(snapshot);
            if index != target {
                self.apply_post_disposal(&mut canvas, index)?;
            }
        }

        let result = self.frames[target]
            .composite
            .clone()
            .expect("target composite just materialized");
        Ok(result)
    }

    /// Disposal applied to the composite after a frame was shown,
    /// before its successor draws.
    fn apply_post_disposal(&self, canvas: &mut Bitmap, index: usize) -> Result<(), ImageError> {
        let frame = &self.frames[index];
        if frame.disposal == DisposalMethod::RestoreBackground {
            canvas.clear_rect(frame.rect)?;
        }
        Ok(())
    }

    /// Free composited buffers no viewer is displaying, unless the
    /// retention policy keeps them (small canvas, or an animation that
    /// plays exactly once and will not revisit frames).
    pub fn release_unpinned(&mut self) -> usize {
        if self.width.saturating_mul(self.height) <= self.retain_below_px
            || self.repeat_count == 1
        {
            return 0;
        }
        let mut freed = 0;
        for frame in &mut self.frames {
            let unpinned = frame
                .composite
                .as_ref()
                .is_some_and(|c| Rc::strong_count(c) == 1);
            if unpinned {
                frame.composite = None;
                freed += frame.mem_used;
                frame.mem_used = 0;
            }
        }
        freed
    }

    /// Drop every composited buffer regardless of pins; viewers keep
    /// their own pinned copies alive until they repaint.
    pub fn release_all_composites(&mut self) -> usize {
        let mut freed = 0;
        for frame in &mut self.frames {
            if frame.composite.take().is_some() {
                freed += frame.mem_used;
                frame.mem_used = 0;
            }
        }
        freed
    }
}
