//! Decoded image content variants
//!
//! Content climbs a one-way ladder while decoding: `Null` (nothing
//! known) → `Empty` (dimensions known) → `Static` (first frame raster)
//! → `Animated` (second frame appeared). `reset`/`clear` are the only
//! way back down. `Bitmap` holds an externally supplied raster and
//! never decodes.

use crate::animated::AnimatedContent;
use crate::error::ImageError;
use crate::SharedBitmap;
use pictor_codec::FrameDescriptor;
use pictor_raster::{Bitmap, Palette, Rect};
use std::cell::RefCell;
use std::rc::Rc;

/// Visual effect for derived bitmaps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Grayed out at half opacity (disabled form controls)
    Disabled,
    /// Uniform opacity scale, 0-255
    Opacity(u8),
}

/// Lazily computed derived bitmaps, keyed by what produced them.
/// Invalidated only when the source raster is replaced.
#[derive(Default)]
pub struct DerivedCache {
    tile: Option<((u32, u32), SharedBitmap)>,
    effect: Option<(Effect, SharedBitmap)>,
}

impl DerivedCache {
    fn clear(&mut self) {
        self.tile = None;
        self.effect = None;
    }

    fn memory_used(&self) -> usize {
        let tile = self.tile.as_ref().map_or(0, |(_, b)| b.borrow().memory_used());
        let effect = self.effect.as_ref().map_or(0, |(_, b)| b.borrow().memory_used());
        tile + effect
    }

    fn tile_for(&mut self, source: &Bitmap, width: u32, height: u32) -> Result<SharedBitmap, ImageError> {
        if let Some(((w, h), bitmap)) = &self.tile {
            if *w == width && *h == height {
                return Ok(bitmap.clone());
            }
        }
        let tiled = Rc::new(RefCell::new(source.tiled(width, height)?));
        self.tile = Some(((width, height), tiled.clone()));
        Ok(tiled)
    }

    fn effect_for(&mut self, source: &Bitmap, effect: Effect) -> Result<SharedBitmap, ImageError> {
        if let Some((key, bitmap)) = &self.effect {
            if *key == effect {
                return Ok(bitmap.clone());
            }
        }
        let mut out = source.clone();
        apply_effect(&mut out, effect);
        let out = Rc::new(RefCell::new(out));
        self.effect = Some((effect, out.clone()));
        Ok(out)
    }
}

fn apply_effect(bitmap: &mut Bitmap, effect: Effect) {
    for px in bitmap.pixels_mut().chunks_exact_mut(4) {
        match effect {
            Effect::Disabled => {
                let gray =
                    ((px[0] as u32 * 77 + px[1] as u32 * 151 + px[2] as u32 * 28) >> 8) as u8;
                px[0] = gray;
                px[1] = gray;
                px[2] = gray;
                px[3] /= 2;
            }
            Effect::Opacity(opacity) => {
                px[3] = ((px[3] as u32 * opacity as u32) / 255) as u8;
            }
        }
    }
}

/// Single-raster content with incremental decode bookkeeping
pub struct StaticContent {
    /// Canvas-sized raster the decoder fills
    bitmap: SharedBitmap,
    /// Placement of the decoding frame within the canvas
    rect: Rect,
    palette: Option<Palette>,
    interlaced: bool,
    bottom_to_top: bool,
    transparent: bool,
    alpha: bool,
    descriptor: FrameDescriptor,
    /// Most recently written line (canvas coordinates)
    last_decoded_line: Option<u32>,
    /// Highest line index written so far; the incremental-paint bound
    lowest_decoded_line: Option<u32>,
    fully_decoded: bool,
    derived: DerivedCache,
}

impl StaticContent {
    fn new(width: u32, height: u32, descriptor: &FrameDescriptor) -> Result<Self, ImageError> {
        let bitmap = Bitmap::new(width, height, descriptor.transparent, true)?;
        Ok(Self {
            bitmap: Rc::new(RefCell::new(bitmap)),
            rect: descriptor.rect.clipped_to(width, height),
            palette: descriptor.palette.clone(),
            interlaced: descriptor.interlaced,
            bottom_to_top: descriptor.bottom_to_top,
            transparent: descriptor.transparent,
            alpha: descriptor.alpha,
            descriptor: descriptor.clone(),
            last_decoded_line: None,
            lowest_decoded_line: None,
            fully_decoded: false,
            derived: DerivedCache::default(),
        })
    }

    pub fn bitmap(&self) -> SharedBitmap {
        self.bitmap.clone()
    }

    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    pub fn rect(&self) -> Rect {
        self.rect
    }

    /// Swap in a replacement raster, dropping derived bitmaps.
    pub fn replace_bitmap(&mut self, bitmap: Bitmap) {
        self.bitmap = Rc::new(RefCell::new(bitmap));
        self.derived.clear();
    }

    /// Write one transformed scanline (frame-local index) into the
    /// canvas raster, tracking decode progress.
    pub fn write_line(&mut self, row: &[u8], line: u32, line_height: u32) -> Result<(), ImageError> {
        let mut bitmap = self.bitmap.borrow_mut();
        let canvas_line = self.rect.y + line;
        for extra in 0..line_height.max(1) {
            let y = canvas_line + extra;
            if y >= self.rect.y + self.rect.height {
                break;
            }
            write_row_at(&mut bitmap, row, self.rect.x, y)?;
        }
        self.last_decoded_line = Some(canvas_line);
        self.lowest_decoded_line = Some(match self.lowest_decoded_line {
            Some(prev) => prev.max(canvas_line),
            None => canvas_line,
        });
        Ok(())
    }
}

/// Copy a frame-local row into the canvas at an x offset
fn write_row_at(bitmap: &mut Bitmap, row: &[u8], x: u32, y: u32) -> Result<(), ImageError> {
    if y >= bitmap.height() {
        return Ok(());
    }
    let width = bitmap.width() as usize;
    let cols = (row.len() / 4).min(width - x as usize);
    let start = (y as usize * width + x as usize) * 4;
    bitmap.pixels_mut()[start..start + cols * 4].copy_from_slice(&row[..cols * 4]);
    Ok(())
}

/// Externally supplied raster (synthetic images); no decoding
pub struct BitmapContent {
    bitmap: SharedBitmap,
    derived: DerivedCache,
}

impl BitmapContent {
    pub fn new(bitmap: Bitmap) -> Self {
        Self { bitmap: Rc::new(RefCell::new(bitmap)), derived: DerivedCache::default() }
    }

    pub fn bitmap(&self) -> SharedBitmap {
        self.bitmap.clone()
    }
}

/// The content state ladder
pub enum ImgContent {
    /// Nothing known yet
    Null,
    /// Dimensions known, no pixels
    Empty { width: u32, height: u32 },
    /// Externally supplied raster
    Bitmap(BitmapContent),
    /// One raster, possibly still decoding
    Static(StaticContent),
    /// Frame list plus compositor
    Animated(AnimatedContent),
}

/// Discriminant for content states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Null,
    Empty,
    Bitmap,
    Static,
    Animated,
}

impl ImgContent {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Null => ContentKind::Null,
            Self::Empty { .. } => ContentKind::Empty,
            Self::Bitmap(_) => ContentKind::Bitmap,
            Self::Static(_) => ContentKind::Static,
            Self::Animated(_) => ContentKind::Animated,
        }
    }

    pub fn width(&self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Empty { width, .. } => *width,
            Self::Bitmap(c) => c.bitmap.borrow().width(),
            Self::Static(c) => c.bitmap.borrow().width(),
            Self::Animated(c) => c.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Null => 0,
            Self::Empty { height, .. } => *height,
            Self::Bitmap(c) => c.bitmap.borrow().height(),
            Self::Static(c) => c.bitmap.borrow().height(),
            Self::Animated(c) => c.height(),
        }
    }

    pub fn frame_count(&self) -> u32 {
        match self {
            Self::Null | Self::Empty { .. } => 0,
            Self::Bitmap(_) | Self::Static(_) => 1,
            Self::Animated(c) => c.frame_count(),
        }
    }

    pub fn is_transparent(&self) -> bool {
        match self {
            Self::Null | Self::Empty { .. } => false,
            Self::Bitmap(c) => c.bitmap.borrow().is_transparent(),
            Self::Static(c) => c.transparent,
            Self::Animated(c) => c.is_transparent(),
        }
    }

    pub fn has_alpha(&self) -> bool {
        match self {
            Self::Null | Self::Empty { .. } => false,
            Self::Bitmap(c) => c.bitmap.borrow().has_alpha(),
            Self::Static(c) => c.alpha,
            Self::Animated(c) => c.has_alpha(),
        }
    }

    pub fn is_interlaced(&self) -> bool {
        match self {
            Self::Static(c) => c.interlaced,
            Self::Animated(c) => c.decoding_frame().interlaced(),
            _ => false,
        }
    }

    /// Highest decoded line so far, for incremental paint of a static
    /// image still streaming in.
    pub fn last_decoded_line(&self) -> Option<u32> {
        match self {
            Self::Static(c) => c.lowest_decoded_line,
            _ => None,
        }
    }

    /// Rows of a static image arrive bottom-to-top (BMP)
    pub fn is_bottom_to_top(&self) -> bool {
        match self {
            Self::Static(c) => c.bottom_to_top,
            _ => false,
        }
    }

    pub fn is_fully_decoded(&self) -> bool {
        match self {
            Self::Null | Self::Empty { .. } => false,
            Self::Bitmap(_) => true,
            Self::Static(c) => c.fully_decoded,
            Self::Animated(c) => c.is_complete(),
        }
    }

    /// Bytes charged against the cache budget for this content
    pub fn memory_used(&self) -> usize {
        match self {
            Self::Null | Self::Empty { .. } => 0,
            Self::Bitmap(c) => c.bitmap.borrow().memory_used() + c.derived.memory_used(),
            Self::Static(c) => c.bitmap.borrow().memory_used() + c.derived.memory_used(),
            Self::Animated(c) => c.memory_used(),
        }
    }

    /// Bytes held by composited animation frames only
    pub fn animation_memory_used(&self) -> usize {
        match self {
            Self::Animated(c) => c.animation_memory_used(),
            _ => 0,
        }
    }

    /// Dimensions become known: `Null` → `Empty`. Later states keep
    /// their pixels (re-reporting the same size is a no-op).
    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        if matches!(self, Self::Null) {
            *self = Self::Empty { width, height };
        }
    }

    /// First frame reported: `Empty` → `Static`.
    pub fn start_first_frame(&mut self, descriptor: &FrameDescriptor) -> Result<(), ImageError> {
        let Self::Empty { width, height } = *self else {
            return Err(ImageError::MalformedData("frame before dimensions".into()));
        };
        *self = Self::Static(StaticContent::new(width, height, descriptor)?);
        Ok(())
    }

    /// Second frame reported: `Static` → `Animated`, exactly once.
    /// Frame 0's raster moves into the compositor's frame list.
    pub fn promote_to_animated(
        &mut self,
        descriptor: &FrameDescriptor,
        repeat_count: u32,
        retain_below_px: u32,
    ) -> Result<(), ImageError> {
        let Self::Static(static_content) = self else {
            return Err(ImageError::MalformedData("animation promotion out of order".into()));
        };
        let bitmap = static_content.bitmap.borrow().clone();
        let (width, height) = (bitmap.width(), bitmap.height());
        let mut animated = AnimatedContent::from_first_frame(
            width,
            height,
            bitmap,
            &static_content.descriptor,
            retain_below_px,
        );
        animated.set_repeat_count(repeat_count);
        animated.append_frame(descriptor)?;
        *self = Self::Animated(animated);
        Ok(())
    }

    pub fn mark_fully_decoded(&mut self) {
        match self {
            Self::Static(c) => c.fully_decoded = true,
            Self::Animated(c) => c.mark_complete(),
            _ => {}
        }
    }

    pub fn as_animated_mut(&mut self) -> Option<&mut AnimatedContent> {
        match self {
            Self::Animated(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_animated(&self) -> Option<&AnimatedContent> {
        match self {
            Self::Animated(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_static_mut(&mut self) -> Option<&mut StaticContent> {
        match self {
            Self::Static(c) => Some(c),
            _ => None,
        }
    }

    /// The displayable raster for non-animated content. Animated
    /// content goes through the compositor instead.
    pub fn bitmap(&self) -> Option<SharedBitmap> {
        match self {
            Self::Bitmap(c) => Some(c.bitmap()),
            Self::Static(c) => Some(c.bitmap()),
            _ => None,
        }
    }

    /// Tiled repetition of the raster at the requested size, cached
    /// per size.
    pub fn tile_bitmap(&mut self, width: u32, height: u32) -> Result<SharedBitmap, ImageError> {
        match self {
            Self::Bitmap(c) => {
                let source = c.bitmap.borrow().clone();
                c.derived.tile_for(&source, width, height)
            }
            Self::Static(c) => {
                let source = c.bitmap.borrow().clone();
                c.derived.tile_for(&source, width, height)
            }
            _ => Err(ImageError::MalformedData("no raster to tile".into())),
        }
    }

    /// Effect-processed copy of the raster, cached per effect.
    pub fn effect_bitmap(&mut self, effect: Effect) -> Result<SharedBitmap, ImageError> {
        match self {
            Self::Bitmap(c) => {
                let source = c.bitmap.borrow().clone();
                c.derived.effect_for(&source, effect)
            }
            Self::Static(c) => {
                let source = c.bitmap.borrow().clone();
                c.derived.effect_for(&source, effect)
            }
            _ => Err(ImageError::MalformedData("no raster for effect".into())),
        }
    }

    /// Drop back to `Empty` of the same dimensions (or `Null` when no
    /// dimensions were ever known), releasing all pixel memory.
    pub fn clear(&mut self) {
        let (width, height) = (self.width(), self.height());
        *self = if width > 0 && height > 0 {
            Self::Empty { width, height }
        } else {
            Self::Null
        };
    }
}
