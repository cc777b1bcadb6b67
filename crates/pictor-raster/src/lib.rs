//! Pixel buffers for the Pictor image pipeline.
//!
//! A `Bitmap` is the raster every decoder writes into and every
//! compositor reads from: either 32-bpp RGBA with straight alpha, or
//! 8-bpp indexed with a palette. Rows are written and read one line at
//! a time to match the streaming decode model.

/// Dimensions above this are rejected outright when sniffing a header,
/// before the exact bit-length check runs.
pub const SIZE_SNIFF_LIMIT: u32 = 16384;

/// Errors from bitmap creation and pixel access
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RasterError {
    #[error("Image dimensions {width}x{height} exceed the safe size limit")]
    SizeTooLarge { width: u32, height: u32 },

    #[error("Bitmap dimensions must be non-zero")]
    BadDimensions,

    #[error("Line {line} is outside the bitmap")]
    LineOutOfBounds { line: u32 },

    #[error("Row has {got} bytes, expected {expected}")]
    RowLengthMismatch { expected: usize, got: usize },

    #[error("Operation not supported for this pixel format")]
    FormatMismatch,

    #[error("Out of memory allocating pixel storage")]
    OutOfMemory,
}

/// Reject dimensions whose product could not fit a sane pixel buffer.
///
/// The sum of the bit lengths bounds log2 of the pixel count; anything
/// over 2^30 pixels is refused before any allocation is attempted.
pub fn is_size_too_large(width: u32, height: u32) -> bool {
    let bits = |v: u32| 32 - v.leading_zeros();
    bits(width) + bits(height) > 30
}

/// Storage layout of a bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 4 bytes per pixel, RGBA order, straight (non-premultiplied) alpha
    Rgba32,
    /// 1 byte per pixel, palette index
    Indexed8,
}

impl PixelFormat {
    /// Bytes per pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Rgba32 => 4,
            Self::Indexed8 => 1,
        }
    }

    /// Bits per pixel
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            Self::Rgba32 => 32,
            Self::Indexed8 => 8,
        }
    }
}

/// Color palette for indexed bitmaps
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Palette {
    /// RGBA entries, at most 256
    entries: Vec<[u8; 4]>,
    /// Index rendered as fully transparent, if any
    transparent_index: Option<u8>,
}

impl Palette {
    /// Build a palette from RGB triples
    pub fn from_rgb(rgb: &[[u8; 3]], transparent_index: Option<u8>) -> Self {
        let entries = rgb
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let a = if transparent_index == Some(i as u8) { 0 } else { 255 };
                [c[0], c[1], c[2], a]
            })
            .collect();
        Self { entries, transparent_index }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the palette has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// RGBA color for an index (opaque black for out-of-range indices)
    pub fn color(&self, index: u8) -> [u8; 4] {
        self.entries
            .get(index as usize)
            .copied()
            .unwrap_or([0, 0, 0, 255])
    }

    /// The transparent index, if one was declared
    pub fn transparent_index(&self) -> Option<u8> {
        self.transparent_index
    }
}

/// Rectangle in bitmap coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Full-canvas rect for a bitmap of the given size
    pub fn of_size(width: u32, height: u32) -> Self {
        Self { x: 0, y: 0, width, height }
    }

    /// True when this rect fully covers a canvas of the given size
    pub fn covers(&self, width: u32, height: u32) -> bool {
        self.x == 0 && self.y == 0 && self.width >= width && self.height >= height
    }

    /// Clamp to a canvas of the given size
    pub fn clipped_to(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect {
            x,
            y,
            width: self.width.min(width - x),
            height: self.height.min(height - y),
        }
    }
}

/// A decoded pixel buffer
#[derive(Debug, Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    transparent: bool,
    alpha: bool,
    palette: Option<Palette>,
    data: Vec<u8>,
}

impl Bitmap {
    /// Create a 32-bpp RGBA bitmap, initialized fully transparent
    pub fn new(width: u32, height: u32, transparent: bool, alpha: bool) -> Result<Self, RasterError> {
        Self::with_format(width, height, PixelFormat::Rgba32, transparent, alpha, None)
    }

    /// Create an 8-bpp indexed bitmap (palette supplied later or now)
    pub fn new_indexed(
        width: u32,
        height: u32,
        palette: Option<Palette>,
    ) -> Result<Self, RasterError> {
        let transparent = palette
            .as_ref()
            .is_some_and(|p| p.transparent_index().is_some());
        Self::with_format(width, height, PixelFormat::Indexed8, transparent, false, palette)
    }

    fn with_format(
        width: u32,
        height: u32,
        format: PixelFormat,
        transparent: bool,
        alpha: bool,
        palette: Option<Palette>,
    ) -> Result<Self, RasterError> {
        if width == 0 || height == 0 {
            return Err(RasterError::BadDimensions);
        }
        if is_size_too_large(width, height) {
            return Err(RasterError::SizeTooLarge { width, height });
        }
        let len = width as usize * height as usize * format.bytes_per_pixel();
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| RasterError::OutOfMemory)?;
        data.resize(len, 0);
        Ok(Self { width, height, format, transparent, alpha, palette, data })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Storage format
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Bits per pixel of the storage format
    pub fn bpp(&self) -> u32 {
        self.format.bits_per_pixel()
    }

    pub fn has_alpha(&self) -> bool {
        self.alpha
    }

    pub fn is_transparent(&self) -> bool {
        self.transparent
    }

    /// Bytes per row
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel()
    }

    /// Bytes held by the pixel storage
    pub fn memory_used(&self) -> usize {
        self.data.len()
    }

    /// Attach or replace the palette (indexed bitmaps only)
    pub fn set_palette(&mut self, palette: Palette) -> Result<(), RasterError> {
        if self.format != PixelFormat::Indexed8 {
            return Err(RasterError::FormatMismatch);
        }
        self.transparent = palette.transparent_index().is_some();
        self.palette = Some(palette);
        Ok(())
    }

    /// The palette, if this is an indexed bitmap with one attached
    pub fn palette(&self) -> Option<&Palette> {
        self.palette.as_ref()
    }

    /// Write one full row of pixels
    pub fn set_line(&mut self, line: u32, row: &[u8]) -> Result<(), RasterError> {
        if line >= self.height {
            return Err(RasterError::LineOutOfBounds { line });
        }
        let rb = self.row_bytes();
        if row.len() != rb {
            return Err(RasterError::RowLengthMismatch { expected: rb, got: row.len() });
        }
        let start = line as usize * rb;
        self.data[start..start + rb].copy_from_slice(row);
        Ok(())
    }

    /// Read one full row of pixels
    pub fn line(&self, line: u32) -> Result<&[u8], RasterError> {
        if line >= self.height {
            return Err(RasterError::LineOutOfBounds { line });
        }
        let rb = self.row_bytes();
        let start = line as usize * rb;
        Ok(&self.data[start..start + rb])
    }

    /// Bulk read access to the whole pixel buffer
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// Bulk write access to the whole pixel buffer
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// RGBA value at (x, y), expanding through the palette when indexed
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        match self.format {
            PixelFormat::Rgba32 => {
                let idx = (y as usize * self.width as usize + x as usize) * 4;
                Some([self.data[idx], self.data[idx + 1], self.data[idx + 2], self.data[idx + 3]])
            }
            PixelFormat::Indexed8 => {
                let idx = y as usize * self.width as usize + x as usize;
                let entry = self.data[idx];
                match &self.palette {
                    Some(p) => Some(p.color(entry)),
                    None => None,
                }
            }
        }
    }

    /// Expand an indexed bitmap into a fresh RGBA bitmap
    pub fn to_rgba(&self) -> Result<Bitmap, RasterError> {
        match self.format {
            PixelFormat::Rgba32 => Ok(self.clone()),
            PixelFormat::Indexed8 => {
                let palette = self.palette.as_ref().ok_or(RasterError::FormatMismatch)?;
                let mut out = Bitmap::new(self.width, self.height, self.transparent, true)?;
                for (i, &index) in self.data.iter().enumerate() {
                    let c = palette.color(index);
                    out.data[i * 4..i * 4 + 4].copy_from_slice(&c);
                }
                Ok(out)
            }
        }
    }

    /// Zero a rect to fully transparent (RGBA only)
    pub fn clear_rect(&mut self, rect: Rect) -> Result<(), RasterError> {
        if self.format != PixelFormat::Rgba32 {
            return Err(RasterError::FormatMismatch);
        }
        let r = rect.clipped_to(self.width, self.height);
        for y in r.y..r.y + r.height {
            let start = (y as usize * self.width as usize + r.x as usize) * 4;
            let end = start + r.width as usize * 4;
            self.data[start..end].fill(0);
        }
        self.transparent = true;
        Ok(())
    }

    /// Overwrite (no blending) `src` into this bitmap at `rect`
    pub fn overwrite_at(&mut self, src: &Bitmap, rect: Rect) -> Result<(), RasterError> {
        if self.format != PixelFormat::Rgba32 || src.format != PixelFormat::Rgba32 {
            return Err(RasterError::FormatMismatch);
        }
        let r = rect.clipped_to(self.width, self.height);
        let rows = r.height.min(src.height);
        let cols = r.width.min(src.width) as usize;
        for row in 0..rows {
            let src_start = row as usize * src.width as usize * 4;
            let dst_start = ((r.y + row) as usize * self.width as usize + r.x as usize) * 4;
            self.data[dst_start..dst_start + cols * 4]
                .copy_from_slice(&src.data[src_start..src_start + cols * 4]);
        }
        self.alpha |= src.alpha;
        self.transparent |= src.transparent;
        Ok(())
    }

    /// Source-over blend `src` into this bitmap at `rect` (straight alpha)
    pub fn blend_at(&mut self, src: &Bitmap, rect: Rect) -> Result<(), RasterError> {
        if self.format != PixelFormat::Rgba32 || src.format != PixelFormat::Rgba32 {
            return Err(RasterError::FormatMismatch);
        }
        let r = rect.clipped_to(self.width, self.height);
        let rows = r.height.min(src.height);
        let cols = r.width.min(src.width) as usize;
        for row in 0..rows {
            let src_start = row as usize * src.width as usize * 4;
            let dst_start = ((r.y + row) as usize * self.width as usize + r.x as usize) * 4;
            for col in 0..cols {
                let s = &src.data[src_start + col * 4..src_start + col * 4 + 4];
                let d = &mut self.data[dst_start + col * 4..dst_start + col * 4 + 4];
                blend_pixel(d, s);
            }
        }
        Ok(())
    }

    /// Repeat this bitmap to fill `width` x `height`
    pub fn tiled(&self, width: u32, height: u32) -> Result<Bitmap, RasterError> {
        if self.format != PixelFormat::Rgba32 {
            return Err(RasterError::FormatMismatch);
        }
        let mut out = Bitmap::new(width, height, self.transparent, self.alpha)?;
        let rb = self.row_bytes();
        let mut row = Vec::new();
        row.try_reserve_exact(width as usize * 4).map_err(|_| RasterError::OutOfMemory)?;
        for y in 0..height {
            row.clear();
            let src_row = &self.data[(y % self.height) as usize * rb..][..rb];
            while row.len() < width as usize * 4 {
                let take = (width as usize * 4 - row.len()).min(rb);
                row.extend_from_slice(&src_row[..take]);
            }
            out.set_line(y, &row)?;
        }
        Ok(out)
    }
}

/// Source-over composite of one straight-alpha RGBA pixel
fn blend_pixel(dst: &mut [u8], src: &[u8]) {
    let sa = src[3] as u32;
    if sa == 255 {
        dst.copy_from_slice(src);
        return;
    }
    if sa == 0 {
        return;
    }
    let da = dst[3] as u32;
    let out_a = sa + da * (255 - sa) / 255;
    if out_a == 0 {
        dst.fill(0);
        return;
    }
    for i in 0..3 {
        let sc = src[i] as u32;
        let dc = dst[i] as u32;
        dst[i] = ((sc * sa + dc * da * (255 - sa) / 255) / out_a) as u8;
    }
    dst[3] = out_a as u8;
}
