//! Image format sniffing
//!
//! Magic-byte detection plus header-only size peeking, so the cache can
//! learn an unknown stream's type and dimensions before committing a
//! decoder to it.

use pictor_raster::SIZE_SNIFF_LIMIT;

/// Supported image formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    WebP,
    Bmp,
    Ico,
    Unknown,
}

impl ImageFormat {
    /// Detect format from magic bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        if data.len() < 8 {
            return Self::Unknown;
        }

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
            return Self::Png;
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Self::Jpeg;
        }

        // GIF: GIF87a or GIF89a
        if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
            return Self::Gif;
        }

        // WebP: RIFF....WEBP
        if data.len() >= 12 && data.starts_with(b"RIFF") && &data[8..12] == b"WEBP" {
            return Self::WebP;
        }

        // BMP: BM
        if data.starts_with(b"BM") {
            return Self::Bmp;
        }

        // ICO: 00 00 01 00
        if data.starts_with(&[0x00, 0x00, 0x01, 0x00]) {
            return Self::Ico;
        }

        Self::Unknown
    }

    /// Get format from a MIME content-type tag
    pub fn from_content_type(tag: &str) -> Self {
        match tag {
            "image/png" => Self::Png,
            "image/jpeg" | "image/jpg" => Self::Jpeg,
            "image/gif" => Self::Gif,
            "image/webp" => Self::WebP,
            "image/bmp" | "image/x-ms-bmp" => Self::Bmp,
            "image/x-icon" | "image/vnd.microsoft.icon" => Self::Ico,
            _ => Self::Unknown,
        }
    }

    /// Get format from file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "png" => Self::Png,
            "jpg" | "jpeg" => Self::Jpeg,
            "gif" => Self::Gif,
            "webp" => Self::WebP,
            "bmp" => Self::Bmp,
            "ico" => Self::Ico,
            _ => Self::Unknown,
        }
    }
}

/// Result of a header-only size peek
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeCheck {
    /// Dimensions parsed from the header
    Size(u32, u32),
    /// Not enough bytes yet to tell
    NeedData,
    /// Dimensions parsed but over the fast-path sniff limit
    Rejected(u32, u32),
    /// Format unknown or carries no peekable size
    Unsupported,
}

/// Peek the declared dimensions out of a stream prefix without
/// committing a decoder.
pub fn check_size(data: &[u8]) -> SizeCheck {
    let dims = match ImageFormat::from_bytes(data) {
        ImageFormat::Png => png_size(data),
        ImageFormat::Jpeg => jpeg_size(data),
        ImageFormat::Gif => gif_size(data),
        ImageFormat::Bmp => bmp_size(data),
        ImageFormat::WebP | ImageFormat::Ico => return SizeCheck::Unsupported,
        ImageFormat::Unknown => {
            return if data.len() < 12 { SizeCheck::NeedData } else { SizeCheck::Unsupported };
        }
    };
    match dims {
        Some((w, h)) if w >= SIZE_SNIFF_LIMIT || h >= SIZE_SNIFF_LIMIT => SizeCheck::Rejected(w, h),
        Some((w, h)) => SizeCheck::Size(w, h),
        None => SizeCheck::NeedData,
    }
}

/// PNG signature + IHDR
fn png_size(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 {
        return None;
    }
    // IHDR is required to be the first chunk
    if &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
    let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
    Some((width, height))
}

/// JPEG: scan segments for an SOF marker
fn jpeg_size(data: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 4 < data.len() {
        if data[i] != 0xFF {
            i += 1;
            continue;
        }
        let marker = data[i + 1];
        // SOF0, SOF1, SOF2 (progressive)
        if (0xC0..=0xC2).contains(&marker) {
            if i + 9 < data.len() {
                let height = u16::from_be_bytes([data[i + 5], data[i + 6]]) as u32;
                let width = u16::from_be_bytes([data[i + 7], data[i + 8]]) as u32;
                return Some((width, height));
            }
            return None;
        }
        if marker == 0xD9 {
            // EOI
            return None;
        }
        let length = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        i += 2 + length;
    }
    None
}

/// GIF logical screen descriptor
fn gif_size(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 10 {
        return None;
    }
    let width = u16::from_le_bytes([data[6], data[7]]) as u32;
    let height = u16::from_le_bytes([data[8], data[9]]) as u32;
    Some((width, height))
}

/// BMP info header
fn bmp_size(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 26 {
        return None;
    }
    let width = i32::from_le_bytes([data[18], data[19], data[20], data[21]]);
    let height = i32::from_le_bytes([data[22], data[23], data[24], data[25]]);
    Some((width.unsigned_abs(), height.unsigned_abs()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_detection_png() {
        let png_header = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(ImageFormat::from_bytes(&png_header), ImageFormat::Png);
    }

    #[test]
    fn test_format_detection_jpeg() {
        let jpeg_header = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46];
        assert_eq!(ImageFormat::from_bytes(&jpeg_header), ImageFormat::Jpeg);
    }

    #[test]
    fn test_format_detection_gif_bmp() {
        assert_eq!(ImageFormat::from_bytes(b"GIF89a\x01\x00"), ImageFormat::Gif);
        assert_eq!(ImageFormat::from_bytes(b"BM\x00\x00\x00\x00\x00\x00"), ImageFormat::Bmp);
    }

    #[test]
    fn test_format_from_extension() {
        assert_eq!(ImageFormat::from_extension("png"), ImageFormat::Png);
        assert_eq!(ImageFormat::from_extension("JPG"), ImageFormat::Jpeg);
        assert_eq!(ImageFormat::from_extension("webp"), ImageFormat::WebP);
    }

    #[test]
    fn test_format_from_content_type() {
        assert_eq!(ImageFormat::from_content_type("image/gif"), ImageFormat::Gif);
        assert_eq!(ImageFormat::from_content_type("text/html"), ImageFormat::Unknown);
    }

    #[test]
    fn test_png_size_peek() {
        let header = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR\x00\x00\x00\x64\x00\x00\x00\x32";
        assert_eq!(check_size(header), SizeCheck::Size(100, 50));
    }

    #[test]
    fn test_gif_size_peek() {
        let header = b"GIF89a\x07\x00\x03\x00";
        assert_eq!(check_size(header), SizeCheck::Size(7, 3));
    }

    #[test]
    fn test_size_peek_needs_data() {
        assert_eq!(check_size(b"\x89PNG\r\n\x1a\n\x00\x00"), SizeCheck::NeedData);
        assert_eq!(check_size(b"GI"), SizeCheck::NeedData);
    }

    #[test]
    fn test_size_peek_rejects_huge() {
        // 40000 x 10 GIF
        let mut header = b"GIF89a".to_vec();
        header.extend_from_slice(&40000u16.to_le_bytes());
        header.extend_from_slice(&10u16.to_le_bytes());
        assert_eq!(check_size(&header), SizeCheck::Rejected(40000, 10));
    }
}
