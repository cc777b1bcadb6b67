//! Buffered fallback decoder
//!
//! Adapts non-streaming codecs (PNG, JPEG, WebP via the `image` crate)
//! to the streaming contract: bytes accumulate in an internal buffer
//! and the real decode runs once the final chunk arrives, after which
//! the callbacks replay as if the image had streamed. The canvas size
//! is still reported early, as soon as the header can be peeked, so
//! layout does not have to wait for the full stream.

use crate::format::{check_size, ImageFormat, SizeCheck};
use crate::{DecodeError, DecodeSink, DisposalMethod, FrameDescriptor, StreamDecoder};
use pictor_raster::Rect;

/// Streaming adapter over whole-buffer codecs
pub struct BufferedDecoder {
    format: ImageFormat,
    buffer: Vec<u8>,
    size_reported: bool,
    finished: bool,
}

impl BufferedDecoder {
    pub fn new(format: ImageFormat) -> Self {
        Self {
            format,
            buffer: Vec::new(),
            size_reported: false,
            finished: false,
        }
    }

    fn image_format(&self) -> Result<image::ImageFormat, DecodeError> {
        match self.format {
            ImageFormat::Png => Ok(image::ImageFormat::Png),
            ImageFormat::Jpeg => Ok(image::ImageFormat::Jpeg),
            ImageFormat::WebP => Ok(image::ImageFormat::WebP),
            _ => Err(DecodeError::TypeUnrecognized),
        }
    }

    fn decode_all(&mut self, sink: &mut dyn DecodeSink) -> Result<(), DecodeError> {
        let format = self.image_format()?;
        let img = image::load_from_memory_with_format(&self.buffer, format)
            .map_err(map_image_error)?;
        let rgba = img.into_rgba8();
        let (width, height) = rgba.dimensions();
        crate::guard_size(width, height)?;
        if !self.size_reported {
            self.size_reported = true;
            if !sink.on_init_main_frame(width, height) {
                return Err(DecodeError::Aborted);
            }
        }
        let has_alpha = rgba.pixels().any(|p| p.0[3] != 255);
        sink.on_new_frame(&FrameDescriptor {
            rect: Rect::of_size(width, height),
            interlaced: false,
            alpha: has_alpha,
            transparent: has_alpha,
            bits_per_pixel: 32,
            disposal: DisposalMethod::None,
            duration_cs: 0,
            dont_blend_prev: false,
            bottom_to_top: false,
            palette: None,
        });
        let raw = rgba.as_raw();
        let row_bytes = width as usize * 4;
        for line in 0..height {
            let start = line as usize * row_bytes;
            sink.on_line_decoded(&raw[start..start + row_bytes], line, 1);
        }
        self.finished = true;
        sink.on_decoding_finished();
        tracing::debug!(format = ?self.format, width, height, "buffered decode complete");
        Ok(())
    }
}

impl StreamDecoder for BufferedDecoder {
    fn decode_data(
        &mut self,
        data: &[u8],
        more: bool,
        sink: &mut dyn DecodeSink,
    ) -> Result<usize, DecodeError> {
        if self.finished {
            return Ok(0);
        }
        self.buffer
            .try_reserve(data.len())
            .map_err(|_| DecodeError::OutOfMemory)?;
        self.buffer.extend_from_slice(data);

        // Report the canvas as soon as the header allows it
        if !self.size_reported {
            match check_size(&self.buffer) {
                SizeCheck::Size(width, height) => {
                    crate::guard_size(width, height)?;
                    self.size_reported = true;
                    if !sink.on_init_main_frame(width, height) {
                        return Err(DecodeError::Aborted);
                    }
                }
                SizeCheck::Rejected(width, height) => {
                    return Err(DecodeError::SizeRejected { width, height });
                }
                SizeCheck::NeedData | SizeCheck::Unsupported => {}
            }
        }

        if !more {
            self.decode_all(sink)?;
        }
        Ok(0)
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

fn map_image_error(err: image::ImageError) -> DecodeError {
    match err {
        image::ImageError::Limits(_) => DecodeError::OutOfMemory,
        image::ImageError::Unsupported(_) => DecodeError::TypeUnrecognized,
        other => DecodeError::Malformed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_sink::{feed_chunked, RecordingSink};

    /// Encode a small PNG with the `png` crate for test input.
    fn make_png(width: u32, height: u32, rgba: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut out, width, height);
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);
            let mut writer = encoder.write_header().unwrap();
            writer.write_image_data(rgba).unwrap();
        }
        out
    }

    #[test]
    fn test_png_roundtrip() {
        let pixels = vec![
            255, 0, 0, 255, /**/ 0, 255, 0, 128, //
            0, 0, 255, 255, /**/ 10, 20, 30, 0,
        ];
        let data = make_png(2, 2, &pixels);
        let mut sink = RecordingSink::default();
        let mut decoder = BufferedDecoder::new(ImageFormat::Png);
        decoder.decode_data(&data, false, &mut sink).unwrap();
        assert_eq!(sink.canvas, Some((2, 2)));
        assert_eq!(sink.lines.len(), 2);
        assert_eq!(sink.lines[0].2, &pixels[..8]);
        assert_eq!(sink.lines[1].2, &pixels[8..]);
        assert!(sink.finished);
        assert!(sink.frames[0].alpha);
    }

    #[test]
    fn test_size_reported_before_full_stream() {
        let data = make_png(4, 3, &vec![0u8; 4 * 3 * 4]);
        let mut sink = RecordingSink::default();
        let mut decoder = BufferedDecoder::new(ImageFormat::Png);
        // Feed only the signature + IHDR
        let resend = decoder.decode_data(&data[..26], true, &mut sink).unwrap();
        assert_eq!(resend, 0);
        assert_eq!(sink.canvas, Some((4, 3)));
        assert!(!sink.finished);
        // Feed the rest
        decoder.decode_data(&data[26..], false, &mut sink).unwrap();
        assert!(sink.finished);
        assert_eq!(sink.lines.len(), 3);
    }

    #[test]
    fn test_chunked_feed() {
        let pixels: Vec<u8> = (0..16).collect();
        let data = make_png(2, 2, &pixels);
        let mut sink = RecordingSink::default();
        let mut decoder = BufferedDecoder::new(ImageFormat::Png);
        feed_chunked(&mut decoder, &data, 3, &mut sink).unwrap();
        assert!(sink.finished);
        assert_eq!(sink.lines.len(), 2);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let mut sink = RecordingSink::default();
        let mut decoder = BufferedDecoder::new(ImageFormat::Png);
        let err = decoder.decode_data(&[0u8; 64], false, &mut sink).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }
}
