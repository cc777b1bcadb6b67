//! Streaming image decoding for Pictor.
//!
//! Format decoders live behind a uniform contract: bytes go in through
//! [`StreamDecoder::decode_data`] in chunks of any size, decoded
//! scanlines and frame metadata come out through [`DecodeSink`]
//! callbacks, and the decoder reports how many trailing bytes it could
//! not consume yet (the resend count) so the caller can re-present them
//! with the next chunk. No decoder ever asks to rewind past that.

pub mod bmp;
pub mod buffered;
pub mod format;
pub mod gif;
pub mod registry;

pub use format::{ImageFormat, SizeCheck};
pub use registry::{DecoderFactory, DecoderRegistry, TypeCheck};

use pictor_raster::{Palette, Rect};

/// Errors a decoder can report
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Allocation failed, or declared dimensions were too large to
    /// ever allocate. Callers may treat this as transient.
    #[error("Out of memory while decoding")]
    OutOfMemory,

    /// The byte stream is structurally invalid. Permanent.
    #[error("Malformed image data: {0}")]
    Malformed(String),

    /// Declared dimensions failed the size sanity check.
    #[error("Image dimensions {width}x{height} rejected as unsafely large")]
    SizeRejected { width: u32, height: u32 },

    /// No decoder handles this byte signature.
    #[error("Unrecognized image type")]
    TypeUnrecognized,

    /// The sink refused the image in `on_init_main_frame`.
    #[error("Decoding aborted by listener")]
    Aborted,
}

/// How a frame's canvas area is treated before the next frame draws
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DisposalMethod {
    /// Unspecified; treated like `DoNotDispose`
    #[default]
    None,
    /// Leave the composite as-is
    DoNotDispose,
    /// Clear the frame's rect to transparent
    RestoreBackground,
    /// Restore the composite that preceded this frame
    RestorePrevious,
}

/// Geometry and flags for one frame, reported at the frame boundary
#[derive(Debug, Clone, Default)]
pub struct FrameDescriptor {
    /// Placement within the canvas
    pub rect: Rect,
    /// Scanlines arrive in interlaced order
    pub interlaced: bool,
    /// Frame carries partial alpha
    pub alpha: bool,
    /// Frame carries fully transparent pixels
    pub transparent: bool,
    /// Bits per pixel of the decoded rows (32, or 8 when indexed)
    pub bits_per_pixel: u32,
    /// Disposal applied after this frame is shown
    pub disposal: DisposalMethod,
    /// Display duration in centiseconds (0 = unknown / not animated)
    pub duration_cs: u32,
    /// Draw this frame without blending against the previous composite
    pub dont_blend_prev: bool,
    /// Rows arrive bottom-to-top (line indices still final)
    pub bottom_to_top: bool,
    /// Palette for indexed rows
    pub palette: Option<Palette>,
}

/// Receiver for decode results, driven synchronously from
/// [`StreamDecoder::decode_data`].
pub trait DecodeSink {
    /// Overall canvas size, reported once. Return `false` to abort the
    /// decode (the decoder then fails with [`DecodeError::Aborted`]).
    fn on_init_main_frame(&mut self, width: u32, height: u32) -> bool;

    /// A frame boundary: once for a static image, once per frame for
    /// animations, in frame order.
    fn on_new_frame(&mut self, frame: &FrameDescriptor);

    /// One decoded row of `frame.rect.width` pixels, frame-local line
    /// index. `line_height > 1` means the row repeats for that many
    /// consecutive lines (interlace fill-in fast path).
    fn on_line_decoded(&mut self, row: &[u8], line: u32, line_height: u32);

    /// Animation loop count: 0 = loop forever, N = play N times.
    fn on_animation_info(&mut self, _repeat_count: u32) {}

    /// The stream is fully decoded; no further callbacks follow.
    fn on_decoding_finished(&mut self);

    /// Embedded ICC profile bytes, if the format carries one.
    fn on_icc_profile(&mut self, _data: &[u8]) {}

    /// Ancillary key/value metadata (text chunks and the like).
    fn on_meta_data(&mut self, _key: &str, _value: &str) {}
}

/// An incremental, format-specific decoder.
pub trait StreamDecoder {
    /// Consume as much of `data` as can be parsed into complete units,
    /// invoking `sink` callbacks along the way. Returns the number of
    /// trailing bytes that were *not* consumed; the caller must
    /// re-present exactly those bytes at the start of the next call.
    /// `more` is false on the final chunk of the stream.
    fn decode_data(
        &mut self,
        data: &[u8],
        more: bool,
        sink: &mut dyn DecodeSink,
    ) -> Result<usize, DecodeError>;

    /// True once `on_decoding_finished` has been emitted.
    fn is_finished(&self) -> bool;
}

/// Size sanity check shared by all decoders: refuse to decode images
/// whose pixel count cannot fit a sane buffer.
pub(crate) fn guard_size(width: u32, height: u32) -> Result<(), DecodeError> {
    if width == 0 || height == 0 {
        return Err(DecodeError::Malformed(format!(
            "zero dimension {width}x{height}"
        )));
    }
    if pictor_raster::is_size_too_large(width, height) {
        return Err(DecodeError::SizeRejected { width, height });
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_sink {
    use super::*;

    /// Sink that records every callback, for decoder tests.
    #[derive(Default)]
    pub struct RecordingSink {
        pub canvas: Option<(u32, u32)>,
        pub frames: Vec<FrameDescriptor>,
        pub lines: Vec<(u32, u32, Vec<u8>)>,
        pub repeat_count: Option<u32>,
        pub finished: bool,
        pub reject_init: bool,
    }

    impl DecodeSink for RecordingSink {
        fn on_init_main_frame(&mut self, width: u32, height: u32) -> bool {
            self.canvas = Some((width, height));
            !self.reject_init
        }

        fn on_new_frame(&mut self, frame: &FrameDescriptor) {
            self.frames.push(frame.clone());
        }

        fn on_line_decoded(&mut self, row: &[u8], line: u32, line_height: u32) {
            self.lines.push((line, line_height, row.to_vec()));
        }

        fn on_animation_info(&mut self, repeat_count: u32) {
            self.repeat_count = Some(repeat_count);
        }

        fn on_decoding_finished(&mut self) {
            self.finished = true;
        }
    }

    /// Drive a decoder over `data` split into `chunk` sized pieces,
    /// honoring the resend contract the way a loader would.
    pub fn feed_chunked(
        decoder: &mut dyn StreamDecoder,
        data: &[u8],
        chunk: usize,
        sink: &mut dyn DecodeSink,
    ) -> Result<(), DecodeError> {
        let mut pending: Vec<u8> = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + chunk).min(data.len());
            pending.extend_from_slice(&data[offset..end]);
            offset = end;
            let more = offset < data.len();
            let resend = decoder.decode_data(&pending, more, sink)?;
            let keep = pending.len() - resend;
            pending.drain(..keep);
        }
        Ok(())
    }
}
