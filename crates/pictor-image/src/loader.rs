//! Image loader
//!
//! Bridges one rep's content-provider byte stream to one decoder
//! instance and translates decoder callbacks into content mutations.
//! The loader pulls whatever the provider window offers, feeds the
//! decoder, consumes exactly what the decoder accepted, and asks the
//! window to grow when a single unit exceeds it. It exists only while
//! a load is in flight; a failed load drops it and retry requires an
//! explicit reset.

use crate::color::{ColorManager, ColorTransform};
use crate::content::ImgContent;
use crate::error::ImageError;
use crate::provider::ContentProvider;
use pictor_codec::{
    DecodeError, DecodeSink, DecoderRegistry, FrameDescriptor, ImageFormat, StreamDecoder,
};
use pictor_raster::Palette;
use std::rc::Rc;

/// Outcome of one `on_more_data` pull
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// The stream is fully decoded
    Finished,
    /// The provider ran dry (or cannot grow); resume when more bytes
    /// arrive
    NeedMoreData,
    /// The per-step byte budget was spent; resume from the scheduler
    Yielded,
}

/// Progress report for one pull
#[derive(Debug, Clone, Copy)]
pub struct LoadProgress {
    pub status: LoadStatus,
    /// At least one scanline or frame landed in content this pull
    pub decoded_anything: bool,
}

/// Drives one decoder for one image source
pub struct ImageLoader {
    decoder: Box<dyn StreamDecoder>,
    format: ImageFormat,
    premultiply: bool,
    retain_below_px: u32,
    color_manager: Option<Rc<dyn ColorManager>>,
    transform: Option<Box<dyn ColorTransform>>,
    /// Loop count that arrived before the content became animated
    pending_repeat: Option<u32>,
    frames_seen: u32,
}

impl std::fmt::Debug for ImageLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageLoader")
            .field("format", &self.format)
            .field("premultiply", &self.premultiply)
            .field("retain_below_px", &self.retain_below_px)
            .field("pending_repeat", &self.pending_repeat)
            .field("frames_seen", &self.frames_seen)
            .finish_non_exhaustive()
    }
}

impl ImageLoader {
    /// Select a decoder for the stream via the registry. Fails with
    /// `TypeUnrecognized` when nothing claims the signature.
    pub fn new(
        registry: &DecoderRegistry,
        content_type: &str,
        initial_bytes: &[u8],
        premultiply: bool,
        retain_below_px: u32,
        color_manager: Option<Rc<dyn ColorManager>>,
    ) -> Result<Self, ImageError> {
        let (format, decoder) = registry
            .create_for_stream(content_type, initial_bytes)
            .ok_or(ImageError::TypeUnrecognized)?;
        tracing::debug!(?format, content_type, "decoder selected");
        Ok(Self {
            decoder,
            format,
            premultiply,
            retain_below_px,
            color_manager,
            transform: None,
            pending_repeat: None,
            frames_seen: 0,
        })
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    /// Pull available bytes from the provider and run them through the
    /// decoder. With `step_budget` set, yields after roughly that many
    /// consumed bytes so one large image cannot monopolize the thread.
    pub fn on_more_data(
        &mut self,
        provider: &mut dyn ContentProvider,
        content: &mut ImgContent,
        step_budget: Option<usize>,
    ) -> Result<LoadProgress, ImageError> {
        let mut consumed_total = 0usize;
        let mut decoded_anything = false;
        loop {
            let (chunk, more) = provider.data();
            if chunk.is_empty() && more {
                return Ok(LoadProgress {
                    status: LoadStatus::NeedMoreData,
                    decoded_anything,
                });
            }
            let chunk_len = chunk.len();
            let mut sink = LoaderSink {
                content,
                premultiply: self.premultiply,
                retain_below_px: self.retain_below_px,
                color_manager: self.color_manager.as_deref(),
                transform: &mut self.transform,
                pending_repeat: &mut self.pending_repeat,
                frames_seen: &mut self.frames_seen,
                error: None,
                decoded_anything: false,
                scratch: Vec::new(),
            };
            let decode_result = self.decoder.decode_data(chunk, more, &mut sink);
            decoded_anything |= sink.decoded_anything;
            if let Some(err) = sink.error.take() {
                return Err(err);
            }
            let resend = match decode_result {
                Ok(resend) => resend,
                Err(err) => return Err(self.classify(err, content)),
            };
            let consumed = chunk_len - resend;
            provider.consume(consumed);
            consumed_total += consumed;

            if self.decoder.is_finished() {
                content.mark_fully_decoded();
                tracing::debug!(format = ?self.format, "image fully decoded");
                return Ok(LoadProgress { status: LoadStatus::Finished, decoded_anything });
            }
            if consumed == 0 {
                if chunk_len == 0 {
                    // EOF reached with a clean decoder state but no
                    // finish signal
                    return Err(ImageError::SizeUnknown);
                }
                // The decoder demanded the whole chunk back: one unit
                // exceeds the window. Grow it, and bail if the window
                // refuses to get bigger (no forward progress possible).
                if !provider.grow() || provider.data().0.len() <= chunk_len {
                    return Ok(LoadProgress {
                        status: LoadStatus::NeedMoreData,
                        decoded_anything,
                    });
                }
                continue;
            }
            if let Some(budget) = step_budget {
                if consumed_total >= budget {
                    return Ok(LoadProgress { status: LoadStatus::Yielded, decoded_anything });
                }
            }
        }
    }

    /// An end-of-stream failure before the dimensions were known is a
    /// size failure, not a malformed-data failure.
    fn classify(&self, err: DecodeError, content: &ImgContent) -> ImageError {
        if matches!(err, DecodeError::Malformed(_)) && content.width() == 0 {
            return ImageError::SizeUnknown;
        }
        err.into()
    }
}

/// Translates decoder callbacks into content mutations. Records the
/// first error and goes inert; the loader surfaces it after the call.
struct LoaderSink<'a> {
    content: &'a mut ImgContent,
    premultiply: bool,
    retain_below_px: u32,
    color_manager: Option<&'a dyn ColorManager>,
    transform: &'a mut Option<Box<dyn ColorTransform>>,
    pending_repeat: &'a mut Option<u32>,
    frames_seen: &'a mut u32,
    error: Option<ImageError>,
    decoded_anything: bool,
    scratch: Vec<u8>,
}

impl LoaderSink<'_> {
    /// Palette lookup (if indexed), premultiplication, then ICC, in
    /// that order, into the scratch row.
    fn transform_row<'r>(&'r mut self, row: &'r [u8], indexed_palette: Option<&Palette>) -> &'r [u8] {
        let needs_work =
            indexed_palette.is_some() || self.premultiply || self.transform.is_some();
        if !needs_work {
            return row;
        }
        self.scratch.clear();
        match indexed_palette {
            Some(palette) => {
                for &index in row {
                    self.scratch.extend_from_slice(&palette.color(index));
                }
            }
            None => self.scratch.extend_from_slice(row),
        }
        if self.premultiply {
            for px in self.scratch.chunks_exact_mut(4) {
                let a = px[3] as u32;
                px[0] = ((px[0] as u32 * a) / 255) as u8;
                px[1] = ((px[1] as u32 * a) / 255) as u8;
                px[2] = ((px[2] as u32 * a) / 255) as u8;
            }
        }
        if let Some(transform) = self.transform.as_deref() {
            transform.apply(&mut self.scratch);
        }
        &self.scratch
    }
}

impl DecodeSink for LoaderSink<'_> {
    fn on_init_main_frame(&mut self, width: u32, height: u32) -> bool {
        if self.error.is_some() {
            return false;
        }
        if pictor_raster::is_size_too_large(width, height) {
            self.error = Some(ImageError::SizeRejected { width, height });
            return false;
        }
        self.content.set_dimensions(width, height);
        self.decoded_anything = true;
        true
    }

    fn on_new_frame(&mut self, frame: &FrameDescriptor) {
        if self.error.is_some() {
            return;
        }
        let result = match *self.frames_seen {
            0 => self.content.start_first_frame(frame),
            1 => {
                let repeat = self.pending_repeat.take().unwrap_or(0);
                self.content.promote_to_animated(frame, repeat, self.retain_below_px)
            }
            _ => match self.content.as_animated_mut() {
                Some(animated) => animated.append_frame(frame),
                None => Err(ImageError::MalformedData("frame after non-animated content".into())),
            },
        };
        match result {
            Ok(()) => {
                *self.frames_seen += 1;
                self.decoded_anything = true;
            }
            Err(err) => self.error = Some(err),
        }
    }

    fn on_line_decoded(&mut self, row: &[u8], line: u32, line_height: u32) {
        if self.error.is_some() {
            return;
        }
        // Pull the write target out first so the content borrow ends
        // before the row transform runs.
        let (target_bitmap, width, palette) = match &*self.content {
            ImgContent::Static(s) => (None, s.rect().width as usize, s.palette().cloned()),
            ImgContent::Animated(a) => {
                let frame = a.decoding_frame();
                let bitmap = frame.bitmap();
                let width = bitmap.borrow().width() as usize;
                (Some(bitmap), width, frame.palette().cloned())
            }
            _ => {
                self.error = Some(ImageError::MalformedData("scanline before any frame".into()));
                return;
            }
        };
        // An indexed row is one byte per pixel; RGBA rows are four
        let indexed = palette.as_ref().filter(|_| row.len() == width);
        let transformed = self.transform_row(row, indexed).to_vec();
        let result = match target_bitmap {
            None => match self.content.as_static_mut() {
                Some(s) => s.write_line(&transformed, line, line_height),
                None => Ok(()),
            },
            Some(bitmap) => {
                let mut target = bitmap.borrow_mut();
                let mut write = Ok(());
                for extra in 0..line_height.max(1) {
                    if line + extra >= target.height() {
                        break;
                    }
                    if let Err(err) = target.set_line(line + extra, &transformed) {
                        write = Err(err.into());
                        break;
                    }
                }
                write
            }
        };
        match result {
            Ok(()) => self.decoded_anything = true,
            Err(err) => self.error = Some(err),
        }
    }

    fn on_animation_info(&mut self, repeat_count: u32) {
        match self.content.as_animated_mut() {
            Some(animated) => animated.set_repeat_count(repeat_count),
            None => *self.pending_repeat = Some(repeat_count),
        }
    }

    fn on_decoding_finished(&mut self) {
        self.content.mark_fully_decoded();
    }

    fn on_icc_profile(&mut self, data: &[u8]) {
        if self.transform.is_none() {
            if let Some(manager) = self.color_manager {
                *self.transform = manager.transform_for_profile(data);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MemoryProvider, ProviderId};
    use pictor_codec::DecoderRegistry;

    fn tiny_gif() -> Vec<u8> {
        let mut data = b"GIF89a".to_vec();
        data.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00]);
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF]);
        data.extend_from_slice(&[0x21, 0xF9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0x2C, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00]);
        data.extend_from_slice(&[0x02, 0x02, 0x44, 0x01, 0x00]);
        data.push(0x3B);
        data
    }

    #[test]
    fn test_load_whole_stream() {
        let registry = DecoderRegistry::with_builtin();
        let data = tiny_gif();
        let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &data);
        let mut content = ImgContent::Null;
        let mut loader =
            ImageLoader::new(&registry, "image/gif", &data, false, 0, None).unwrap();
        let progress = loader.on_more_data(&mut provider, &mut content, None).unwrap();
        assert_eq!(progress.status, LoadStatus::Finished);
        assert!(progress.decoded_anything);
        assert_eq!(content.width(), 1);
        assert!(content.is_fully_decoded());
        // The single pixel is the transparent palette entry
        let bitmap = content.bitmap().unwrap();
        assert_eq!(bitmap.borrow().pixel(0, 0).unwrap()[3], 0);
    }

    #[test]
    fn test_incremental_feed() {
        let registry = DecoderRegistry::with_builtin();
        let data = tiny_gif();
        let mut provider = MemoryProvider::new(ProviderId(1), "image/gif");
        let mut content = ImgContent::Null;
        let mut loader =
            ImageLoader::new(&registry, "image/gif", &data, false, 0, None).unwrap();

        provider.append(&data[..10]);
        let progress = loader.on_more_data(&mut provider, &mut content, None).unwrap();
        assert_eq!(progress.status, LoadStatus::NeedMoreData);

        provider.append(&data[10..]);
        provider.finish();
        let progress = loader.on_more_data(&mut provider, &mut content, None).unwrap();
        assert_eq!(progress.status, LoadStatus::Finished);
    }

    #[test]
    fn test_window_grow_no_progress_terminates() {
        let registry = DecoderRegistry::with_builtin();
        let data = tiny_gif();
        // Window stuck at 3 bytes: smaller than the 6-byte header unit
        let mut provider =
            MemoryProvider::loaded(ProviderId(1), "image/gif", &data).with_window(3, 3);
        let mut content = ImgContent::Null;
        let mut loader =
            ImageLoader::new(&registry, "image/gif", &data, false, 0, None).unwrap();
        let progress = loader.on_more_data(&mut provider, &mut content, None).unwrap();
        assert_eq!(progress.status, LoadStatus::NeedMoreData);
    }

    #[test]
    fn test_unknown_type_fails_selection() {
        let registry = DecoderRegistry::with_builtin();
        let err = ImageLoader::new(&registry, "text/plain", b"definitely not pixels", false, 0, None)
            .unwrap_err();
        assert_eq!(err, ImageError::TypeUnrecognized);
    }

    #[test]
    fn test_truncated_stream_before_size_is_size_unknown() {
        let registry = DecoderRegistry::with_builtin();
        let data = tiny_gif();
        let mut provider = MemoryProvider::loaded(ProviderId(1), "image/gif", &data[..8]);
        let mut content = ImgContent::Null;
        let mut loader =
            ImageLoader::new(&registry, "image/gif", &data[..8], false, 0, None).unwrap();
        let err = loader.on_more_data(&mut provider, &mut content, None).unwrap_err();
        assert_eq!(err, ImageError::SizeUnknown);
    }
}
