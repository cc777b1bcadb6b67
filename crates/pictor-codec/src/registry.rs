//! Decoder factory registry
//!
//! Maps content-type tags and byte signatures to decoder factories, so
//! the cache can sniff an unknown stream and commit a decoder once the
//! signature settles. GIF and BMP get the in-tree streaming decoders;
//! PNG, JPEG and WebP go through the buffered adapter.

use crate::bmp::BmpDecoder;
use crate::buffered::BufferedDecoder;
use crate::format::{ImageFormat, SizeCheck};
use crate::gif::GifDecoder;
use crate::StreamDecoder;

/// Result of matching a byte prefix against a registered format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCheck {
    /// Signature matches a registered format
    Yes(ImageFormat),
    /// Signature matches no registered format
    No,
    /// Not enough bytes yet to tell
    Maybe,
}

/// Creates one decoder instance per load
pub trait DecoderFactory {
    fn create(&self) -> Box<dyn StreamDecoder>;
}

struct GifFactory;
impl DecoderFactory for GifFactory {
    fn create(&self) -> Box<dyn StreamDecoder> {
        Box::new(GifDecoder::new())
    }
}

struct BmpFactory;
impl DecoderFactory for BmpFactory {
    fn create(&self) -> Box<dyn StreamDecoder> {
        Box::new(BmpDecoder::new())
    }
}

struct BufferedFactory(ImageFormat);
impl DecoderFactory for BufferedFactory {
    fn create(&self) -> Box<dyn StreamDecoder> {
        Box::new(BufferedDecoder::new(self.0))
    }
}

struct Entry {
    format: ImageFormat,
    factory: Box<dyn DecoderFactory>,
    /// Verify the byte signature even when the content type claimed
    /// this format
    check_header: bool,
}

/// Registry of decoder factories keyed by format
pub struct DecoderRegistry {
    entries: Vec<Entry>,
}

impl DecoderRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Registry with every built-in decoder registered
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(ImageFormat::Gif, Box::new(GifFactory), true);
        registry.register(ImageFormat::Bmp, Box::new(BmpFactory), true);
        registry.register(ImageFormat::Png, Box::new(BufferedFactory(ImageFormat::Png)), true);
        registry.register(ImageFormat::Jpeg, Box::new(BufferedFactory(ImageFormat::Jpeg)), true);
        registry.register(ImageFormat::WebP, Box::new(BufferedFactory(ImageFormat::WebP)), true);
        registry
    }

    /// Register a factory for a format, replacing any existing entry
    pub fn register(&mut self, format: ImageFormat, factory: Box<dyn DecoderFactory>, check_header: bool) {
        self.entries.retain(|e| e.format != format);
        self.entries.push(Entry { format, factory, check_header });
    }

    /// Match a byte prefix against the registered formats
    pub fn check_type(&self, data: &[u8]) -> TypeCheck {
        if data.len() < 12 {
            return TypeCheck::Maybe;
        }
        let format = ImageFormat::from_bytes(data);
        if self.entries.iter().any(|e| e.format == format) {
            TypeCheck::Yes(format)
        } else {
            TypeCheck::No
        }
    }

    /// Peek declared dimensions out of a stream prefix
    pub fn check_size(&self, data: &[u8]) -> SizeCheck {
        crate::format::check_size(data)
    }

    /// Create a decoder for a known format
    pub fn create_for(&self, format: ImageFormat) -> Option<Box<dyn StreamDecoder>> {
        self.entries
            .iter()
            .find(|e| e.format == format)
            .map(|e| e.factory.create())
    }

    /// Create a decoder for a content-type tag, falling back to the
    /// byte signature when the tag is unknown or contradicted.
    pub fn create_for_stream(&self, content_type: &str, data: &[u8]) -> Option<(ImageFormat, Box<dyn StreamDecoder>)> {
        let tagged = ImageFormat::from_content_type(content_type);
        let sniffed = ImageFormat::from_bytes(data);
        let format = match self.entries.iter().find(|e| e.format == tagged) {
            Some(entry) if !entry.check_header || sniffed == tagged => tagged,
            _ => sniffed,
        };
        let decoder = self.create_for(format)?;
        Some((format, decoder))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
