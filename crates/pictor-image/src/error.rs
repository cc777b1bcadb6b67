//! Image subsystem error taxonomy
//!
//! OOM is kept distinct from permanent failures so callers can decide
//! whether a retry (after `reset`) could ever succeed.

use pictor_codec::DecodeError;

/// A failed image load, as recorded on the rep and fanned out to
/// visibility listeners.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImageError {
    /// Allocation failed somewhere in the pipeline. Transient: a later
    /// retry under less pressure may succeed.
    #[error("Out of memory")]
    OutOfMemory,

    /// The stream is structurally invalid. Permanent.
    #[error("Malformed image data: {0}")]
    MalformedData(String),

    /// No registered decoder claims the byte signature.
    #[error("Unrecognized image type")]
    TypeUnrecognized,

    /// End of stream before the dimensions could be determined.
    #[error("Image size could not be determined")]
    SizeUnknown,

    /// Declared dimensions were rejected as unsafely large.
    #[error("Image dimensions {width}x{height} rejected")]
    SizeRejected { width: u32, height: u32 },
}

impl ImageError {
    /// True for errors classified as memory exhaustion (including the
    /// size guard, which refuses allocations that could never fit).
    pub fn is_oom(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::SizeRejected { .. })
    }
}

impl From<DecodeError> for ImageError {
    fn from(err: DecodeError) -> Self {
        match err {
            DecodeError::OutOfMemory => Self::OutOfMemory,
            DecodeError::Malformed(msg) => Self::MalformedData(msg),
            DecodeError::SizeRejected { width, height } => Self::SizeRejected { width, height },
            DecodeError::TypeUnrecognized => Self::TypeUnrecognized,
            DecodeError::Aborted => Self::MalformedData("decode aborted".into()),
        }
    }
}

impl From<pictor_raster::RasterError> for ImageError {
    fn from(err: pictor_raster::RasterError) -> Self {
        use pictor_raster::RasterError;
        match err {
            RasterError::OutOfMemory => Self::OutOfMemory,
            RasterError::SizeTooLarge { width, height } => Self::SizeRejected { width, height },
            other => Self::MalformedData(other.to_string()),
        }
    }
}
