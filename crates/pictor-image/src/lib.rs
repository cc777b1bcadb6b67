//! Image loading and caching for Pictor.
//!
//! This crate turns streaming resource bytes into displayable rasters
//! and keeps the decoded pixels under a memory budget. The pieces:
//!
//! - [`loader::ImageLoader`] pulls bytes from a [`provider::ContentProvider`]
//!   through a `pictor-codec` decoder into [`content::ImgContent`].
//! - [`content::ImgContent`] models the load lifecycle (no dimensions,
//!   dimensions known, single frame, animation) as a closed state
//!   machine, with [`animated::AnimatedContent`] compositing animation
//!   frames per viewer.
//! - [`manager::ImageManager`] owns the cache: one rep per source,
//!   LRU eviction under a byte budget, grace windows for images that
//!   just scrolled off, lock deferral around raw pixel access, and a
//!   cooperative pending queue for incremental decoding.
//!
//! Everything is single-threaded; shared rasters are `Rc<RefCell<_>>`.

pub mod animated;
pub mod color;
pub mod config;
pub mod content;
pub mod error;
pub mod loader;
pub mod manager;
pub mod provider;
pub mod rep;

use pictor_raster::Bitmap;
use std::cell::RefCell;
use std::rc::Rc;

/// A raster shared between content, composites and paint callers
pub type SharedBitmap = Rc<RefCell<Bitmap>>;

/// Identifies one viewer of an image (an element showing it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

pub use config::{CacheConfig, EvictionPolicy};
pub use content::{ContentKind, Effect};
pub use error::ImageError;
pub use loader::LoadStatus;
pub use manager::{CacheStats, ImageManager};
pub use provider::{ContentProvider, MemoryProvider, ProviderId};
pub use rep::{Image, ImageListener};
