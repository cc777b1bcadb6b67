//! Color management seam
//!
//! The loader applies an ICC transform to decoded scanlines when the
//! stream carried a profile and the embedder supplied a color manager.
//! The CMS itself lives outside this crate; the identity implementation
//! here is what you get without one.

/// A prepared source-to-display transform
pub trait ColorTransform {
    /// Transform a row of RGBA pixels in place
    fn apply(&self, row: &mut [u8]);
}

/// Builds transforms from embedded ICC profiles
pub trait ColorManager {
    /// Returns `None` when the profile is unusable or color management
    /// is disabled; the loader then leaves pixels untouched.
    fn transform_for_profile(&self, icc_profile: &[u8]) -> Option<Box<dyn ColorTransform>>;
}

/// Color manager that never transforms anything
pub struct IdentityColorManager;

impl ColorManager for IdentityColorManager {
    fn transform_for_profile(&self, _icc_profile: &[u8]) -> Option<Box<dyn ColorTransform>> {
        None
    }
}
