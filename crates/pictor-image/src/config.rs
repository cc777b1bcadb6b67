//! Cache configuration
//!
//! Budget and policy knobs for the image cache, serde-derived so the
//! embedder's settings layer can load them directly.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which reps the evictor may clear under budget pressure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Only invisible, unlocked, out-of-grace reps that are not
    /// actively loading
    #[default]
    Soft,
    /// Any unlocked invisible rep, including ones still loading
    Strict,
}

/// Image cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget for decoded pixel memory, in bytes
    pub cache_size: usize,
    /// Eviction policy mode
    pub policy: EvictionPolicy,
    /// How long a just-invisible rep stays exempt from eviction
    pub grace_time: Duration,
    /// Evict reps unused longer than this regardless of budget
    pub cache_timeout: Option<Duration>,
    /// Separate, tighter budget for composited animation frames
    pub animation_cache_size: Option<usize>,
    /// Allow speculative decode of off-screen images while headroom
    /// remains
    pub predecode: bool,
    /// Fraction of the cache that must be free for predecoding to run
    /// (0.0 - 1.0)
    pub predecode_headroom: f32,
    /// Decode at most this many bytes per cooperative step; `None`
    /// decodes everything available in one call
    pub decode_step_bytes: Option<usize>,
    /// Store scanlines premultiplied by alpha
    pub premultiply_alpha: bool,
    /// Keep composited animation frames for canvases up to this many
    /// pixels even when no viewer is showing them
    pub retain_composite_below_px: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 32 * 1024 * 1024,
            policy: EvictionPolicy::Soft,
            grace_time: Duration::from_millis(500),
            cache_timeout: None,
            animation_cache_size: None,
            predecode: true,
            predecode_headroom: 0.25,
            decode_step_bytes: None,
            premultiply_alpha: false,
            retain_composite_below_px: 64 * 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.policy, EvictionPolicy::Soft);
        assert!(config.cache_size > 0);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"cache_size": 1024, "policy": "strict"}"#).unwrap();
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.policy, EvictionPolicy::Strict);
        assert!(config.predecode);
    }
}
