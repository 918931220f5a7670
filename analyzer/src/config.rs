//! Analyzer configuration
//!
//! Every knob has a contractual default; the thresholds and the
//! synthetic grid shape are part of the analyses' observable behavior.

use crate::report::OutputFormat;

/// Threads per warp; the lane id is defined as `tid.x % WARP_SIZE`
pub const WARP_SIZE: i64 = 32;

/// Synthetic launch shape used when evaluating ACFs
#[derive(Debug, Clone, Copy)]
pub struct GridConfig {
    /// Block dimensions (threads per block), x/y/z
    pub ntid: (i64, i64, i64),
    /// Grid dimensions (blocks per grid), x/y/z
    pub nctaid: (i64, i64, i64),
}

impl Default for GridConfig {
    fn default() -> Self {
        Self { ntid: (256, 32, 32), nctaid: (1, 1, 1) }
    }
}

/// Tunable analyzer settings
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Divergence score above which a branch is reported
    pub diverge_threshold: f64,
    /// Memory requests per warp above which an access is reported
    pub coalesce_threshold: f64,
    /// Maximum span of one memory transaction, in bytes
    pub access_size: i64,
    pub grid: GridConfig,
    /// Number of warps sampled per context
    pub warps_sampled: i64,
    /// DAG depth probed when detecting read-modify-write stores
    pub update_probe_depth: u32,
    /// Re-enable stride-based severity classification of coalesce
    /// findings; off by default, leaving severity unknown
    pub classify_stride: bool,
    pub format: OutputFormat,
    /// Print findings without debug locations as raw instruction text
    pub verbose: bool,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            diverge_threshold: 0.1,
            coalesce_threshold: 4.0,
            access_size: 256,
            grid: GridConfig::default(),
            warps_sampled: 8,
            update_probe_depth: 4,
            classify_stride: false,
            format: OutputFormat::default(),
            verbose: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contractual_defaults() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.diverge_threshold, 0.1);
        assert_eq!(config.coalesce_threshold, 4.0);
        assert_eq!(config.access_size, 256);
        assert_eq!(config.grid.ntid, (256, 32, 32));
        assert_eq!(config.grid.nctaid, (1, 1, 1));
        assert_eq!(config.warps_sampled, 8);
        assert_eq!(config.update_probe_depth, 4);
        assert!(!config.classify_stride);
    }
}
