//! # Evaluation Configuration

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::eval::matcher::{OverlapPolicy, SpanMatcher, validate_ratio};

/// Overlap ratio that only accepts (near-)identical span boundaries.
pub const STRICT_OVERLAP: f64 = 0.999;

/// Overlap ratio under which half-overlapping spans count as matches.
pub const LENIENT_OVERLAP: f64 = 0.5;

/// Settings for scoring a corpus.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// Minimum overlap score, in `(0, 1]`, for a candidate match.
    pub overlap_ratio: f64,
    /// Denominator used for the overlap score.
    pub overlap_policy: OverlapPolicy,
    /// Score sentences on the rayon thread pool.
    pub parallel: bool,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            overlap_ratio: STRICT_OVERLAP,
            overlap_policy: OverlapPolicy::MaxLength,
            parallel: false,
        }
    }
}

impl EvalConfig {
    /// Strict matching with the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lenient (50% overlap) matching with the default policy.
    pub fn lenient() -> Self {
        Self::default().with_overlap_ratio(LENIENT_OVERLAP)
    }

    /// Set the overlap ratio. It is validated when a matcher is built.
    pub fn with_overlap_ratio(mut self, overlap_ratio: f64) -> Self {
        self.overlap_ratio = overlap_ratio;
        self
    }

    pub fn with_overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.overlap_policy = policy;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Check the overlap ratio is in `(0, 1]`.
    pub fn validate(&self) -> Result<()> {
        validate_ratio(self.overlap_ratio)
    }

    /// Build the matcher described by this configuration.
    pub fn matcher(&self) -> Result<SpanMatcher> {
        Ok(SpanMatcher::new(self.overlap_ratio)?.with_policy(self.overlap_policy))
    }
}
