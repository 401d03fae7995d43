use serde::{Deserialize, Serialize};

use crate::crf::layer::CrfLayer;

/// Owned copy of a CRF's parameters taken after an evaluation pass.
///
/// Later updates to the live layer never affect a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrfSnapshot {
    pub layer: CrfLayer,
    /// Epoch after which the snapshot was taken (1-based, 0 = untrained).
    pub epoch: usize,
    /// Strict dev F1 at that point.
    pub dev_f1: f64,
}

impl CrfSnapshot {
    pub fn capture(layer: &CrfLayer, epoch: usize, dev_f1: f64) -> Self {
        Self {
            layer: layer.clone(),
            epoch,
            dev_f1,
        }
    }

    /// Whether this snapshot scores strictly better than `other`.
    pub fn improves_on(&self, other: &CrfSnapshot) -> bool {
        self.dev_f1 > other.dev_f1
    }
}
