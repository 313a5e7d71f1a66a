//! Similarity calculation engine
//!
//! Selects a numerical backend once at startup by probing in a fixed
//! priority order (CUDA, Metal, plain ndarray) and exposes one batched
//! cosine-similarity operation. A backend failure during an actual call is
//! recovered by re-executing that call on the ndarray path; callers never
//! see a similarity backend error.

mod backends;

pub use backends::{CandleBackend, NdarrayBackend, SimilarityBackend};

use serde::Serialize;
use tracing::{debug, error, info, warn};

/// Backend availability report for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct SimilarityInfo {
    pub gpu_available: bool,
    pub device: String,
    pub cuda_available: bool,
    pub metal_available: bool,
}

pub struct SimilarityEngine {
    primary: Box<dyn SimilarityBackend>,
    fallback: NdarrayBackend,
    info: SimilarityInfo,
}

impl SimilarityEngine {
    /// Probe backends in priority order and select the first available one.
    /// Probe failures are expected on machines without the matching
    /// accelerator and only demote the backend, never fail construction.
    pub fn new() -> Self {
        let cuda = CandleBackend::cuda()
            .map_err(|e| debug!("CUDA similarity backend unavailable: {e}"))
            .ok();
        let metal = CandleBackend::metal()
            .map_err(|e| debug!("Metal similarity backend unavailable: {e}"))
            .ok();

        let cuda_available = cuda.is_some();
        let metal_available = metal.is_some();

        let (primary, gpu_available): (Box<dyn SimilarityBackend>, bool) = if let Some(b) = cuda {
            (Box::new(b), true)
        } else if let Some(b) = metal {
            (Box::new(b), true)
        } else {
            (Box::new(NdarrayBackend), false)
        };

        info!(
            "Similarity engine initialized - backend: {}, gpu: {}",
            primary.name(),
            gpu_available
        );

        Self {
            info: SimilarityInfo {
                gpu_available,
                device: primary.name().to_string(),
                cuda_available,
                metal_available,
            },
            primary,
            fallback: NdarrayBackend,
        }
    }

    #[cfg(test)]
    fn with_primary(primary: Box<dyn SimilarityBackend>) -> Self {
        Self {
            info: SimilarityInfo {
                gpu_available: false,
                device: primary.name().to_string(),
                cuda_available: false,
                metal_available: false,
            },
            primary,
            fallback: NdarrayBackend,
        }
    }

    /// Batched cosine similarity of `query` against every candidate row.
    ///
    /// Output length and order match `candidates`; inputs are not mutated.
    /// A primary-backend failure falls back to the ndarray path for this
    /// call only; if even that fails, the scores degrade to zeros.
    pub fn cosine_similarity_batch(&self, query: &[f32], candidates: &[Vec<f32>]) -> Vec<f32> {
        if candidates.is_empty() {
            return Vec::new();
        }
        match self.primary.cosine_batch(query, candidates) {
            Ok(scores) => scores,
            Err(e) => {
                warn!(
                    "similarity backend {} failed, retrying on {}: {e}",
                    self.primary.name(),
                    self.fallback.name()
                );
                self.fallback
                    .cosine_batch(query, candidates)
                    .unwrap_or_else(|e| {
                        error!("fallback similarity computation failed: {e}");
                        vec![0.0; candidates.len()]
                    })
            }
        }
    }

    pub fn info(&self) -> SimilarityInfo {
        self.info.clone()
    }
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new()
    }
}
