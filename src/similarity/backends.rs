//! Similarity backend implementations
//!
//! Every backend computes the same batched cosine similarity; the engine in
//! `mod.rs` picks one at startup and falls back at call granularity. The
//! ndarray backend has no external runtime dependency, which is what makes
//! it the guaranteed terminal path.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use ndarray::{Array2, ArrayView1, Axis};

/// A concrete numerical implementation of batched cosine similarity.
pub trait SimilarityBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// result[i] = cos(query, candidates[i]). Inputs are never mutated;
    /// the output has the same cardinality and order as `candidates`.
    fn cosine_batch(&self, query: &[f32], candidates: &[Vec<f32>]) -> Result<Vec<f32>>;
}

/// Tensor backend on a candle accelerator device.
pub struct CandleBackend {
    device: Device,
    name: &'static str,
}

impl CandleBackend {
    /// CUDA device 0. Errors when no CUDA device is present or the `cuda`
    /// feature is not compiled in.
    pub fn cuda() -> Result<Self> {
        let backend = Self {
            device: Device::new_cuda(0)?,
            name: "candle-cuda",
        };
        backend.probe()?;
        Ok(backend)
    }

    /// Metal device 0 (Apple silicon).
    pub fn metal() -> Result<Self> {
        let backend = Self {
            device: Device::new_metal(0)?,
            name: "candle-metal",
        };
        backend.probe()?;
        Ok(backend)
    }

    #[cfg(test)]
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            name: "candle-cpu",
        }
    }

    /// Trivial small-vector norm on the device; any failure means the
    /// backend is unusable and selection moves on.
    fn probe(&self) -> Result<()> {
        let t = Tensor::new(&[3.0f32, 4.0], &self.device)?;
        let norm = t.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
        if (norm - 5.0).abs() > 1e-3 {
            bail!("{} probe produced {norm}, expected 5.0", self.name);
        }
        Ok(())
    }
}

impl SimilarityBackend for CandleBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn cosine_batch(&self, query: &[f32], candidates: &[Vec<f32>]) -> Result<Vec<f32>> {
        let n = candidates.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let flat = flatten_checked(query.len(), candidates)?;

        let d = query.len();
        let q = Tensor::from_slice(query, (1, d), &self.device)?;
        let m = Tensor::from_slice(&flat, (n, d), &self.device)?;

        let dots = q.matmul(&m.t()?.contiguous()?)?.squeeze(0)?;
        let q_norm: f32 = q.sqr()?.sum_all()?.sqrt()?.to_scalar()?;
        let norms = m.sqr()?.sum(1)?.sqrt()?;
        let denom = norms.affine(f64::from(q_norm), 0.0)?;
        let scores = dots.broadcast_div(&denom)?.to_vec1::<f32>()?;

        // Zero-norm rows divide to non-finite values; score them 0 the way
        // the scalar path does.
        Ok(scores
            .into_iter()
            .map(|s| if s.is_finite() { s } else { 0.0 })
            .collect())
    }
}

/// Plain ndarray implementation; the terminal fallback.
pub struct NdarrayBackend;

impl SimilarityBackend for NdarrayBackend {
    fn name(&self) -> &'static str {
        "ndarray"
    }

    fn cosine_batch(&self, query: &[f32], candidates: &[Vec<f32>]) -> Result<Vec<f32>> {
        let n = candidates.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        let flat = flatten_checked(query.len(), candidates)?;

        let m = Array2::from_shape_vec((n, query.len()), flat)?;
        let q = ArrayView1::from(query);
        let q_norm = q.dot(&q).sqrt();
        let dots = m.dot(&q);
        let norms = m.map_axis(Axis(1), |row| row.dot(&row).sqrt());

        Ok(dots
            .iter()
            .zip(norms.iter())
            .map(|(&dot, &norm)| {
                if q_norm > 0.0 && norm > 0.0 {
                    dot / (q_norm * norm)
                } else {
                    0.0
                }
            })
            .collect())
    }
}

fn flatten_checked(dim: usize, candidates: &[Vec<f32>]) -> Result<Vec<f32>> {
    let mut flat = Vec::with_capacity(candidates.len() * dim);
    for (i, row) in candidates.iter().enumerate() {
        if row.len() != dim {
            bail!(
                "candidate {i} has dimension {}, expected {dim}",
                row.len()
            );
        }
        flat.extend_from_slice(row);
    }
    Ok(flat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::math::{cosine_similarity, l2_normalize};

    /// Deterministic pseudo-random unit vector.
    fn unit_vector(dim: usize, seed: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim)
            .map(|i| (((i * 31 + seed * 17 + 7) as f32) * 0.37).sin())
            .collect();
        l2_normalize(&mut v);
        v
    }

    #[test]
    fn test_ndarray_empty_candidates() {
        let scores = NdarrayBackend
            .cosine_batch(&unit_vector(16, 1), &[])
            .unwrap();
        assert!(scores.is_empty());
    }

    #[test]
    fn test_ndarray_identical_vector_scores_one() {
        let q = unit_vector(512, 3);
        let scores = NdarrayBackend.cosine_batch(&q, &[q.clone()]).unwrap();
        assert_eq!(scores.len(), 1);
        assert!((scores[0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_ndarray_scale_invariance() {
        let q = unit_vector(64, 5);
        let candidate = unit_vector(64, 9);
        let scaled: Vec<f32> = candidate.iter().map(|x| x * 3.5).collect();

        let scores = NdarrayBackend
            .cosine_batch(&q, &[candidate, scaled])
            .unwrap();
        assert!((scores[0] - scores[1]).abs() < 1e-6);
    }

    #[test]
    fn test_ndarray_zero_norm_candidate() {
        let q = unit_vector(8, 2);
        let scores = NdarrayBackend.cosine_batch(&q, &[vec![0.0; 8]]).unwrap();
        assert_eq!(scores[0], 0.0);
    }

    #[test]
    fn test_ndarray_matches_scalar_reference() {
        let q = unit_vector(512, 11);
        let candidates: Vec<Vec<f32>> = (0..8).map(|i| unit_vector(512, i)).collect();

        let scores = NdarrayBackend.cosine_batch(&q, &candidates).unwrap();
        assert_eq!(scores.len(), candidates.len());
        for (score, candidate) in scores.iter().zip(&candidates) {
            let reference = cosine_similarity(&q, candidate);
            assert!(
                (score - reference).abs() < 1e-6,
                "ndarray {score} vs scalar {reference}"
            );
        }
    }

    #[test]
    fn test_ndarray_dimension_mismatch_errors() {
        let q = unit_vector(8, 1);
        let err = NdarrayBackend
            .cosine_batch(&q, &[vec![1.0; 4]])
            .unwrap_err();
        assert!(err.to_string().contains("dimension"));
    }

    #[test]
    fn test_candle_cpu_matches_ndarray() {
        let q = unit_vector(512, 21);
        let candidates: Vec<Vec<f32>> = (0..6).map(|i| unit_vector(512, i + 40)).collect();

        let candle = CandleBackend::cpu().cosine_batch(&q, &candidates).unwrap();
        let reference = NdarrayBackend.cosine_batch(&q, &candidates).unwrap();

        assert_eq!(candle.len(), reference.len());
        for (a, b) in candle.iter().zip(&reference) {
            assert!((a - b).abs() < 1e-6, "candle {a} vs ndarray {b}");
        }
    }

    #[test]
    fn test_candle_cpu_zero_norm_candidate() {
        let q = unit_vector(8, 2);
        let scores = CandleBackend::cpu()
            .cosine_batch(&q, &[vec![0.0; 8], q.clone()])
            .unwrap();
        assert_eq!(scores[0], 0.0);
        assert!((scores[1] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_accelerated_probe_fails_without_hardware() {
        // CPU-only builds have no CUDA device to probe; selection must be
        // able to treat this as "unavailable" rather than a crash.
        if cfg!(not(feature = "cuda")) {
            assert!(CandleBackend::cuda().is_err());
        }
    }
}
