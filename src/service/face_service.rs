//! Face Service - Core business logic
//!
//! Owns the embedding backend, the worker pool, the similarity engine, and
//! the batch scheduler. Built once during startup and shared with request
//! handlers; nothing here is created lazily on the request path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use image::DynamicImage;
use tracing::debug;

use crate::config::Config;
use crate::engine::{
    preprocess, BatchScheduler, Face, FaceExtractor, InputRef, Resolver, WorkerPool,
};
use crate::error::ServiceError;
use crate::similarity::SimilarityEngine;

use super::types::*;

/// Face embedding service
pub struct FaceService {
    extractor: Arc<dyn FaceExtractor>,
    pool: WorkerPool,
    similarity: SimilarityEngine,
    batch: BatchScheduler,
    config: Config,
}

impl FaceService {
    /// Build the full service context: resolver, worker pool, similarity
    /// engine, and batch scheduler.
    pub fn new(extractor: Arc<dyn FaceExtractor>, config: Config) -> Result<Self> {
        let resolver = Arc::new(Resolver::new(&config.fetch)?);
        let pool = WorkerPool::start(
            &config.queue,
            extractor.clone(),
            resolver,
            config.inference.effective_max_image_dim(),
        );
        let similarity = SimilarityEngine::new();
        let batch = BatchScheduler::new(extractor.clone(), &config.batch);

        Ok(Self {
            extractor,
            pool,
            similarity,
            batch,
            config,
        })
    }

    /// Process a single photo reference through the job queue and return
    /// the detected faces with their embeddings.
    pub async fn process_photo(&self, reference: &str) -> Result<Vec<Face>, ServiceError> {
        let input = InputRef::classify(reference, &self.config.fetch.remote_domain);
        debug!("processing photo {input}");
        self.pool.process(input).await
    }

    /// Compare a base64-encoded selfie against caller-supplied embeddings.
    ///
    /// Similarity queries bypass the job queue: the selfie is embedded
    /// inline and the candidates are scored directly by the similarity
    /// engine. Matches come back sorted by similarity, descending.
    pub async fn compare_faces(
        &self,
        selfie_data: &str,
        candidates: &[Candidate],
    ) -> Result<Vec<FaceMatch>, ServiceError> {
        let image = decode_selfie(selfie_data)?;

        let extractor = self.extractor.clone();
        let faces = tokio::task::spawn_blocking(move || extractor.extract(&image))
            .await
            .map_err(|e| anyhow!("selfie inference task aborted: {e}"))??;

        if faces.is_empty() {
            return Err(ServiceError::Validation(
                "No face detected in selfie".to_string(),
            ));
        }

        // The extractor orders detections by confidence; score against the
        // first face.
        let query = &faces[0].embedding;
        for candidate in candidates {
            if candidate.embedding.len() != query.len() {
                return Err(ServiceError::Validation(format!(
                    "embedding for {} has dimension {}, expected {}",
                    candidate.photo_id,
                    candidate.embedding.len(),
                    query.len()
                )));
            }
        }

        let embeddings: Vec<Vec<f32>> = candidates.iter().map(|c| c.embedding.clone()).collect();
        let scores = self.similarity.cosine_similarity_batch(query, &embeddings);

        let mut matches: Vec<FaceMatch> = candidates
            .iter()
            .zip(scores)
            .map(|(candidate, similarity)| FaceMatch {
                photo_id: candidate.photo_id.clone(),
                similarity,
            })
            .collect();
        matches.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));

        Ok(matches)
    }

    /// Run a bulk workload through the dynamic batch scheduler.
    pub async fn process_batch(&self, inputs: Vec<PathBuf>) -> HashMap<PathBuf, Vec<Face>> {
        self.batch.process_batch(inputs).await
    }

    pub fn batch(&self) -> &BatchScheduler {
        &self.batch
    }

    pub fn health(&self) -> Result<HealthInfo> {
        self.extractor.ready()?;
        let info = self.extractor.info();
        Ok(HealthInfo {
            gpu_acceleration: info.using_gpu,
            device: info.device_info,
            model_loaded: info.model_loaded,
        })
    }

    pub fn status(&self) -> StatusInfo {
        StatusInfo {
            model_info: self.extractor.info(),
            performance_stats: self.pool.stats(),
            similarity_calculator: self.similarity.info(),
        }
    }

    pub async fn shutdown(&self) {
        self.batch.stop();
        self.pool.shutdown().await;
    }
}

/// Decode a base64 selfie, tolerating an optional `data:...;base64,` prefix.
fn decode_selfie(selfie_data: &str) -> Result<DynamicImage, ServiceError> {
    let raw = selfie_data
        .split_once(',')
        .map(|(_, data)| data)
        .unwrap_or(selfie_data);
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(raw.trim())
        .context("invalid base64 selfie data")
        .map_err(ServiceError::Internal)?;
    preprocess::decode_image(&bytes)
        .context("could not decode selfie image")
        .map_err(ServiceError::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::extractor::{BoundingBox, ExtractorInfo};
    use crate::utils::math::l2_normalize;
    use base64::Engine as _;
    use std::io::Cursor;

    fn unit_vector(dim: usize, seed: usize) -> Vec<f32> {
        let mut v: Vec<f32> = (0..dim)
            .map(|i| (((i * 7 + seed * 41 + 5) as f32) * 0.61).sin())
            .collect();
        l2_normalize(&mut v);
        v
    }

    fn selfie_base64() -> String {
        let img = DynamicImage::new_rgb8(16, 16);
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
        base64::engine::general_purpose::STANDARD.encode(buffer.into_inner())
    }

    struct FixedExtractor {
        faces: Vec<Face>,
    }

    impl FixedExtractor {
        fn with_embedding(embedding: Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                faces: vec![Face {
                    bbox: BoundingBox {
                        x1: 0.0,
                        y1: 0.0,
                        x2: 16.0,
                        y2: 16.0,
                    },
                    landmarks: Vec::new(),
                    embedding,
                    confidence: 0.99,
                }],
            })
        }

        fn empty() -> Arc<Self> {
            Arc::new(Self { faces: Vec::new() })
        }
    }

    impl FaceExtractor for FixedExtractor {
        fn extract(&self, _image: &DynamicImage) -> anyhow::Result<Vec<Face>> {
            Ok(self.faces.clone())
        }

        fn info(&self) -> ExtractorInfo {
            ExtractorInfo {
                model_name: "fixed".to_string(),
                model_loaded: true,
                using_gpu: false,
                device_info: "cpu".to_string(),
            }
        }

        fn is_accelerated(&self) -> bool {
            false
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.queue.workers = 2;
        config.queue.capacity = 8;
        config.queue.soft_limit = 6;
        config.queue.result_timeout_ms = 2_000;
        config.queue.poll_timeout_ms = 50;
        config.fetch.lookup_base_url = "http://127.0.0.1:1/api/images".to_string();
        config
    }

    #[tokio::test]
    async fn test_compare_faces_sorted_descending() {
        let query = unit_vector(512, 1);
        let service =
            FaceService::new(FixedExtractor::with_embedding(query.clone()), test_config())
                .unwrap();

        let candidates = vec![
            Candidate {
                photo_id: "c1".to_string(),
                embedding: unit_vector(512, 8),
            },
            Candidate {
                photo_id: "c2".to_string(),
                embedding: query,
            },
            Candidate {
                photo_id: "c3".to_string(),
                embedding: unit_vector(512, 9),
            },
        ];

        let matches = service
            .compare_faces(&selfie_base64(), &candidates)
            .await
            .unwrap();

        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].photo_id, "c2");
        assert!((matches[0].similarity - 1.0).abs() < 1e-5);
        assert!(matches[0].similarity >= matches[1].similarity);
        assert!(matches[1].similarity >= matches[2].similarity);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_compare_faces_no_face_detected() {
        let service = FaceService::new(FixedExtractor::empty(), test_config()).unwrap();

        let err = service
            .compare_faces(
                &selfie_base64(),
                &[Candidate {
                    photo_id: "c1".to_string(),
                    embedding: unit_vector(512, 2),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        assert!(err.to_string().contains("No face detected"));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_compare_faces_dimension_mismatch() {
        let service = FaceService::new(
            FixedExtractor::with_embedding(unit_vector(512, 1)),
            test_config(),
        )
        .unwrap();

        let err = service
            .compare_faces(
                &selfie_base64(),
                &[Candidate {
                    photo_id: "c1".to_string(),
                    embedding: vec![1.0; 128],
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_compare_faces_data_url_prefix() {
        let query = unit_vector(512, 1);
        let service =
            FaceService::new(FixedExtractor::with_embedding(query.clone()), test_config())
                .unwrap();

        let selfie = format!("data:image/png;base64,{}", selfie_base64());
        let matches = service
            .compare_faces(
                &selfie,
                &[Candidate {
                    photo_id: "c1".to_string(),
                    embedding: query,
                }],
            )
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_compare_faces_bad_base64_is_internal() {
        let service = FaceService::new(
            FixedExtractor::with_embedding(unit_vector(512, 1)),
            test_config(),
        )
        .unwrap();

        let err = service
            .compare_faces("@@not-base64@@", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let service = FaceService::new(FixedExtractor::empty(), test_config()).unwrap();

        let health = service.health().unwrap();
        assert!(!health.gpu_acceleration);
        assert!(health.model_loaded);

        let status = service.status();
        assert_eq!(status.model_info.model_name, "fixed");
        assert_eq!(status.performance_stats.total_processed, 0);
        service.shutdown().await;
    }
}
