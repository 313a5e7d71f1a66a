//! Dynamic batch scheduler
//!
//! Processes a caller-supplied list of images with a capped set of workers
//! pulling from a shared pending list: the moment one image finishes, its
//! worker claims the next, so uneven per-image latency never leaves the
//! accelerator idle behind a straggler. Without an accelerator the batch
//! degenerates to strictly sequential processing, since concurrent
//! CPU-bound contention would not help.
//!
//! The scheduler runs independently of the request worker pool; both
//! compete for the same accelerator. Bulk work submitted here is not
//! admission-gated against interactive requests.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::BatchConfig;
use crate::engine::extractor::{Face, FaceExtractor};
use crate::engine::preprocess;

/// Upper bound on concurrent batch workers regardless of configuration.
pub const BATCH_WORKER_CAP: usize = 16;

/// Progress event published every `progress_every` completions and at batch
/// end.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
}

struct BatchState {
    results: HashMap<PathBuf, Vec<Face>>,
    completed: usize,
}

pub struct BatchScheduler {
    extractor: Arc<dyn FaceExtractor>,
    max_concurrent: usize,
    progress_every: usize,
    stop: Arc<AtomicBool>,
    progress_tx: watch::Sender<BatchProgress>,
}

impl BatchScheduler {
    pub fn new(extractor: Arc<dyn FaceExtractor>, config: &BatchConfig) -> Self {
        let (progress_tx, _) = watch::channel(BatchProgress::default());
        Self {
            extractor,
            max_concurrent: config.max_concurrent.max(1),
            progress_every: config.progress_every.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            progress_tx,
        }
    }

    /// Observe batch progress without waiting for the batch to finish.
    pub fn subscribe(&self) -> watch::Receiver<BatchProgress> {
        self.progress_tx.subscribe()
    }

    /// Stop claiming new items. An item already being processed finishes
    /// and its result is recorded.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Process every input, returning one entry per input path. Failed
    /// items map to an empty face list; a single failure never aborts the
    /// batch.
    pub async fn process_batch(&self, inputs: Vec<PathBuf>) -> HashMap<PathBuf, Vec<Face>> {
        if inputs.is_empty() {
            return HashMap::new();
        }
        self.stop.store(false, Ordering::Release);

        if !self.extractor.is_accelerated() {
            return self.process_sequential(inputs).await;
        }

        let total = inputs.len();
        let started = Instant::now();
        let workers = self.max_concurrent.min(total).min(BATCH_WORKER_CAP);
        info!("Starting dynamic batch: {total} images, {workers} workers");

        let pending = Arc::new(Mutex::new(VecDeque::from(inputs)));
        let state = Arc::new(Mutex::new(BatchState {
            results: HashMap::with_capacity(total),
            completed: 0,
        }));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(tokio::spawn(batch_worker(
                pending.clone(),
                state.clone(),
                self.extractor.clone(),
                self.stop.clone(),
                self.progress_tx.clone(),
                self.progress_every,
                total,
            )));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("batch worker task failed: {e}");
            }
        }

        let mut state = state.lock();
        let results = std::mem::take(&mut state.results);
        let elapsed = started.elapsed().as_secs_f64();
        let rate = state.completed as f64 / elapsed.max(f64::EPSILON);
        info!(
            "Dynamic batch finished: {}/{} images in {:.2}s ({:.1} images/sec)",
            state.completed, total, elapsed, rate
        );
        results
    }

    async fn process_sequential(&self, inputs: Vec<PathBuf>) -> HashMap<PathBuf, Vec<Face>> {
        let total = inputs.len();
        let mut results = HashMap::with_capacity(total);
        for (i, path) in inputs.into_iter().enumerate() {
            let faces = match extract_one(&self.extractor, &path).await {
                Ok(faces) => faces,
                Err(e) => {
                    warn!("batch item {} failed: {e}", path.display());
                    Vec::new()
                }
            };
            results.insert(path, faces);

            let completed = i + 1;
            if completed % self.progress_every == 0 || completed == total {
                let _ = self.progress_tx.send(BatchProgress { completed, total });
                info!("Sequential batch progress: {completed}/{total}");
            }
        }
        results
    }
}

async fn batch_worker(
    pending: Arc<Mutex<VecDeque<PathBuf>>>,
    state: Arc<Mutex<BatchState>>,
    extractor: Arc<dyn FaceExtractor>,
    stop: Arc<AtomicBool>,
    progress_tx: watch::Sender<BatchProgress>,
    progress_every: usize,
    total: usize,
) {
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        // Atomic claim: each input is taken by exactly one worker.
        let Some(path) = pending.lock().pop_front() else {
            break;
        };

        let faces = match extract_one(&extractor, &path).await {
            Ok(faces) => faces,
            Err(e) => {
                warn!("batch item {} failed: {e}", path.display());
                Vec::new()
            }
        };

        let completed = {
            let mut state = state.lock();
            state.results.insert(path, faces);
            state.completed += 1;
            // Published under the lock so progress stays monotonic across
            // workers.
            if state.completed % progress_every == 0 || state.completed == total {
                let _ = progress_tx.send(BatchProgress {
                    completed: state.completed,
                    total,
                });
            }
            state.completed
        };

        if completed % progress_every == 0 || completed == total {
            info!("Batch progress: {completed}/{total}");
        }
    }
}

async fn extract_one(
    extractor: &Arc<dyn FaceExtractor>,
    path: &Path,
) -> anyhow::Result<Vec<Face>> {
    let bytes = tokio::fs::read(path).await?;
    let extractor = extractor.clone();
    tokio::task::spawn_blocking(move || {
        let image = preprocess::decode_image(&bytes)?;
        extractor.extract(&image)
    })
    .await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::extractor::{BoundingBox, ExtractorInfo};
    use image::DynamicImage;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc as std_mpsc;

    fn batch_config(max_concurrent: usize) -> BatchConfig {
        BatchConfig {
            max_concurrent,
            progress_every: 1,
        }
    }

    fn png_file(dir: &Path, name: &str) -> PathBuf {
        let img = DynamicImage::new_rgb8(8, 8);
        let mut buffer = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buffer, image::ImageFormat::Png).unwrap();
        let path = dir.join(name);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&buffer.into_inner())
            .unwrap();
        path
    }

    fn test_face() -> Face {
        Face {
            bbox: BoundingBox {
                x1: 0.0,
                y1: 0.0,
                x2: 10.0,
                y2: 10.0,
            },
            landmarks: Vec::new(),
            embedding: vec![1.0, 0.0, 0.0, 0.0],
            confidence: 0.9,
        }
    }

    /// Counts how often each image is claimed and how many extractions run
    /// at once.
    struct TrackingExtractor {
        accelerated: bool,
        running: AtomicUsize,
        max_running: AtomicUsize,
        calls: AtomicUsize,
    }

    impl TrackingExtractor {
        fn new(accelerated: bool) -> Arc<Self> {
            Arc::new(Self {
                accelerated,
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl FaceExtractor for TrackingExtractor {
        fn extract(&self, _image: &DynamicImage) -> anyhow::Result<Vec<Face>> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(20));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![test_face()])
        }

        fn info(&self) -> ExtractorInfo {
            ExtractorInfo {
                model_name: "tracking".to_string(),
                model_loaded: true,
                using_gpu: self.accelerated,
                device_info: "test".to_string(),
            }
        }

        fn is_accelerated(&self) -> bool {
            self.accelerated
        }
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let extractor = TrackingExtractor::new(true);
        let scheduler = BatchScheduler::new(extractor, &batch_config(4));
        let results = scheduler.process_batch(Vec::new()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_one_result_per_input_with_fewer_workers() {
        let dir = tempfile::tempdir().unwrap();
        let mut inputs: Vec<PathBuf> = (0..6)
            .map(|i| png_file(dir.path(), &format!("img_{i}.png")))
            .collect();
        // Two unreadable inputs fail but still get result entries.
        inputs.push(dir.path().join("missing_a.png"));
        inputs.push(dir.path().join("missing_b.png"));

        let extractor = TrackingExtractor::new(true);
        let scheduler = BatchScheduler::new(extractor.clone(), &batch_config(2));
        let results = scheduler.process_batch(inputs.clone()).await;

        assert_eq!(results.len(), inputs.len());
        for path in &inputs {
            assert!(results.contains_key(path), "missing entry for {path:?}");
        }
        assert!(results[&inputs[0]].len() == 1);
        assert!(results[&dir.path().join("missing_a.png")].is_empty());

        // Each readable input was claimed exactly once.
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 6);
        // With 2 workers, at most 2 extractions ran concurrently.
        assert!(extractor.max_running.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_sequential_fallback_without_accelerator() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> = (0..5)
            .map(|i| png_file(dir.path(), &format!("img_{i}.png")))
            .collect();

        let extractor = TrackingExtractor::new(false);
        let scheduler = BatchScheduler::new(extractor.clone(), &batch_config(4));
        let results = scheduler.process_batch(inputs.clone()).await;

        assert_eq!(results.len(), 5);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 5);
        assert_eq!(extractor.max_running.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_progress_reaches_total() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> = (0..4)
            .map(|i| png_file(dir.path(), &format!("img_{i}.png")))
            .collect();

        let extractor = TrackingExtractor::new(true);
        let scheduler = BatchScheduler::new(extractor, &batch_config(2));
        let progress = scheduler.subscribe();
        let results = scheduler.process_batch(inputs).await;

        assert_eq!(results.len(), 4);
        let last = *progress.borrow();
        assert_eq!(last.completed, 4);
        assert_eq!(last.total, 4);
    }

    /// Extractor that blocks until the test releases it, so the stop flag
    /// can be flipped while an item is in flight.
    struct GateExtractor {
        gate: std::sync::Mutex<std_mpsc::Receiver<()>>,
    }

    impl FaceExtractor for GateExtractor {
        fn extract(&self, _image: &DynamicImage) -> anyhow::Result<Vec<Face>> {
            self.gate.lock().unwrap().recv().ok();
            Ok(vec![test_face()])
        }

        fn info(&self) -> ExtractorInfo {
            ExtractorInfo {
                model_name: "gate".to_string(),
                model_loaded: true,
                using_gpu: true,
                device_info: "test".to_string(),
            }
        }

        fn is_accelerated(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_stop_prevents_new_claims() {
        let dir = tempfile::tempdir().unwrap();
        let inputs: Vec<PathBuf> = (0..3)
            .map(|i| png_file(dir.path(), &format!("img_{i}.png")))
            .collect();

        let (tx, rx) = std_mpsc::channel();
        let extractor = Arc::new(GateExtractor {
            gate: std::sync::Mutex::new(rx),
        });
        let scheduler = Arc::new(BatchScheduler::new(extractor, &batch_config(1)));

        let runner = scheduler.clone();
        let task = tokio::spawn(async move { runner.process_batch(inputs).await });

        // Wait for the single worker to start on the first item, then stop.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        scheduler.stop();
        // Release every item in case more were claimed before the stop.
        for _ in 0..3 {
            let _ = tx.send(());
        }

        let results = task.await.unwrap();
        // The in-flight item finished and was recorded; the rest were never
        // claimed.
        assert_eq!(results.len(), 1);
    }
}
