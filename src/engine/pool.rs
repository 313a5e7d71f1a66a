//! Job queue and worker pool
//!
//! A bounded queue of single-image jobs consumed by a fixed set of workers.
//! Enqueue is rejected up front once the queued depth crosses the soft
//! limit, so callers get an explicit overload signal instead of blocking
//! behind a full buffer. A caller that stops waiting does not cancel its
//! job: the worker runs the job to completion and the result is discarded.
//!
//! Every per-job failure is turned into an error result inside the worker;
//! workers only exit on a stop sentinel or when the queue closes.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::engine::extractor::{Face, FaceExtractor};
use crate::engine::preprocess;
use crate::engine::resolve::{InputRef, Resolver};
use crate::error::{JobError, ServiceError};

/// A single inference job.
///
/// Owned by the queue from enqueue until a worker claims it; ownership then
/// moves to the worker for the job's duration.
pub struct Job {
    pub id: Uuid,
    pub input: InputRef,
    pub enqueued_at: Instant,
}

type JobReply = oneshot::Sender<Result<Vec<Face>, JobError>>;

enum QueueItem {
    Job(Box<Job>, JobReply),
    Stop,
}

/// Handle for awaiting one job's result. The result is delivered exactly
/// once over the job's dedicated channel.
#[derive(Debug)]
pub struct ResultHandle {
    pub job_id: Uuid,
    rx: oneshot::Receiver<Result<Vec<Face>, JobError>>,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    faces: AtomicU64,
    busy_ms: AtomicU64,
    in_flight: AtomicUsize,
}

/// Point-in-time pool statistics for `/status`.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub total_submitted: u64,
    pub total_processed: u64,
    pub total_errors: u64,
    pub total_faces: u64,
    pub avg_processing_ms: u64,
}

struct WorkerCtx {
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    depth: Arc<AtomicUsize>,
    counters: Arc<Counters>,
    extractor: Arc<dyn FaceExtractor>,
    resolver: Arc<Resolver>,
    poll_timeout: Duration,
    max_image_dim: u32,
}

/// Bounded job queue plus its fixed worker set.
///
/// Constructed once during startup as part of the service context and shared
/// by reference; nothing is created lazily on the request path.
pub struct WorkerPool {
    tx: mpsc::Sender<QueueItem>,
    depth: Arc<AtomicUsize>,
    counters: Arc<Counters>,
    handles: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    soft_limit: usize,
    enqueue_timeout: Duration,
    result_timeout: Duration,
}

impl WorkerPool {
    /// Create the bounded queue and spawn the fixed worker set.
    pub fn start(
        config: &QueueConfig,
        extractor: Arc<dyn FaceExtractor>,
        resolver: Arc<Resolver>,
        max_image_dim: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.capacity);
        let rx = Arc::new(Mutex::new(rx));
        let depth = Arc::new(AtomicUsize::new(0));
        let counters = Arc::new(Counters::default());

        let mut handles = Vec::with_capacity(config.workers);
        for idx in 0..config.workers {
            let ctx = WorkerCtx {
                rx: rx.clone(),
                depth: depth.clone(),
                counters: counters.clone(),
                extractor: extractor.clone(),
                resolver: resolver.clone(),
                poll_timeout: config.poll_timeout(),
                max_image_dim,
            };
            handles.push(tokio::spawn(worker_loop(idx, ctx)));
        }

        info!(
            "Worker pool started: {} workers, queue capacity {}, overload threshold {}",
            config.workers, config.capacity, config.soft_limit
        );

        Self {
            tx,
            depth,
            counters,
            handles: parking_lot::Mutex::new(handles),
            workers: config.workers,
            soft_limit: config.soft_limit,
            enqueue_timeout: config.enqueue_timeout(),
            result_timeout: config.result_timeout(),
        }
    }

    /// Enqueue a job.
    ///
    /// Rejects with `Overloaded` when the queued depth is over the soft
    /// limit (checked before attempting the enqueue) or when the bounded
    /// buffer stays full past the enqueue timeout.
    pub async fn submit(&self, input: InputRef) -> Result<ResultHandle, ServiceError> {
        if self.depth.load(Ordering::Acquire) > self.soft_limit {
            return Err(ServiceError::Overloaded);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = Box::new(Job {
            id: Uuid::new_v4(),
            input,
            enqueued_at: Instant::now(),
        });
        let job_id = job.id;

        // Count the job before it is visible to workers so the claim-side
        // decrement can never observe a zero depth.
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self
            .tx
            .send_timeout(QueueItem::Job(job, reply_tx), self.enqueue_timeout)
            .await
            .is_err()
        {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(ServiceError::Overloaded);
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        Ok(ResultHandle {
            job_id,
            rx: reply_rx,
        })
    }

    /// Wait for a job's result.
    ///
    /// On timeout the worker keeps running with no cancellation signal; its
    /// eventual result is discarded.
    pub async fn await_result(&self, handle: ResultHandle) -> Result<Vec<Face>, ServiceError> {
        match timeout(self.result_timeout, handle.rx).await {
            Err(_) => {
                warn!("result wait timed out for job {}", handle.job_id);
                Err(ServiceError::Timeout)
            }
            Ok(Err(_)) => Err(ServiceError::Internal(anyhow::anyhow!(
                "worker dropped job {} without delivering a result",
                handle.job_id
            ))),
            Ok(Ok(result)) => result.map_err(ServiceError::Job),
        }
    }

    /// Submit and wait; the endpoint path.
    pub async fn process(&self, input: InputRef) -> Result<Vec<Face>, ServiceError> {
        let handle = self.submit(input).await?;
        self.await_result(handle).await
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        let processed = self.counters.processed.load(Ordering::Relaxed);
        let busy_ms = self.counters.busy_ms.load(Ordering::Relaxed);
        PoolStats {
            workers: self.workers,
            queue_depth: self.queue_depth(),
            in_flight: self.counters.in_flight.load(Ordering::Relaxed),
            total_submitted: self.counters.submitted.load(Ordering::Relaxed),
            total_processed: processed,
            total_errors: self.counters.errors.load(Ordering::Relaxed),
            total_faces: self.counters.faces.load(Ordering::Relaxed),
            avg_processing_ms: busy_ms / processed.max(1),
        }
    }

    /// Deliver one stop sentinel per worker and join them. Jobs already
    /// queued ahead of the sentinels are still processed.
    pub async fn shutdown(&self) {
        for _ in 0..self.workers {
            if self.tx.send(QueueItem::Stop).await.is_err() {
                break;
            }
        }
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Worker pool shut down");
    }
}

async fn worker_loop(idx: usize, ctx: WorkerCtx) {
    debug!("worker {idx} started");
    loop {
        let item = {
            let mut rx = ctx.rx.lock().await;
            match timeout(ctx.poll_timeout, rx.recv()).await {
                // Idle poll expired; loop around so a stop sentinel is
                // noticed even on a quiet queue.
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(item)) => item,
            }
        };

        let (job, reply) = match item {
            QueueItem::Stop => break,
            QueueItem::Job(job, reply) => (job, reply),
        };

        ctx.depth.fetch_sub(1, Ordering::AcqRel);
        ctx.counters.in_flight.fetch_add(1, Ordering::Relaxed);

        let waited = job.enqueued_at.elapsed();
        let started = Instant::now();
        let result = run_job(&ctx, &job).await;
        let elapsed = started.elapsed();

        match &result {
            Ok(faces) => {
                ctx.counters
                    .faces
                    .fetch_add(faces.len() as u64, Ordering::Relaxed);
                debug!(
                    "worker {idx} processed {}: {} faces in {:?} (queued {:?})",
                    job.input,
                    faces.len(),
                    elapsed,
                    waited
                );
            }
            Err(e) => {
                ctx.counters.errors.fetch_add(1, Ordering::Relaxed);
                warn!("worker {idx} failed {}: {e}", job.input);
            }
        }

        ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
        ctx.counters
            .busy_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
        ctx.counters.in_flight.fetch_sub(1, Ordering::Relaxed);

        if reply.send(result).is_err() {
            debug!("result for job {} discarded, caller stopped waiting", job.id);
        }
    }
    debug!("worker {idx} exited");
}

/// Resolve, decode, and run the extractor for one job. Every failure maps
/// to a `JobError`; nothing escapes as a panic. Image buffers live only for
/// the duration of this call.
async fn run_job(ctx: &WorkerCtx, job: &Job) -> Result<Vec<Face>, JobError> {
    let bytes = ctx.resolver.fetch(&job.input).await?;

    let extractor = ctx.extractor.clone();
    let max_dim = ctx.max_image_dim;
    tokio::task::spawn_blocking(move || {
        let image =
            preprocess::decode_image(&bytes).map_err(|e| JobError::Decode(e.to_string()))?;
        let image = preprocess::downscale(image, max_dim);
        extractor
            .extract(&image)
            .map_err(|e| JobError::Backend(e.to_string()))
    })
    .await
    .map_err(|e| JobError::Backend(format!("inference task aborted: {e}")))?
}
