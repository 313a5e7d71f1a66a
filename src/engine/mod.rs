//! Request-processing engine
//!
//! Provides:
//! - The embedding-backend boundary (`FaceExtractor`)
//! - Input-reference resolution (remote URL / lookup token / local path)
//! - The bounded job queue and worker pool
//! - The dynamic batch scheduler for bulk workloads

pub mod batch;
pub mod extractor;
#[cfg(feature = "openvino")]
pub mod openvino;
pub mod pool;
pub mod preprocess;
pub mod resolve;

pub use batch::{BatchProgress, BatchScheduler};
pub use extractor::{BoundingBox, ExtractorInfo, Face, FaceExtractor, NoopExtractor};
pub use pool::{PoolStats, WorkerPool};
pub use resolve::{InputRef, Resolver};
