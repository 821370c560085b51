//! Deferred optimization jobs.
//!
//! An upload handler that does not want to wait for processing writes the
//! bytes to a temp file and hands a [`Job`] to [`dispatch`]. Each attempt
//! runs [`Optimizer::optimize`] on a blocking thread under
//! `queue.timeout`; retryable failures are attempted again up to
//! `queue.tries` times in total. Invalid input and a missing processor end
//! the job at once.
//!
//! The temp file is removed when the job ends, whatever the outcome. A
//! timed-out attempt is abandoned, not cancelled: the blocking thread runs
//! to completion in the background and its result is discarded.

use crate::imaging::{Format, ImageBackend};
use crate::metadata::ImageMetadata;
use crate::optimize::{OptimizationOptions, OptimizeError, Optimizer, SourceAsset};
use crate::store::BlobStore;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// One queued upload.
#[derive(Debug, Clone)]
pub struct Job {
    /// Temp file holding the upload. Owned by the job and removed when it ends.
    pub temp_path: PathBuf,
    pub original_name: String,
    /// Declared mime type; sniffed from the bytes when absent.
    pub mime: Option<String>,
    pub options: OptimizationOptions,
}

#[derive(Error, Debug)]
pub enum JobError {
    #[error("could not read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Optimize(#[from] OptimizeError),
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

impl JobError {
    pub fn is_retryable(&self) -> bool {
        match self {
            JobError::Read { .. } | JobError::TimedOut(_) => true,
            JobError::Optimize(e) => e.is_retryable(),
            JobError::Panicked(_) => false,
        }
    }
}

/// Terminal failure of a job: the last error and how many attempts ran.
#[derive(Debug)]
pub struct JobFailure {
    pub attempts: u32,
    pub error: JobError,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (after {} attempt", self.error, self.attempts)?;
        if self.attempts != 1 {
            write!(f, "s")?;
        }
        write!(f, ")")
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Removes the temp file on drop, so every exit path cleans up.
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!(path = %self.0.display(), error = %e, "could not remove temp file");
        }
    }
}

/// Spawn a job on the current tokio runtime.
pub fn dispatch<B, S>(
    optimizer: Arc<Optimizer<B, S>>,
    job: Job,
) -> JoinHandle<Result<ImageMetadata, JobFailure>>
where
    B: ImageBackend + 'static,
    S: BlobStore + 'static,
{
    tokio::spawn(run_job(optimizer, job))
}

/// Run a job to completion with retries.
pub async fn run_job<B, S>(
    optimizer: Arc<Optimizer<B, S>>,
    job: Job,
) -> Result<ImageMetadata, JobFailure>
where
    B: ImageBackend + 'static,
    S: BlobStore + 'static,
{
    let _temp = TempFile(job.temp_path.clone());
    let queue = &optimizer.config().queue;
    let tries = queue.tries.max(1);
    let limit = queue.timeout();

    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt(&optimizer, &job, limit).await {
            Ok(metadata) => {
                info!(file = %job.original_name, hash = %metadata.hash, attempts, "job finished");
                return Ok(metadata);
            }
            Err(error) if error.is_retryable() && attempts < tries => {
                debug!(file = %job.original_name, attempts, %error, "attempt failed, retrying");
            }
            Err(error) => {
                error!(file = %job.original_name, attempts, %error, "job failed");
                return Err(JobFailure { attempts, error });
            }
        }
    }
}

async fn attempt<B, S>(
    optimizer: &Arc<Optimizer<B, S>>,
    job: &Job,
    limit: Duration,
) -> Result<ImageMetadata, JobError>
where
    B: ImageBackend + 'static,
    S: BlobStore + 'static,
{
    let optimizer = Arc::clone(optimizer);
    let job = job.clone();
    let task = tokio::task::spawn_blocking(move || -> Result<ImageMetadata, JobError> {
        let bytes = std::fs::read(&job.temp_path).map_err(|source| JobError::Read {
            path: job.temp_path.clone(),
            source,
        })?;
        let mime = job
            .mime
            .clone()
            .or_else(|| Format::sniff(&bytes).map(|f| f.mime().to_string()))
            .unwrap_or_default();
        let source = SourceAsset::new(bytes, job.original_name.clone(), mime);
        Ok(optimizer.optimize(&source, &job.options)?)
    });

    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => Err(JobError::Panicked(join.to_string())),
        Err(_) => Err(JobError::TimedOut(limit)),
    }
}
