/// Error Module
///
/// Error taxonomy shared by every pipeline stage and storage backend.
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EtlError {
    /// An upstream read failed. The checkpoint is left untouched so the next run retries from the same point.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// A write would break the one-current-row-per-natural-key invariant.
    #[error("integrity violation on {entity} {natural_key}: {detail}")]
    IntegrityViolation { entity: &'static str, natural_key: i64, detail: String },

    /// A write failed part way through a stage.
    #[error("partial write failure: {0}")]
    PartialWriteFailure(String),

    /// Every loader job writes the same dimensions, so only one may be running at a time.
    #[error("cannot start {job_name}: another warehouse load is already running")]
    ConcurrentRun { job_name: String },

    #[error("job run {0} does not exist or has already finished")]
    JobNotRunning(i64),

    #[error("run exceeded its time limit of {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// A stage error, recorded on the job log before being handed back to the caller.
    #[error("{job_name} run {run_id} failed: {source}")]
    RunFailed {
        run_id: i64,
        job_name: String,
        #[source]
        source: Box<EtlError>,
    },
}

impl EtlError {
    /// Whether retrying the same operation can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SourceUnavailable(_))
    }
}

pub type Result<T, E = EtlError> = std::result::Result<T, E>;
