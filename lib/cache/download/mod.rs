/// Download job state machine.
pub mod job;
/// Registry mapping objects to their download jobs.
pub mod registry;

pub use job::{DownloadJob, JobError, JobPhase, JobStatus, WaitCancelled};
pub use registry::JobRegistry;
