pub mod backoff;
pub mod committer;

pub use backoff::Backoff;
pub use committer::{Batch, BatchCommitter, CommitError, CommitReport, CommitSettings};
