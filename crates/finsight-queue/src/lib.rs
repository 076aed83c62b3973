pub mod error;
pub mod queue;
pub mod worker;

pub use error::{QueueError, Result};
pub use queue::JobQueue;
pub use worker::{HandlerError, JobHandler, QueueWorker, WorkerConfig};
