use std::sync::Arc;

use finsight_core::types::{AnalysisJobPayload, ExecutionJobPayload, Job, QueueName};
use finsight_store::StoreGateway;

use crate::error::Result;

/// Typed enqueue surface over the store's durable `jobs` table.
///
/// Exactly-once is the caller's concern: callers that need it supply an
/// external id inside the payload and consult it before enqueueing.
pub struct JobQueue {
    store: Arc<StoreGateway>,
}

impl JobQueue {
    pub fn new(store: Arc<StoreGateway>) -> Self {
        Self { store }
    }

    /// Queue an analysis-generation request. `max_attempts` bounds reclaim
    /// cycles for crashed or failing workers.
    pub fn enqueue_analysis(
        &self,
        payload: &AnalysisJobPayload,
        priority: u8,
        max_attempts: u32,
    ) -> Result<Job> {
        let job = self.store.enqueue_job(
            QueueName::Analysis,
            serde_json::to_value(payload)?,
            priority,
            max_attempts,
        )?;
        Ok(job)
    }

    /// Queue a script execution. Executions are deterministic on the script,
    /// so they get a single attempt; the admin requeue endpoint is the
    /// manual retry path.
    pub fn enqueue_execution(&self, payload: &ExecutionJobPayload, priority: u8) -> Result<Job> {
        let job = self.store.enqueue_job(
            QueueName::Execution,
            serde_json::to_value(payload)?,
            priority,
            1,
        )?;
        Ok(job)
    }
}
