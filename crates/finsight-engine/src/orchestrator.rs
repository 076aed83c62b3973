use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;

use finsight_core::config::FinsightConfig;
use finsight_dialogue::{ContextRouter, ReuseEvaluator, SessionCache};
use finsight_index::VectorIndex;
use finsight_llm::LlmProvider;
use finsight_progress::ProgressBus;
use finsight_queue::JobQueue;
use finsight_store::StoreGateway;

use crate::sandbox::Sandbox;
use crate::scripts::ScriptStore;

/// Everything the intake dispatcher and the workers share, as one explicit
/// value — tests build fresh orchestrators with scripted collaborators and
/// nothing lives in process-wide state.
pub struct Orchestrator {
    pub config: FinsightConfig,
    pub store: Arc<StoreGateway>,
    pub queue: JobQueue,
    pub bus: Arc<ProgressBus>,
    pub sessions: SessionCache,
    pub router: ContextRouter,
    pub reuse: ReuseEvaluator,
    pub llm: Arc<dyn LlmProvider>,
    pub index: Arc<dyn VectorIndex>,
    pub sandbox: Arc<dyn Sandbox>,
    pub scripts: Arc<dyn ScriptStore>,
    /// Advisory per-session locks serializing intake and worker write-backs.
    session_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: FinsightConfig,
        store: Arc<StoreGateway>,
        llm: Arc<dyn LlmProvider>,
        index: Arc<dyn VectorIndex>,
        sandbox: Arc<dyn Sandbox>,
        scripts: Arc<dyn ScriptStore>,
    ) -> Self {
        let bus = Arc::new(ProgressBus::new(store.clone()));
        let sessions = SessionCache::new(
            store.clone(),
            Duration::from_secs(config.dialogue.session_ttl_seconds),
        );
        let router = ContextRouter::new(
            llm.clone(),
            config.llm.model.clone(),
            config.dialogue.router_confidence_low,
            config.dialogue.context_turns,
        );
        let reuse = ReuseEvaluator::new(
            llm.clone(),
            config.llm.model.clone(),
            config.dialogue.reuse_similarity_threshold,
        );
        Self {
            queue: JobQueue::new(store.clone()),
            bus,
            sessions,
            router,
            reuse,
            store,
            llm,
            index,
            sandbox,
            scripts,
            config,
            session_locks: DashMap::new(),
        }
    }

    /// The advisory lock for one session. Holders serialize steps that
    /// mutate the session's timeline or its conversation store.
    pub fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.session_locks
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop lock entries nobody holds. Called from the same background task
    /// that sweeps idle conversation stores.
    pub fn sweep_session_locks(&self) -> usize {
        let before = self.session_locks.len();
        self.session_locks
            .retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.session_locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_sweep_keeps_held_locks() {
        let locks: DashMap<String, Arc<Mutex<()>>> = DashMap::new();
        locks.insert("held".into(), Arc::new(Mutex::new(())));
        locks.insert("idle".into(), Arc::new(Mutex::new(())));

        let held = locks.get("held").unwrap().clone();
        locks.retain(|_, l| Arc::strong_count(l) > 1);

        assert!(locks.contains_key("held"));
        assert!(!locks.contains_key("idle"));
        drop(held);
    }
}
