use std::sync::Arc;

use anyhow::Result;

use crate::queue::job::JobContext;

/// A snapshot of a queue's bookkeeping at the moment of an admission decision.
///
/// Ceilings of zero are unbounded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueState {
    pub concurrency_max: usize,
    pub waitlist_max: usize,
    pub running: usize,
    pub waiting: usize,
}

/// Strategy for admitting jobs into a queue.
///
/// Every method has a ceiling-based default, so implementations only override what they need. Hooks
/// run on the queue's worker, so they must not block.
pub trait AdmissionPolicy: Send + Sync {
    /// Checks if the job must wait instead of starting now.
    fn should_wait(&self, state: &QueueState, job: &JobContext) -> Result<bool> {
        let _ = job;
        Ok(state.concurrency_max > 0 && state.running >= state.concurrency_max)
    }

    /// Checks if a job that must wait should be rejected instead.
    fn should_reject(&self, state: &QueueState, job: &JobContext) -> Result<bool> {
        let _ = job;
        Ok(state.waitlist_max > 0 && state.waiting >= state.waitlist_max)
    }

    /// Called after a job enters the wait list.
    fn job_queued(&self, state: &QueueState, job: &JobContext) -> Result<()> {
        let _ = (state, job);
        Ok(())
    }
}

/// The default policy, which only looks at the ceilings.
#[derive(Debug, Default)]
pub struct CeilingPolicy;

impl AdmissionPolicy for CeilingPolicy {}

/// Creates the admission policy for a queue by name.
pub type PolicyFactory = Arc<dyn Fn(&str) -> Arc<dyn AdmissionPolicy> + Send + Sync>;
