use std::time::Duration;

/// Running statistics of a concurrency queue.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QueueStats {
    pub concurrency_max: usize,
    pub waitlist_max: usize,
    /// Jobs started.
    pub total_run: u64,
    /// Jobs that spent time in the wait list.
    pub total_waited: u64,
    /// Jobs that finished, successfully or not.
    pub completed: u64,
    pub running: usize,
    pub waiting: usize,
    pub peak_running: usize,
    pub peak_waiting: usize,
    pub rejected: u64,
    pub errors: u64,
    pub total_wait_duration: Duration,
    pub total_run_duration: Duration,
}

impl QueueStats {
    /// Average time a started job spent in the wait list.
    pub fn average_wait_duration(&self) -> Duration {
        average(self.total_wait_duration, self.total_run)
    }

    /// Average time a completed job spent running.
    pub fn average_run_duration(&self) -> Duration {
        average(self.total_run_duration, self.completed)
    }
}

fn average(total: Duration, count: u64) -> Duration {
    if count == 0 {
        Duration::ZERO
    } else {
        Duration::from_secs_f64(total.as_secs_f64() / count as f64)
    }
}
