use std::{
    fmt::Debug,
    sync::Arc,
    time::Duration,
};

use anyhow::Result;
use futures_util::lock::Mutex;
use log::{
    debug,
    warn,
};

use crate::{
    core::{
        error::WampError,
        hash::HashMap,
    },
    queue::{
        policy::{
            AdmissionPolicy,
            CeilingPolicy,
            PolicyFactory,
        },
        queue::{
            ConcurrencyQueue,
            QueueLimits,
        },
        stats::QueueStats,
    },
};

/// The queue used when no queue is named.
pub const DEFAULT_QUEUE: &str = "default";

/// The queue that never limits concurrency.
pub const UNLIMITED_QUEUE: &str = "unlimited";

/// Configuration for a single named queue.
#[derive(Default, Clone)]
pub struct QueueConfig {
    /// Concurrency ceiling. Falls back to [`ConcurrencyConfig::default_max`].
    pub concurrency_max: Option<usize>,
    /// Wait-list ceiling. Falls back to [`ConcurrencyConfig::waitlist_max`].
    pub waitlist_max: Option<usize>,
    /// Admission policy. Falls back to [`ConcurrencyConfig::policy_factory`].
    pub policy: Option<Arc<dyn AdmissionPolicy>>,
}

impl QueueConfig {
    pub fn with_max(concurrency_max: usize) -> Self {
        Self {
            concurrency_max: Some(concurrency_max),
            ..Default::default()
        }
    }
}

impl Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("concurrency_max", &self.concurrency_max)
            .field("waitlist_max", &self.waitlist_max)
            .field("policy", &self.policy.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Configuration for concurrency queues of a peer.
#[derive(Clone)]
pub struct ConcurrencyConfig {
    /// Ceiling for queues without their own. Zero is unbounded.
    pub default_max: usize,
    /// Wait-list ceiling for queues without their own. Zero is unbounded.
    pub waitlist_max: usize,
    /// Rejects queue names that are not configured.
    ///
    /// [`DEFAULT_QUEUE`] and [`UNLIMITED_QUEUE`] always exist.
    pub strict_naming: bool,
    pub queues: HashMap<String, QueueConfig>,
    /// Creates policies for queues without their own.
    pub policy_factory: Option<PolicyFactory>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            default_max: 0,
            waitlist_max: 0,
            strict_naming: true,
            queues: HashMap::default(),
            policy_factory: None,
        }
    }
}

impl Debug for ConcurrencyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyConfig")
            .field("default_max", &self.default_max)
            .field("waitlist_max", &self.waitlist_max)
            .field("strict_naming", &self.strict_naming)
            .field("queues", &self.queues)
            .field(
                "policy_factory",
                &self.policy_factory.as_ref().map(|_| "custom"),
            )
            .finish()
    }
}

/// Runtime changes to [`ConcurrencyConfig`].
#[derive(Debug, Default, Clone)]
pub struct ConcurrencyUpdate {
    /// New default ceiling, applied to live queues without their own.
    pub default_max: Option<usize>,
    /// New default wait-list ceiling, applied to queues created later.
    pub waitlist_max: Option<usize>,
    /// New strict naming flag, applied to later registrations and subscriptions.
    pub strict_naming: Option<bool>,
    /// New per-queue ceilings, applied to live queues immediately. `None` reverts to the default.
    pub queues: HashMap<String, Option<usize>>,
}

struct QueueSetState {
    config: ConcurrencyConfig,
    queues: HashMap<String, ConcurrencyQueue>,
}

impl QueueSetState {
    fn is_known(&self, name: &str) -> bool {
        name == DEFAULT_QUEUE
            || name == UNLIMITED_QUEUE
            || !self.config.strict_naming
            || self.config.queues.contains_key(name)
            || self.queues.contains_key(name)
    }

    fn limits(&self, name: &str) -> QueueLimits {
        let queue_config = self.config.queues.get(name);
        let concurrency_max = match queue_config.and_then(|config| config.concurrency_max) {
            Some(concurrency_max) => concurrency_max,
            None if name == UNLIMITED_QUEUE => 0,
            None => self.config.default_max,
        };
        let waitlist_max = queue_config
            .and_then(|config| config.waitlist_max)
            .unwrap_or(self.config.waitlist_max);
        QueueLimits {
            concurrency_max,
            waitlist_max,
        }
    }

    fn policy(&self, name: &str) -> Arc<dyn AdmissionPolicy> {
        if let Some(policy) = self
            .config
            .queues
            .get(name)
            .and_then(|config| config.policy.clone())
        {
            return policy;
        }
        match &self.config.policy_factory {
            Some(factory) => factory(name),
            None => Arc::new(CeilingPolicy),
        }
    }
}

/// The named concurrency queues of a peer.
///
/// Queues are created on first use and live as long as the set.
pub struct QueueSet {
    state: Mutex<QueueSetState>,
    loop_timeout: Duration,
}

impl QueueSet {
    pub fn new(config: ConcurrencyConfig, loop_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(QueueSetState {
                config,
                queues: HashMap::default(),
            }),
            loop_timeout,
        }
    }

    /// Checks that a queue name may be used under the current naming policy.
    pub async fn validate(&self, name: &str) -> Result<()> {
        if self.state.lock().await.is_known(name) {
            Ok(())
        } else {
            Err(WampError::UnknownQueue(name.to_owned()).into())
        }
    }

    /// Looks up a queue by name, creating it if it does not exist yet.
    ///
    /// Does not check the naming policy. Names should go through [`QueueSet::validate`] when they
    /// are first attached to a registration or subscription.
    pub async fn queue(&self, name: &str) -> ConcurrencyQueue {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.queues.get(name) {
            return queue.clone();
        }
        let limits = state.limits(name);
        debug!(
            "Creating queue {name} with concurrency_max = {}, waitlist_max = {}",
            limits.concurrency_max, limits.waitlist_max
        );
        let queue = ConcurrencyQueue::new(name, limits, state.policy(name), self.loop_timeout);
        state.queues.insert(name.to_owned(), queue.clone());
        queue
    }

    /// Looks up a queue that already exists.
    pub async fn existing(&self, name: &str) -> Option<ConcurrencyQueue> {
        self.state.lock().await.queues.get(name).cloned()
    }

    /// Applies runtime configuration changes.
    pub async fn configure(&self, update: ConcurrencyUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(strict_naming) = update.strict_naming {
            state.config.strict_naming = strict_naming;
        }
        if let Some(waitlist_max) = update.waitlist_max {
            state.config.waitlist_max = waitlist_max;
        }
        if let Some(default_max) = update.default_max {
            state.config.default_max = default_max;
        }
        for (name, concurrency_max) in update.queues {
            state.config.queues.entry(name).or_default().concurrency_max = concurrency_max;
        }
        for (name, queue) in &state.queues {
            queue.configure(Some(state.limits(name).concurrency_max), None)?;
        }
        Ok(())
    }

    /// Resets every queue.
    pub async fn reset_all(&self) {
        for (name, queue) in &self.state.lock().await.queues {
            if let Err(err) = queue.reset() {
                warn!("Failed to reset queue {name}: {err:#}");
            }
        }
    }

    /// Deactivates every queue.
    pub async fn deactivate_all(&self) {
        for (name, queue) in &self.state.lock().await.queues {
            if let Err(err) = queue.deactivate() {
                warn!("Failed to deactivate queue {name}: {err:#}");
            }
        }
    }

    /// Statistics of every queue that exists.
    pub async fn stats(&self) -> HashMap<String, QueueStats> {
        let queues = self
            .state
            .lock()
            .await
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.clone()))
            .collect::<Vec<_>>();
        let mut stats = HashMap::default();
        for (name, queue) in queues {
            match queue.stats().await {
                Ok(queue_stats) => {
                    stats.insert(name, queue_stats);
                }
                Err(err) => warn!("Failed to read stats of queue {name}: {err:#}"),
            }
        }
        stats
    }
}
