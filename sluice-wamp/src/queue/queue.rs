use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use anyhow::{
    Error,
    Result,
};
use log::{
    debug,
    trace,
    warn,
};
use tokio::{
    sync::{
        mpsc::{
            UnboundedReceiver,
            UnboundedSender,
            unbounded_channel,
        },
        oneshot,
    },
    time::Instant,
};

use crate::{
    core::{
        error::WampError,
        hash::HashMap,
    },
    queue::{
        job::Job,
        policy::{
            AdmissionPolicy,
            QueueState,
        },
        stats::QueueStats,
    },
};

/// The outcome of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The job started immediately.
    Started,
    /// The job entered the wait list.
    Queued,
    /// The admission policy failed, and the failure went to the job's error callback.
    Failed,
}

/// Ceilings of a queue. Zero is unbounded.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueLimits {
    pub concurrency_max: usize,
    pub waitlist_max: usize,
}

enum QueueEvent {
    Submit(Job, oneshot::Sender<Result<Admission>>),
    Configure {
        concurrency_max: Option<usize>,
        waitlist_max: Option<usize>,
    },
    Reset,
    Deactivate,
    Stats(oneshot::Sender<QueueStats>),
}

struct Finished {
    id: u64,
    generation: u64,
    run_duration: Duration,
    failed: bool,
}

/// A handle to a concurrency queue.
///
/// A queue admits jobs up to its concurrency ceiling and holds the rest in a FIFO wait list of
/// bounded length. All bookkeeping lives on a single worker task that processes one event at a
/// time, so handles can be cloned and used from anywhere.
///
/// The worker stops when every handle is dropped. Jobs that are already running are left to finish.
#[derive(Clone)]
pub struct ConcurrencyQueue {
    name: Arc<str>,
    event_tx: UnboundedSender<QueueEvent>,
}

impl ConcurrencyQueue {
    /// Creates a queue and starts its worker.
    ///
    /// Must be called within a Tokio runtime.
    pub fn new(
        name: &str,
        limits: QueueLimits,
        policy: Arc<dyn AdmissionPolicy>,
        loop_timeout: Duration,
    ) -> Self {
        let (event_tx, event_rx) = unbounded_channel();
        let (finished_tx, finished_rx) = unbounded_channel();
        let worker = QueueWorker {
            name: name.to_owned(),
            limits,
            policy,
            loop_timeout,
            active: true,
            generation: 0,
            next_id: 0,
            running: HashMap::default(),
            waiting: VecDeque::new(),
            stats: QueueStats::default(),
            finished_tx,
        };
        tokio::spawn(worker.run(event_rx, finished_rx));
        Self {
            name: name.into(),
            event_tx,
        }
    }

    /// The name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, event: QueueEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .map_err(|_| WampError::Fatal(format!("queue {} is no longer running", self.name)).into())
    }

    /// Submits a job.
    ///
    /// Fails with [`WampError::WaitlistFull`] if the job must wait but the wait list is full, and
    /// with [`WampError::Shutdown`] if the queue was deactivated. Errors from the admission policy
    /// at submission time are returned here as well.
    pub async fn submit(&self, job: Job) -> Result<Admission> {
        let (admission_tx, admission_rx) = oneshot::channel();
        self.send(QueueEvent::Submit(job, admission_tx))?;
        admission_rx
            .await
            .map_err(|_| WampError::Fatal(format!("queue {} dropped a submission", self.name)))?
    }

    /// Updates the ceilings of the queue.
    ///
    /// Waiting jobs are admitted right away if the new ceiling allows it. Running jobs are never
    /// interrupted.
    pub fn configure(
        &self,
        concurrency_max: Option<usize>,
        waitlist_max: Option<usize>,
    ) -> Result<()> {
        self.send(QueueEvent::Configure {
            concurrency_max,
            waitlist_max,
        })
    }

    /// Discards waiting jobs and forgets running ones.
    ///
    /// Jobs that are still running do not count against the ceiling anymore.
    pub fn reset(&self) -> Result<()> {
        self.send(QueueEvent::Reset)
    }

    /// Stops admitting jobs. Waiting jobs are discarded.
    pub fn deactivate(&self) -> Result<()> {
        self.send(QueueEvent::Deactivate)
    }

    /// Reads the statistics of the queue.
    pub async fn stats(&self) -> Result<QueueStats> {
        let (stats_tx, stats_rx) = oneshot::channel();
        self.send(QueueEvent::Stats(stats_tx))?;
        stats_rx
            .await
            .map_err(|_| WampError::Fatal(format!("queue {} dropped a request", self.name)).into())
    }
}

struct WaitingJob {
    id: u64,
    job: Job,
    queued_at: Instant,
}

struct QueueWorker {
    name: String,
    limits: QueueLimits,
    policy: Arc<dyn AdmissionPolicy>,
    loop_timeout: Duration,
    active: bool,
    generation: u64,
    next_id: u64,
    // Job ID to the time the job started.
    running: HashMap<u64, Instant>,
    waiting: VecDeque<WaitingJob>,
    stats: QueueStats,
    finished_tx: UnboundedSender<Finished>,
}

impl QueueWorker {
    async fn run(
        mut self,
        mut event_rx: UnboundedReceiver<QueueEvent>,
        mut finished_rx: UnboundedReceiver<Finished>,
    ) {
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.handle_event(event),
                        None => break,
                    }
                }
                finished = finished_rx.recv() => {
                    if let Some(finished) = finished {
                        self.finish(finished);
                    }
                }
                _ = tokio::time::sleep(self.loop_timeout) => {
                    if !self.waiting.is_empty() {
                        trace!(
                            "Queue {} has {} running and {} waiting jobs",
                            self.name,
                            self.running.len(),
                            self.waiting.len()
                        );
                    }
                }
            }
        }
        trace!("Queue {} stopped", self.name);
    }

    fn state(&self) -> QueueState {
        QueueState {
            concurrency_max: self.limits.concurrency_max,
            waitlist_max: self.limits.waitlist_max,
            running: self.running.len(),
            waiting: self.waiting.len(),
        }
    }

    fn handle_event(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Submit(job, admission_tx) => {
                admission_tx.send(self.submit(job)).ok();
            }
            QueueEvent::Configure {
                concurrency_max,
                waitlist_max,
            } => {
                if let Some(concurrency_max) = concurrency_max {
                    self.limits.concurrency_max = concurrency_max;
                }
                if let Some(waitlist_max) = waitlist_max {
                    self.limits.waitlist_max = waitlist_max;
                }
                debug!(
                    "Queue {} configured with concurrency_max = {}, waitlist_max = {}",
                    self.name, self.limits.concurrency_max, self.limits.waitlist_max
                );
                self.backfill();
            }
            QueueEvent::Reset => {
                debug!(
                    "Queue {} reset, discarding {} waiting jobs",
                    self.name,
                    self.waiting.len()
                );
                self.generation += 1;
                self.waiting.clear();
                self.running.clear();
            }
            QueueEvent::Deactivate => {
                self.active = false;
                self.waiting.clear();
            }
            QueueEvent::Stats(stats_tx) => {
                let mut stats = self.stats.clone();
                stats.concurrency_max = self.limits.concurrency_max;
                stats.waitlist_max = self.limits.waitlist_max;
                stats.running = self.running.len();
                stats.waiting = self.waiting.len();
                stats_tx.send(stats).ok();
            }
        }
    }

    fn submit(&mut self, job: Job) -> Result<Admission> {
        if !self.active {
            return Err(WampError::Shutdown.into());
        }
        let id = self.next_id;
        self.next_id += 1;

        let state = self.state();
        let should_wait = match self.policy.should_wait(&state, &job.context) {
            Ok(should_wait) => should_wait,
            Err(err) => return Ok(self.fail(job, err)),
        };
        if !should_wait {
            self.start(id, job, None);
            return Ok(Admission::Started);
        }

        let should_reject = match self.policy.should_reject(&state, &job.context) {
            Ok(should_reject) => should_reject,
            Err(err) => return Ok(self.fail(job, err)),
        };
        if should_reject {
            self.stats.rejected += 1;
            debug!("Queue {} rejected {}", self.name, job.context);
            return Err(WampError::WaitlistFull(self.name.clone()).into());
        }

        self.waiting.push_back(WaitingJob {
            id,
            job,
            queued_at: Instant::now(),
        });
        let state = self.state();
        let queued = match self.waiting.back() {
            Some(waiting) => {
                debug!("Queue {} queued {}", self.name, waiting.job.context);
                self.policy.job_queued(&state, &waiting.job.context)
            }
            None => Ok(()),
        };
        if let Err(err) = queued {
            return match self.waiting.pop_back() {
                Some(waiting) => Ok(self.fail(waiting.job, err)),
                None => Err(err),
            };
        }
        self.stats.total_waited += 1;
        self.stats.peak_waiting = self.stats.peak_waiting.max(self.waiting.len());
        Ok(Admission::Queued)
    }

    fn backfill(&mut self) {
        while let Some(head) = self.waiting.front() {
            match self.policy.should_wait(&self.state(), &head.job.context) {
                Ok(true) => break,
                Ok(false) => {
                    if let Some(waiting) = self.waiting.pop_front() {
                        self.start(waiting.id, waiting.job, Some(waiting.queued_at));
                    }
                }
                Err(err) => {
                    if let Some(waiting) = self.waiting.pop_front() {
                        self.fail(waiting.job, err);
                    }
                }
            }
        }
    }

    fn fail(&mut self, job: Job, err: Error) -> Admission {
        warn!("Queue {} failed to admit {}: {err:#}", self.name, job.context);
        self.stats.errors += 1;
        (job.on_error)(err);
        Admission::Failed
    }

    fn start(&mut self, id: u64, job: Job, queued_at: Option<Instant>) {
        let now = Instant::now();
        if let Some(queued_at) = queued_at {
            self.stats.total_wait_duration += now.duration_since(queued_at);
        }
        self.running.insert(id, now);
        self.stats.total_run += 1;
        self.stats.peak_running = self.stats.peak_running.max(self.running.len());
        trace!("Queue {} started {}", self.name, job.context);

        let generation = self.generation;
        let finished_tx = self.finished_tx.clone();
        let Job { work, on_error, .. } = job;
        tokio::spawn(async move {
            // The work runs on its own task so a panic is reported like any other failure.
            let result = match tokio::spawn(work).await {
                Ok(result) => result,
                Err(err) => Err(Error::msg(format!("job panicked: {err}"))),
            };
            let failed = result.is_err();
            if let Err(err) = result {
                on_error(err);
            }
            finished_tx
                .send(Finished {
                    id,
                    generation,
                    run_duration: now.elapsed(),
                    failed,
                })
                .ok();
        });
    }

    fn finish(&mut self, finished: Finished) {
        if finished.generation != self.generation || self.running.remove(&finished.id).is_none() {
            return;
        }
        self.stats.completed += 1;
        self.stats.total_run_duration += finished.run_duration;
        if finished.failed {
            self.stats.errors += 1;
        }
        self.backfill();
    }
}

#[cfg(test)]
mod queue_test {
    use std::{
        sync::{
            Arc,
            Mutex,
            atomic::{
                AtomicUsize,
                Ordering,
            },
        },
        time::Duration,
    };

    use anyhow::Error;
    use tokio::sync::oneshot;

    use crate::{
        core::error::WampError,
        queue::{
            job::{
                Job,
                JobContext,
            },
            policy::{
                AdmissionPolicy,
                CeilingPolicy,
                QueueState,
            },
            queue::{
                Admission,
                ConcurrencyQueue,
                QueueLimits,
            },
        },
    };

    fn queue(concurrency_max: usize, waitlist_max: usize) -> ConcurrencyQueue {
        ConcurrencyQueue::new(
            "test",
            QueueLimits {
                concurrency_max,
                waitlist_max,
            },
            Arc::new(CeilingPolicy),
            Duration::from_millis(50),
        )
    }

    #[derive(Default)]
    struct Gauge {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Gauge {
        fn job(self: &Arc<Self>, label: &str, duration: Duration) -> Job {
            let gauge = self.clone();
            Job::new(JobContext::Task(label.to_owned()), async move {
                let current = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
                gauge.peak.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(duration).await;
                gauge.current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn never_exceeds_ceiling() {
        let queue = queue(2, 0);
        let gauge = Arc::new(Gauge::default());
        for i in 0..10 {
            queue
                .submit(gauge.job(&i.to_string(), Duration::from_millis(50)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.total_run, 10);
        assert_eq!(stats.completed, 10);
        assert_eq!(stats.total_waited, 8);
        assert_eq!(stats.peak_running, 2);
        assert_eq!(stats.peak_waiting, 8);
        assert_eq!(stats.running, 0);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejects_beyond_waitlist() {
        let queue = queue(2, 3);
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let blocked = |label: usize| {
            let mut release_rx = release_rx.clone();
            Job::new(JobContext::Task(label.to_string()), async move {
                release_rx.wait_for(|released| *released).await?;
                Ok::<_, Error>(())
            })
        };

        for i in 0..5 {
            assert!(queue.submit(blocked(i)).await.is_ok());
        }
        assert_matches::assert_matches!(queue.submit(blocked(5)).await, Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::WaitlistFull(name)) => {
                assert_eq!(name, "test");
            });
        });
        assert_eq!(queue.stats().await.unwrap().rejected, 1);

        release_tx.send(true).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn admits_waiting_jobs_in_order() {
        let queue = queue(1, 0);
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..6 {
            let order = order.clone();
            let admission = queue
                .submit(Job::new(JobContext::Task(i.to_string()), async move {
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                }))
                .await
                .unwrap();
            if i == 0 {
                assert_eq!(admission, Admission::Started);
            } else {
                assert_eq!(admission, Admission::Queued);
            }
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        pretty_assertions::assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn raising_ceiling_admits_waiting_jobs() {
        let queue = queue(1, 0);
        let gauge = Arc::new(Gauge::default());
        for i in 0..4 {
            queue
                .submit(gauge.job(&i.to_string(), Duration::from_millis(300)))
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.stats().await.unwrap().running, 1);

        queue.configure(Some(4), None).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.concurrency_max, 4);
        assert_eq!(stats.running, 4);
        assert_eq!(stats.waiting, 0);
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reports_failures_and_keeps_running() {
        let queue = queue(1, 0);
        let (error_tx, error_rx) = oneshot::channel();
        queue
            .submit(
                Job::new(JobContext::Task("fails".to_owned()), async {
                    Err::<(), _>(Error::msg("boom"))
                })
                .on_error(move |err| {
                    error_tx.send(err.to_string()).ok();
                }),
            )
            .await
            .unwrap();
        assert_eq!(error_rx.await.unwrap(), "boom");

        let (error_tx, error_rx) = oneshot::channel();
        queue
            .submit(
                Job::new(JobContext::Task("panics".to_owned()), async {
                    if true {
                        panic!("handler panicked");
                    }
                    Ok(())
                })
                .on_error(move |err| {
                    error_tx.send(err.to_string()).ok();
                }),
            )
            .await
            .unwrap();
        assert!(error_rx.await.unwrap().contains("panicked"));

        let (done_tx, done_rx) = oneshot::channel();
        queue
            .submit(Job::new(JobContext::Task("ok".to_owned()), async move {
                done_tx.send(()).ok();
                Ok(())
            }))
            .await
            .unwrap();
        done_rx.await.unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.errors, 2);
        assert_eq!(stats.completed, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reset_discards_waiting_jobs() {
        let queue = queue(1, 0);
        let started = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let started = started.clone();
            queue
                .submit(Job::new(JobContext::Task(i.to_string()), async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                }))
                .await
                .unwrap();
        }
        queue.reset().unwrap();
        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.running, 0);
        assert_eq!(stats.waiting, 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deactivated_queue_refuses_jobs() {
        let queue = queue(0, 0);
        queue.deactivate().unwrap();
        assert_matches::assert_matches!(queue.submit(Job::new(JobContext::Task("late".to_owned()), async { Ok::<_, Error>(()) })).await, Err(err) => {
            assert_matches::assert_matches!(err.downcast_ref::<WampError>(), Some(WampError::Shutdown));
        });
    }

    struct PriorityPolicy {
        queued: AtomicUsize,
    }

    impl AdmissionPolicy for PriorityPolicy {
        fn should_wait(&self, state: &QueueState, job: &JobContext) -> anyhow::Result<bool> {
            match job {
                JobContext::Task(label) if label == "urgent" => Ok(false),
                JobContext::Task(label) if label == "broken" => Err(Error::msg("cannot decide")),
                _ => CeilingPolicy.should_wait(state, job),
            }
        }

        fn job_queued(&self, _: &QueueState, _: &JobContext) -> anyhow::Result<()> {
            self.queued.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn custom_policy_overrides_ceiling() {
        let policy = Arc::new(PriorityPolicy {
            queued: AtomicUsize::new(0),
        });
        let queue = ConcurrencyQueue::new(
            "custom",
            QueueLimits {
                concurrency_max: 1,
                waitlist_max: 0,
            },
            policy.clone(),
            Duration::from_millis(50),
        );
        let gauge = Arc::new(Gauge::default());
        assert_eq!(
            queue
                .submit(gauge.job("normal", Duration::from_millis(200)))
                .await
                .unwrap(),
            Admission::Started
        );
        assert_eq!(
            queue
                .submit(gauge.job("normal", Duration::from_millis(200)))
                .await
                .unwrap(),
            Admission::Queued
        );
        assert_eq!(
            queue
                .submit(gauge.job("urgent", Duration::from_millis(200)))
                .await
                .unwrap(),
            Admission::Started
        );
        assert_eq!(policy.queued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn policy_failures_reach_job_error_callback() {
        let queue = ConcurrencyQueue::new(
            "custom",
            QueueLimits::default(),
            Arc::new(PriorityPolicy {
                queued: AtomicUsize::new(0),
            }),
            Duration::from_millis(50),
        );
        let (error_tx, error_rx) = oneshot::channel();
        let job = Job::new(JobContext::Task("broken".to_owned()), async {
            Ok::<_, Error>(())
        })
        .on_error(move |err| {
            error_tx.send(err.to_string()).ok();
        });
        assert_matches::assert_matches!(queue.submit(job).await, Ok(Admission::Failed));
        assert_eq!(error_rx.await.unwrap(), "cannot decide");

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.total_run, 0);
    }
}
