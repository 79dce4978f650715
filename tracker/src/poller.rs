//! Polling task for a single deployment
//!
//! Each tracked deployment gets its own task. Polls are sequential: a poll
//! finishes before the next interval tick is taken. Read errors are logged
//! and the task keeps going until a terminal state or cancellation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backend::BackendClient;
use bazaar_config::TrackerConfig;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::progress::{DeploymentProgress, RemoteDeploymentStatus, Transition, PENDING_CEILING};
use crate::TrackerError;

/// Where the tracker reads remote deployment status from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, deployment_id: Uuid) -> Result<RemoteDeploymentStatus, TrackerError>;
}

#[async_trait]
impl StatusSource for BackendClient {
    async fn fetch_status(&self, deployment_id: Uuid) -> Result<RemoteDeploymentStatus, TrackerError> {
        let deployment = self.deployment(deployment_id).await?;
        Ok(RemoteDeploymentStatus::from(&deployment))
    }
}

/// Called once with the final progress when a deployment succeeds
pub type CompletionCallback = Box<dyn FnOnce(&DeploymentProgress) + Send + 'static>;

/// Starts polling tasks against a shared status source
pub struct DeploymentTracker<S: ?Sized> {
    source: Arc<S>,
    config: TrackerConfig,
}

impl<S: ?Sized> Clone for DeploymentTracker<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
        }
    }
}

impl<S> DeploymentTracker<S>
where
    S: StatusSource + ?Sized + 'static,
{
    pub fn new(source: Arc<S>, config: TrackerConfig) -> Self {
        Self { source, config }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Begin polling `deployment_id`.
    ///
    /// The task lives as long as the returned handle; dropping the handle
    /// stops it.
    pub fn start_tracking(&self, deployment_id: Uuid) -> TrackingHandle {
        self.spawn(deployment_id, None)
    }

    /// Like [`start_tracking`](Self::start_tracking), invoking `on_complete`
    /// at most once when the deployment reaches success
    pub fn start_tracking_with<F>(&self, deployment_id: Uuid, on_complete: F) -> TrackingHandle
    where
        F: FnOnce(&DeploymentProgress) + Send + 'static,
    {
        self.spawn(deployment_id, Some(Box::new(on_complete)))
    }

    fn spawn(&self, deployment_id: Uuid, on_complete: Option<CompletionCallback>) -> TrackingHandle {
        let mut initial = DeploymentProgress::new();
        initial.begin();

        let (progress_tx, progress_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let job = PollJob {
            deployment_id,
            source: Arc::clone(&self.source),
            period: Duration::from_millis(self.config.poll_interval_ms.max(1)),
            max_pending: self.config.max_pending_percent.min(PENDING_CEILING),
            progress_tx,
            on_complete,
        };

        info!("TRACKER: Tracking deployment {}", deployment_id);
        let task = tokio::spawn(job.run(shutdown_rx));

        TrackingHandle {
            deployment_id,
            progress: progress_rx,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

struct PollJob<S: ?Sized> {
    deployment_id: Uuid,
    source: Arc<S>,
    period: Duration,
    max_pending: u8,
    progress_tx: watch::Sender<DeploymentProgress>,
    on_complete: Option<CompletionCallback>,
}

impl<S> PollJob<S>
where
    S: StatusSource + ?Sized,
{
    async fn run(mut self, mut shutdown_rx: oneshot::Receiver<()>) {
        let metrics = &bazaar_metrics::metrics().tracker;
        metrics.active.inc();

        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Tracking of {} cancelled", self.deployment_id);
                    break;
                }
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = &mut shutdown_rx => {
                    debug!("Tracking of {} cancelled mid-poll", self.deployment_id);
                    break;
                }
                result = self.source.fetch_status(self.deployment_id) => result,
            };

            let remote = match result {
                Ok(remote) => remote,
                Err(e) => {
                    warn!("Poll for deployment {} failed: {}", self.deployment_id, e);
                    metrics.poll_errors.with_label_values(&[e.kind()]).inc();
                    continue;
                }
            };

            metrics.polls.with_label_values(&[remote.state.as_str()]).inc();

            if self.apply(&remote).is_terminal() {
                break;
            }
        }

        metrics.active.dec();
    }

    fn apply(&mut self, remote: &RemoteDeploymentStatus) -> Transition {
        let max_pending = self.max_pending;
        let mut transition = Transition::Unchanged;
        self.progress_tx.send_if_modified(|progress| {
            transition = progress.apply(remote, max_pending);
            transition != Transition::Unchanged
        });

        let metrics = &bazaar_metrics::metrics().tracker;
        match transition {
            Transition::Completed => {
                info!("Deployment {} is running", self.deployment_id);
                metrics.outcomes.with_label_values(&["success"]).inc();
                if let Some(callback) = self.on_complete.take() {
                    let snapshot = self.progress_tx.borrow().clone();
                    callback(&snapshot);
                }
            }
            Transition::Failed => {
                warn!(
                    "Deployment {} failed: {}",
                    self.deployment_id,
                    self.progress_tx.borrow().error_message.as_deref().unwrap_or_default()
                );
                metrics.outcomes.with_label_values(&["error"]).inc();
            }
            Transition::Progressed => {
                debug!("Deployment {} at {}%", self.deployment_id, self.progress_tx.borrow().percent);
            }
            Transition::Unchanged => {}
        }

        transition
    }
}

/// Cancellable handle to one tracking task
pub struct TrackingHandle {
    deployment_id: Uuid,
    progress: watch::Receiver<DeploymentProgress>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl TrackingHandle {
    pub fn deployment_id(&self) -> Uuid {
        self.deployment_id
    }

    /// Current progress snapshot
    pub fn progress(&self) -> DeploymentProgress {
        self.progress.borrow().clone()
    }

    /// Receiver that wakes on every progress change
    pub fn subscribe(&self) -> watch::Receiver<DeploymentProgress> {
        self.progress.clone()
    }

    /// True once the polling task has exited
    pub fn is_stopped(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Wait for a terminal state. Returns the last progress seen if the task
    /// stops first.
    pub async fn finished(&mut self) -> DeploymentProgress {
        loop {
            let current = self.progress.borrow_and_update().clone();
            if current.is_terminal() {
                return current;
            }
            if self.progress.changed().await.is_err() {
                return self.progress.borrow().clone();
            }
        }
    }

    /// Stop polling and wait for the task to exit
    pub async fn cancel(mut self) {
        self.signal_shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    fn signal_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TrackingHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> TrackerConfig {
        TrackerConfig {
            poll_interval_ms: 2000,
            max_pending_percent: 95,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_errors_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut source = MockStatusSource::new();
        source.expect_fetch_status().returning(move |_| {
            match seen.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err(TrackerError::Source("connection reset".to_string())),
                2 => Ok(RemoteDeploymentStatus::deploying(Some(50))),
                _ => Ok(RemoteDeploymentStatus::running()),
            }
        });

        let tracker = DeploymentTracker::new(Arc::new(source), config());
        let mut handle = tracker.start_tracking(Uuid::new_v4());

        let done = handle.finished().await;
        assert_eq!(done.status, ProgressStatus::Success);
        assert_eq!(done.percent, 100);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_callback_fires_once() {
        let mut source = MockStatusSource::new();
        source
            .expect_fetch_status()
            .times(1)
            .returning(|_| Ok(RemoteDeploymentStatus::running()));

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let tracker = DeploymentTracker::new(Arc::new(source), config());
        let mut handle = tracker.start_tracking_with(Uuid::new_v4(), move |p| {
            assert_eq!(p.percent, 100);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.finished().await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(handle.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut source = MockStatusSource::new();
        source.expect_fetch_status().returning(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteDeploymentStatus::deploying(Some(10)))
        });

        let tracker = DeploymentTracker::new(Arc::new(source), config());
        let handle = tracker.start_tracking(Uuid::new_v4());

        tokio::time::sleep(Duration::from_millis(4500)).await;
        let before = calls.load(Ordering::SeqCst);
        assert_eq!(before, 2);

        handle.cancel().await;
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_pending_cap_stays_below_complete() {
        let mut source = MockStatusSource::new();
        source
            .expect_fetch_status()
            .returning(|_| Ok(RemoteDeploymentStatus::deploying(Some(180))));

        let tracker = DeploymentTracker::new(
            Arc::new(source),
            TrackerConfig {
                poll_interval_ms: 1000,
                max_pending_percent: 200,
            },
        );
        let handle = tracker.start_tracking(Uuid::new_v4());
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let progress = handle.progress();
        assert_eq!(progress.status, ProgressStatus::Processing);
        assert_eq!(progress.percent, PENDING_CEILING);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_releases_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut source = MockStatusSource::new();
        source.expect_fetch_status().returning(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteDeploymentStatus::deploying(None))
        });

        let tracker = DeploymentTracker::new(Arc::new(source), config());
        let handle = tracker.start_tracking(Uuid::new_v4());
        tokio::time::sleep(Duration::from_millis(2500)).await;
        drop(handle);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
