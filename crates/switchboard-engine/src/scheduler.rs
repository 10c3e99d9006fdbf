//! Delayed reconnect attempts.
//!
//! The orchestrator never sleeps on its own; it hands a retry future to a
//! [`RetryScheduler`]. Production uses tokio timers, tests use
//! [`ManualScheduler`] and fire retries explicitly.

use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use switchboard_core::ids::InstanceId;

pub type RetryTask = BoxFuture<'static, ()>;

pub trait RetryScheduler: Send + Sync {
    /// Run `task` after `delay` unless `cancel` fires first.
    fn schedule(
        &self,
        instance_id: InstanceId,
        delay: Duration,
        cancel: CancellationToken,
        task: RetryTask,
    );
}

/// Timer-backed scheduler.
#[derive(Default)]
pub struct TokioScheduler;

impl RetryScheduler for TokioScheduler {
    fn schedule(
        &self,
        instance_id: InstanceId,
        delay: Duration,
        cancel: CancellationToken,
        task: RetryTask,
    ) {
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(instance_id = %instance_id, "pending retry cancelled");
                }
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
    }
}

struct ScheduledRetry {
    instance_id: InstanceId,
    delay: Duration,
    cancel: CancellationToken,
    task: RetryTask,
}

/// Records retries instead of timing them.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<ScheduledRetry>>,
    scheduled_total: Mutex<usize>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries still waiting to fire, with their delays.
    pub fn pending(&self) -> Vec<(InstanceId, Duration)> {
        self.queue
            .lock()
            .iter()
            .filter(|r| !r.cancel.is_cancelled())
            .map(|r| (r.instance_id.clone(), r.delay))
            .collect()
    }

    /// Every retry ever scheduled, cancelled ones included.
    pub fn scheduled_total(&self) -> usize {
        *self.scheduled_total.lock()
    }

    /// Run the oldest live retry to completion. Returns false when none is left.
    pub async fn fire_next(&self) -> bool {
        let next = {
            let mut queue = self.queue.lock();
            queue.retain(|r| !r.cancel.is_cancelled());
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };
        match next {
            Some(retry) => {
                retry.task.await;
                true
            }
            None => false,
        }
    }
}

impl RetryScheduler for ManualScheduler {
    fn schedule(
        &self,
        instance_id: InstanceId,
        delay: Duration,
        cancel: CancellationToken,
        task: RetryTask,
    ) {
        *self.scheduled_total.lock() += 1;
        self.queue.lock().push(ScheduledRetry {
            instance_id,
            delay,
            cancel,
            task,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_task(counter: &Arc<AtomicUsize>) -> RetryTask {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn manual_fires_in_order_and_skips_cancelled() {
        let sched = ManualScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let a = InstanceId::from_raw("a");
        let cancelled = CancellationToken::new();

        sched.schedule(a.clone(), Duration::from_secs(5), cancelled.clone(), counting_task(&counter));
        sched.schedule(a.clone(), Duration::from_secs(10), CancellationToken::new(), counting_task(&counter));
        cancelled.cancel();

        assert_eq!(sched.pending(), vec![(a, Duration::from_secs(10))]);
        assert_eq!(sched.scheduled_total(), 2);
        assert!(sched.fire_next().await);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(!sched.fire_next().await);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_waits_for_delay() {
        let counter = Arc::new(AtomicUsize::new(0));
        TokioScheduler.schedule(
            InstanceId::from_raw("a"),
            Duration::from_secs(5),
            CancellationToken::new(),
            counting_task(&counter),
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_scheduler_honours_cancel() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        TokioScheduler.schedule(
            InstanceId::from_raw("a"),
            Duration::from_secs(5),
            cancel.clone(),
            counting_task(&counter),
        );
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
