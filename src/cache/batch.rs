//! Per-key batch work
//!
//! Runs one async operation per item, either inline or fanned out to a
//! bounded set of tasks. Every item runs under a timeout; a failure,
//! timeout or panic is logged and counted without stopping the batch.
//! Fanned-out batches may also be submitted without waiting, in which case
//! only `submitted` is reported.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::Result;

/// Outcome counts of one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl BatchReport {
    fn merge(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::TimedOut => self.timed_out += 1,
        }
    }

    pub fn absorb(&mut self, other: BatchReport) {
        self.submitted += other.submitted;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Runs batch operations with optional concurrency
#[derive(Debug, Clone)]
pub struct BatchRunner {
    concurrency: Option<usize>,
    task_timeout: Duration,
    wait: bool,
}

impl BatchRunner {
    /// `concurrency: None` runs items one after another on the caller's task
    pub fn new(concurrency: Option<usize>, task_timeout: Duration) -> Self {
        Self {
            concurrency: concurrency.filter(|n| *n > 0),
            task_timeout,
            wait: true,
        }
    }

    /// Whether `run` awaits fanned-out items. Inline batches always wait.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    pub fn waits(&self) -> bool {
        self.wait || self.concurrency.is_none()
    }

    pub async fn run<K, F, Fut>(&self, items: Vec<K>, op: F) -> BatchReport
    where
        K: Display + Send + 'static,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let mut report = BatchReport {
            submitted: items.len(),
            ..Default::default()
        };

        match self.concurrency {
            None => {
                for item in items {
                    let label = item.to_string();
                    let outcome = match timeout(self.task_timeout, op(item)).await {
                        Ok(Ok(())) => Outcome::Succeeded,
                        Ok(Err(e)) => {
                            warn!("Batch item {} failed: {}", label, e);
                            Outcome::Failed
                        }
                        Err(_) => {
                            warn!("Batch item {} timed out after {:?}", label, self.task_timeout);
                            Outcome::TimedOut
                        }
                    };
                    report.merge(outcome);
                }
            }
            Some(workers) => {
                let permits = Arc::new(Semaphore::new(workers));
                let mut handles = Vec::with_capacity(items.len());
                for item in items {
                    let label = item.to_string();
                    let fut = op(item);
                    let permits = permits.clone();
                    let task_timeout = self.task_timeout;
                    handles.push(tokio::spawn(async move {
                        let Ok(_permit) = permits.acquire_owned().await else {
                            return Outcome::Failed;
                        };
                        let mut task = tokio::spawn(fut);
                        match timeout(task_timeout, &mut task).await {
                            Ok(Ok(Ok(()))) => Outcome::Succeeded,
                            Ok(Ok(Err(e))) => {
                                warn!("Batch item {} failed: {}", label, e);
                                Outcome::Failed
                            }
                            Ok(Err(join_error)) => {
                                warn!("Batch item {} aborted: {}", label, join_error);
                                Outcome::Failed
                            }
                            Err(_) => {
                                task.abort();
                                warn!("Batch item {} timed out after {:?}, cancelled", label, task_timeout);
                                Outcome::TimedOut
                            }
                        }
                    }));
                }
                if !self.wait {
                    debug!(submitted = report.submitted, "Batch submitted without waiting");
                    return report;
                }
                for handle in handles {
                    match handle.await {
                        Ok(outcome) => report.merge(outcome),
                        Err(e) => {
                            warn!("Batch worker lost: {}", e);
                            report.merge(Outcome::Failed);
                        }
                    }
                }
            }
        }

        debug!(
            submitted = report.submitted,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            "Batch finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_inline_counts_outcomes() {
        let runner = BatchRunner::new(None, Duration::from_secs(1));
        let report = runner
            .run(vec![1, 2, 3, 4], |n: i32| async move {
                if n % 2 == 0 {
                    Ok(())
                } else {
                    Err(Error::Internal(format!("odd {}", n)))
                }
            })
            .await;
        assert_eq!(
            report,
            BatchReport {
                submitted: 4,
                succeeded: 2,
                failed: 2,
                timed_out: 0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_stop_batch() {
        let runner = BatchRunner::new(Some(2), Duration::from_millis(100));
        let done = Arc::new(AtomicUsize::new(0));
        let report = runner
            .run(vec![0u64, 500, 0, 500, 0], |delay| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(report.timed_out, 2);

        // Cancelled tasks never complete
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let runner = BatchRunner::new(Some(3), Duration::from_secs(5));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let report = runner
            .run((0..20).collect::<Vec<u32>>(), |_| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(report.succeeded, 20);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_wait_returns_before_items_finish() {
        let runner = BatchRunner::new(Some(2), Duration::from_secs(5)).with_wait(false);
        assert!(!runner.waits());
        let done = Arc::new(AtomicUsize::new(0));
        let report = runner
            .run(vec![1u32, 2, 3, 4], |_| {
                let done = done.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert_eq!(
            report,
            BatchReport {
                submitted: 4,
                ..Default::default()
            }
        );
        assert_eq!(done.load(Ordering::SeqCst), 0);

        // Detached items still run to completion
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_inline_batches_always_wait() {
        assert!(BatchRunner::new(None, Duration::from_secs(1)).with_wait(false).waits());
    }

    #[tokio::test]
    async fn test_panicking_item_counts_as_failure() {
        let runner = BatchRunner::new(Some(2), Duration::from_secs(1));
        let report = runner
            .run(vec![1, 2], |n: i32| async move {
                if n == 1 {
                    panic!("boom");
                }
                Ok(())
            })
            .await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
    }
}
