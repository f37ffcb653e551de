//! Concurrency orchestrator (component J, elaborating spec.md §5): a pool
//! of `tokio` workers compiling shots concurrently, plus a wrapper that
//! re-serialises out-of-order results before they reach a consumer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ResourceError;

/// Worker pool tuning. `Default` mirrors the teacher's plain-struct
/// configuration pattern rather than a builder macro.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    pub workers: usize,
    pub max_retries: u32,
    pub backoff_base_millis: u64,
}

impl Default for Config {
    fn default() -> Config {
        Config { workers: 4, max_retries: 3, backoff_base_millis: 50 }
    }
}

/// One unit of work submitted to the pool: an index (for re-ordering) and
/// an opaque compile closure producing `T` or a transient failure.
pub struct Shot<T> {
    pub index: u64,
    pub compile: Box<dyn Fn() -> Result<T, String> + Send + Sync>,
}

/// Runs `shots` through `config.workers` concurrent tasks, retrying
/// transient failures per [`ResourceError::is_retryable`], and returns
/// results re-ordered by index through an [`OrderingWrapper`].
///
/// `T` crosses the worker/orchestrator boundary as a plain owned value —
/// shared instruction sub-trees (`Rc`) never cross a task boundary, only
/// the compiled result does (§3, §9).
pub async fn run_shot_pool<T: Send + 'static>(
    shots: Vec<Shot<T>>,
    config: Config,
) -> Vec<(u64, Result<T, ResourceError>)> {
    let cancelled = Arc::new(AtomicBool::new(false));
    let (work_tx, work_rx) = mpsc::channel::<Shot<T>>(shots.len().max(1));
    let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
    let (result_tx, mut result_rx) = mpsc::channel::<(u64, Result<T, ResourceError>)>(shots.len().max(1));

    for shot in shots {
        work_tx.send(shot).await.expect("work channel outlives all senders");
    }
    drop(work_tx);

    let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(config.workers);
    for worker_id in 0..config.workers {
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        let cancelled = Arc::clone(&cancelled);
        workers.push(tokio::spawn(async move {
            loop {
                let shot = {
                    let mut rx = work_rx.lock().await;
                    rx.recv().await
                };
                let Some(shot) = shot else { break };
                if cancelled.load(Ordering::Relaxed) {
                    debug!("worker {worker_id} dropping shot {} after cancellation", shot.index);
                    continue;
                }
                let result = compile_with_retries(&shot, worker_id, config).await;
                if result_tx.send((shot.index, result)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    let mut ordering = OrderingWrapper::new();
    let mut ordered: Vec<(u64, Result<T, ResourceError>)> = Vec::new();
    while let Some((index, result)) = result_rx.recv().await {
        ordered.extend(ordering.accept(index, result));
    }
    for worker in workers {
        let _ = worker.await;
    }

    ordered
}

async fn compile_with_retries<T>(shot: &Shot<T>, worker_id: usize, config: Config) -> Result<T, ResourceError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match (shot.compile)() {
            Ok(value) => return Ok(value),
            Err(cause) => {
                let err = ResourceError::WorkerCrashed { index: shot.index, attempt, cause: cause.clone() };
                if !err.is_retryable() || attempt >= config.max_retries {
                    warn!("worker {worker_id} giving up on shot {} after {attempt} attempt(s): {cause}", shot.index);
                    return Err(if attempt >= config.max_retries && err.is_retryable() {
                        ResourceError::RetriesExhausted { index: shot.index, attempts: attempt, last_cause: cause }
                    } else {
                        err
                    });
                }
                let backoff = config.backoff_base_millis * 2u64.pow(attempt.saturating_sub(1));
                debug!("worker {worker_id} retrying shot {} (attempt {attempt}) after {backoff}ms: {cause}", shot.index);
                tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
            }
        }
    }
}

/// Re-serialises out-of-order shot results arriving on an input channel,
/// forwarding each contiguous run starting at `next_expected` downstream
/// in order.
pub struct OrderingWrapper<T> {
    next_expected: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> OrderingWrapper<T> {
    pub fn new() -> OrderingWrapper<T> {
        OrderingWrapper { next_expected: 0, pending: BTreeMap::new() }
    }

    /// Accepts an arrival, returning the contiguous run (in order, paired
    /// with its index) that is now ready to be handed downstream, if any.
    pub fn accept(&mut self, index: u64, value: T) -> Vec<(u64, T)> {
        self.pending.insert(index, value);
        let mut ready = Vec::new();
        while let Some(value) = self.pending.remove(&self.next_expected) {
            ready.push((self.next_expected, value));
            self.next_expected += 1;
        }
        ready
    }
}

impl<T> Default for OrderingWrapper<T> {
    fn default() -> OrderingWrapper<T> {
        OrderingWrapper::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordering_wrapper_buffers_out_of_order_arrivals() {
        let mut wrapper = OrderingWrapper::new();
        assert_eq!(wrapper.accept(1, "b"), Vec::<(u64, &str)>::new());
        assert_eq!(wrapper.accept(2, "c"), Vec::<(u64, &str)>::new());
        assert_eq!(wrapper.accept(0, "a"), vec![(0, "a"), (1, "b"), (2, "c")]);
        assert_eq!(wrapper.accept(3, "d"), vec![(3, "d")]);
    }

    #[tokio::test]
    async fn worker_pool_preserves_shot_order_despite_varied_latency() {
        let shots: Vec<Shot<u64>> = (0..6)
            .map(|i| Shot {
                index: i,
                compile: Box::new(move || Ok(i * i)),
            })
            .collect();
        let mut results = run_shot_pool(shots, Config { workers: 3, ..Config::default() }).await;
        results.sort_by_key(|(index, _)| *index);
        for (index, result) in results {
            assert_eq!(result.unwrap(), index * index);
        }
    }

    #[tokio::test]
    async fn non_retryable_failure_surfaces_immediately() {
        let shots: Vec<Shot<u64>> = vec![Shot {
            index: 0,
            compile: Box::new(|| Err("invalid expression".to_string())),
        }];
        let results = run_shot_pool(shots, Config::default()).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0].1, Err(ResourceError::WorkerCrashed { .. })));
    }

    #[tokio::test]
    async fn retryable_failure_exhausts_and_reports() {
        let shots: Vec<Shot<u64>> = vec![Shot {
            index: 0,
            compile: Box::new(|| Err("timeout waiting on device".to_string())),
        }];
        let config = Config { max_retries: 2, backoff_base_millis: 1, ..Config::default() };
        let results = run_shot_pool(shots, config).await;
        assert!(matches!(&results[0].1, Err(ResourceError::RetriesExhausted { attempts: 2, .. })));
    }
}
