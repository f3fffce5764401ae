// Bounded "parallel map" used by every fan-out stage.

use std::future::Future;
use std::sync::Arc;

use futures::future::join_all;
use log::debug;
use tokio::sync::Semaphore;

use crate::config::defs::PipelineError;

/// Runs `worker` over every item with at most `workers` in flight, and
/// returns only once all of them have finished.
///
/// # Arguments
///
/// * `stage` - Name used in logs.
/// * `items` - Work items. Callers guarantee no two items write the same path.
/// * `workers` - Pool size, at least 1.
/// * `worker` - Async function run once per item.
///
/// # Returns
/// The first error in item order, after the whole batch has drained.
pub async fn parallel_map<T, F, Fut>(
    stage: &str,
    items: Vec<T>,
    workers: usize,
    worker: F,
) -> Result<(), PipelineError>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let workers = workers.max(1);
    debug!("{}: {} items on {} workers", stage, items.len(), workers);

    let semaphore = Arc::new(Semaphore::new(workers));
    let worker = Arc::new(worker);
    let handles: Vec<_> = items
        .into_iter()
        .map(|item| {
            let semaphore = Arc::clone(&semaphore);
            let worker = Arc::clone(&worker);
            tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Other(e.into()))?;
                worker(item).await
            })
        })
        .collect();

    let mut first_error = None;
    for joined in join_all(handles).await {
        let result = joined.map_err(|e| PipelineError::Other(anyhow::anyhow!("Worker task failed: {}", e)));
        if let Err(e) = result.and_then(|r| r) {
            if first_error.is_none() {
                first_error = Some(e);
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{sleep, Duration};

    #[tokio::test]
    async fn test_parallel_map_respects_pool_size() -> anyhow::Result<()> {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));
        let (a, p, d) = (active.clone(), peak.clone(), done.clone());
        parallel_map("test", (0..12).collect(), 3, move |_i: usize| {
            let (a, p, d) = (a.clone(), p.clone(), d.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_millis(5)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await?;
        assert_eq!(done.load(Ordering::SeqCst), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_parallel_map_drains_before_failing() {
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        let result = parallel_map("test", (0..6).collect(), 2, move |i: usize| {
            let d = d.clone();
            async move {
                sleep(Duration::from_millis(2)).await;
                d.fetch_add(1, Ordering::SeqCst);
                if i == 1 {
                    Err(PipelineError::Precondition(format!("item {}", i)))
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(done.load(Ordering::SeqCst), 6);
        match result {
            Err(PipelineError::Precondition(msg)) => assert_eq!(msg, "item 1"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
