//! Bounded fan-out across targets.
//!
//! Work items are spawned onto a [`JoinSet`], each gated by a shared
//! [`Semaphore`] so at most `limit` run at once. Results are collected in
//! input order. Items still running at the deadline are aborted and reported
//! as [`Slot::Expired`]; one slow item never holds back its siblings' results.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::operation::OperationId;

/// Outcome of one fanned-out work item.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum Slot<T> {
    /// The item finished.
    Done(T),
    /// The overall deadline passed first.
    Expired,
    /// The task panicked or could not acquire a worker slot.
    Crashed(String),
}

/// Per-target results of a fan-out operation, in input order.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct FanOutReport<R> {
    /// Operation that produced the report.
    pub operation_id: OperationId,
    /// One result per target.
    pub results: Vec<R>,
}

impl<R> FanOutReport<R> {
    /// Counts results matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&R) -> bool) -> usize {
        self.results.iter().filter(|result| predicate(result)).count()
    }
}

/// Raised when the caller cancels a fan-out.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct FanOutCancelled;

/// Runs `work` for every item with at most `limit` in flight.
pub(crate) async fn fan_out<I, T, F, Fut>(
    items: Vec<I>,
    limit: usize,
    deadline: Instant,
    cancel: &CancellationToken,
    work: F,
) -> Result<Vec<Slot<T>>, FanOutCancelled>
where
    F: Fn(I) -> Fut,
    Fut: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let gate = Arc::new(Semaphore::new(limit.max(1)));
    let mut tasks = JoinSet::new();
    let mut slots = Vec::with_capacity(items.len());

    for (index, item) in items.into_iter().enumerate() {
        slots.push(None);
        let permit_source = Arc::clone(&gate);
        let job = work(item);
        tasks.spawn(async move {
            let Ok(_permit) = permit_source.acquire_owned().await else {
                return (index, Slot::Crashed(String::from("worker pool closed")));
            };
            (index, Slot::Done(job.await))
        });
    }

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                tasks.abort_all();
                return Err(FanOutCancelled);
            }
            () = tokio::time::sleep_until(deadline) => {
                tasks.abort_all();
                break;
            }
            joined = tasks.join_next() => match joined {
                Some(Ok((index, slot))) => {
                    if let Some(entry) = slots.get_mut(index) {
                        *entry = Some(slot);
                    }
                }
                Some(Err(err)) => warn!(error = %err, "fan-out task ended abnormally"),
                None => break,
            },
        }
    }

    Ok(slots
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                if Instant::now() >= deadline {
                    Slot::Expired
                } else {
                    Slot::Crashed(String::from("task panicked"))
                }
            })
        })
        .collect())
}
