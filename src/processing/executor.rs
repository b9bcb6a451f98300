// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded pool running the consumption logic of virtual partitions.
//!
//! `concurrency` workers drain one shared queue. Every group runs in its own
//! spawned task, so a panicking consumer is reported as
//! [`AppError::ConsumerPanicked`] and the worker carries on.

use std::any::type_name;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace};

use crate::{AppError, AppResult, Shutdown};

type GroupJob = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'static>>;

struct GroupTask {
    index: usize,
    job: GroupJob,
    reply: oneshot::Sender<GroupOutcome>,
}

/// Result of one group's consumption logic.
#[derive(Debug)]
pub struct GroupOutcome {
    pub index: usize,
    pub result: AppResult<()>,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub struct ExecutorPool {
    sender: async_channel::Sender<GroupTask>,
    concurrency: usize,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for GroupTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTask")
            .field("index", &self.index)
            .finish()
    }
}

impl ExecutorPool {
    /// Starts the workers. Each one holds a clone of `shutdown_complete_tx`,
    /// so the receiving side completes once every worker has exited.
    pub fn new(
        concurrency: usize,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (sender, receiver) = async_channel::bounded(concurrency * 2);

        for id in 0..concurrency {
            Self::spawn_worker(
                id,
                receiver.clone(),
                Shutdown::subscribe(format!("executor worker {id}"), &notify_shutdown),
                shutdown_complete_tx.clone(),
            );
        }

        Self {
            sender,
            concurrency,
            notify_shutdown,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Stops the workers once the queued groups ran.
    pub fn shutdown(&self) {
        let _ = self.notify_shutdown.send(());
    }

    /// Submits every job of a cycle, then waits for all of them. A failing
    /// job never cancels its siblings. Outcomes come back ordered by index.
    pub async fn dispatch<F>(&self, jobs: Vec<(usize, F)>) -> AppResult<Vec<GroupOutcome>>
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        let mut replies = Vec::with_capacity(jobs.len());
        for (index, job) in jobs {
            let (reply, receiver) = oneshot::channel();
            let task = GroupTask {
                index,
                job: Box::pin(job),
                reply,
            };
            self.sender.send(task).await.map_err(|e| {
                AppError::ChannelSendError(format!("executor pool closed: {}", e))
            })?;
            replies.push(receiver);
        }

        let mut outcomes = Vec::with_capacity(replies.len());
        for receiver in replies {
            let outcome = receiver
                .await
                .map_err(|e| AppError::ChannelRecvError(format!("group outcome lost: {}", e)))?;
            outcomes.push(outcome);
        }
        outcomes.sort_by_key(|outcome| outcome.index);
        Ok(outcomes)
    }

    fn spawn_worker(
        id: usize,
        receiver: async_channel::Receiver<GroupTask>,
        mut shutdown: Shutdown,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) {
        tokio::spawn(async move {
            debug!("executor worker {id} started");
            loop {
                tokio::select! {
                    task = receiver.recv() => {
                        match task {
                            Ok(task) => Self::run(id, task).await,
                            Err(_) => break,
                        }
                    }
                    _ = shutdown.recv(), if !shutdown.is_shutdown() => {
                        // queued groups still run, nothing new gets in
                        debug!("executor worker {id} draining before shutdown");
                        receiver.close();
                    }
                }
            }
            debug!("executor worker {id} exited");
            drop(shutdown_complete_tx);
        });
    }

    async fn run(worker: usize, task: GroupTask) {
        let GroupTask { index, job, reply } = task;
        let start = Instant::now();
        let result = match tokio::spawn(job).await {
            Ok(result) => result,
            Err(err) if err.is_panic() => Err(AppError::ConsumerPanicked(panic_message(err))),
            Err(err) => Err(AppError::ConsumerPanicked(format!("group task cancelled: {}", err))),
        };
        let elapsed = start.elapsed();
        trace!(
            "worker {} ran group {} in {:?}, ok: {}",
            worker,
            index,
            elapsed,
            result.is_ok()
        );
        if let Err(AppError::ConsumerPanicked(message)) = &result {
            error!("group {} panicked: {}", index, message);
        }
        // the dispatcher may be gone if its cycle was abandoned
        let _ = reply.send(GroupOutcome {
            index,
            result,
            elapsed,
        });
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        format!("panic payload of type {}", get_type_name(&payload))
    }
}

#[inline]
fn get_type_name<R>(_: &R) -> &'static str {
    type_name::<R>()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn pool(concurrency: usize) -> (ExecutorPool, broadcast::Sender<()>, mpsc::Receiver<()>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
        let pool = ExecutorPool::new(concurrency, notify_shutdown.clone(), shutdown_complete_tx);
        (pool, notify_shutdown, shutdown_complete_rx)
    }

    #[tokio::test]
    async fn test_failures_do_not_cancel_siblings() -> AppResult<()> {
        let (pool, _notify, _complete) = pool(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let jobs = (0..5)
            .map(|index| {
                let ran = ran.clone();
                let job = async move {
                    ran.fetch_add(1, Ordering::SeqCst);
                    if index == 1 {
                        return Err(AppError::consume("boom"));
                    }
                    if index == 3 {
                        panic!("consumer blew up");
                    }
                    Ok(())
                };
                (index, job)
            })
            .collect();

        let outcomes = pool.dispatch(jobs).await?;
        assert_eq!(ran.load(Ordering::SeqCst), 5);
        let indexes: Vec<usize> = outcomes.iter().map(|o| o.index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3, 4]);
        assert!(matches!(outcomes[1].result, Err(AppError::ConsumeError(_))));
        match &outcomes[3].result {
            Err(AppError::ConsumerPanicked(message)) => assert_eq!(message, "consumer blew up"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(outcomes[4].result.is_ok());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() -> AppResult<()> {
        let (pool, _notify, _complete) = pool(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let jobs = (0..8)
            .map(|index| {
                let running = running.clone();
                let peak = peak.clone();
                let job = async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                };
                (index, job)
            })
            .collect();

        pool.dispatch(jobs).await?;
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.concurrency(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_workers() {
        let (pool, notify, mut complete) = pool(3);
        notify.send(()).expect("workers subscribed");
        drop(pool);
        assert_eq!(complete.recv().await, None);
    }
}
