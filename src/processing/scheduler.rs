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

use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::client::BrokerClient;
use crate::message::TopicPartition;
use crate::service::ConsumerConfig;
use crate::{AppError, AppResult, Shutdown};

use super::{
    partitioner_from_config, Consume, CycleOutcome, ExecutorPool, FilterChain, FilterFactory,
    PartitionContext, PartitionSupervisor, Partitioner, TransactionCoordinator,
};

type CycleResult<B, C> = (PartitionSupervisor<B, C>, AppResult<CycleOutcome>);

/// Partitions waiting in the delay queue, keyed for early wake up.
struct Parked<B: BrokerClient, C: Consume<B>> {
    queue: DelayQueue<PartitionSupervisor<B, C>>,
    keys: HashMap<TopicPartition, Key>,
}

impl<B: BrokerClient, C: Consume<B>> Parked<B, C> {
    fn new() -> Self {
        Self {
            queue: DelayQueue::new(),
            keys: HashMap::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn insert(&mut self, supervisor: PartitionSupervisor<B, C>, until: Instant) {
        let topic_partition = supervisor.topic_partition().clone();
        let key = self.queue.insert_at(supervisor, until);
        self.keys.insert(topic_partition, key);
    }

    /// Takes a partition out before its time is up.
    fn wake(&mut self, topic_partition: &TopicPartition) -> Option<PartitionSupervisor<B, C>> {
        let key = self.keys.remove(topic_partition)?;
        Some(self.queue.remove(&key).into_inner())
    }

    async fn next_expired(&mut self) -> Option<PartitionSupervisor<B, C>> {
        let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let supervisor = expired.into_inner();
        self.keys.remove(supervisor.topic_partition());
        Some(supervisor)
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.keys.clear();
    }
}

/// Runs the cycles of every assigned partition.
///
/// Each partition has at most one cycle in flight. Partitions waiting on a
/// pause or on new messages sit in a delay queue, so one paused partition
/// never holds up the others.
pub struct Scheduler<B: BrokerClient, C: Consume<B>> {
    config: Arc<ConsumerConfig>,
    coordinator: TransactionCoordinator<B>,
    consumer: Arc<C>,
    executor: Arc<ExecutorPool>,
    partitioner: Arc<dyn Partitioner>,
    filter_factory: Option<FilterFactory>,
    contexts: DashMap<TopicPartition, Arc<PartitionContext<B>>>,
    notify_shutdown: broadcast::Sender<()>,
    revoked_tx: mpsc::UnboundedSender<TopicPartition>,
    revoked_rx: Mutex<Option<mpsc::UnboundedReceiver<TopicPartition>>>,
}

impl<B: BrokerClient, C: Consume<B>> Scheduler<B, C> {
    pub fn new(
        config: Arc<ConsumerConfig>,
        client: Arc<B>,
        consumer: Arc<C>,
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
    ) -> Self {
        let executor = Arc::new(ExecutorPool::new(
            config.processing.concurrency,
            notify_shutdown.clone(),
            shutdown_complete_tx,
        ));
        let partitioner = partitioner_from_config(&config.virtual_partitions);
        let (revoked_tx, revoked_rx) = mpsc::unbounded_channel();
        Self {
            coordinator: TransactionCoordinator::new(client),
            consumer,
            executor,
            partitioner,
            filter_factory: None,
            contexts: DashMap::new(),
            notify_shutdown,
            revoked_tx,
            revoked_rx: Mutex::new(Some(revoked_rx)),
            config,
        }
    }

    /// Replaces the configured partitioner, e.g. with a closure.
    pub fn with_partitioner(mut self, partitioner: Arc<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_filters(mut self, filter_factory: FilterFactory) -> Self {
        self.filter_factory = Some(filter_factory);
        self
    }

    /// Marks a partition as taken away. A parked partition is released right
    /// away, a running one once its cycle is over. Returns false if it is not
    /// running.
    pub fn revoke(&self, topic_partition: &TopicPartition) -> bool {
        match self.contexts.get(topic_partition) {
            Some(context) => {
                context.revoke();
                if self.revoked_tx.send(topic_partition.clone()).is_err() {
                    debug!("scheduler gone, {} revoked in place", topic_partition);
                }
                true
            }
            None => false,
        }
    }

    pub fn assigned(&self) -> Vec<TopicPartition> {
        self.contexts.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn is_assigned(&self, topic_partition: &TopicPartition) -> bool {
        self.contexts.contains_key(topic_partition)
    }

    async fn assign(
        &self,
        topic_partition: TopicPartition,
    ) -> AppResult<PartitionSupervisor<B, C>> {
        let filters = match &self.filter_factory {
            Some(factory) => FilterChain::new(factory(&topic_partition)),
            None => FilterChain::default(),
        };
        let supervisor = PartitionSupervisor::assign(
            topic_partition.clone(),
            &self.config,
            self.coordinator.clone(),
            self.consumer.clone(),
            self.executor.clone(),
            self.partitioner.clone(),
            filters,
        )
        .await?;
        self.contexts
            .insert(topic_partition, supervisor.context().clone());
        Ok(supervisor)
    }

    /// Consumes the given partitions until shutdown, or until every one of
    /// them is revoked or halted. In-flight cycles always run to completion.
    pub async fn run(&self, partitions: Vec<TopicPartition>) -> AppResult<()> {
        let mut revoked = self
            .revoked_rx
            .lock()
            .take()
            .ok_or_else(|| AppError::IllegalStateError("scheduler already ran".to_string()))?;
        let mut shutdown = Shutdown::subscribe("scheduler", &self.notify_shutdown);
        let mut running: JoinSet<CycleResult<B, C>> = JoinSet::new();
        let mut parked = Parked::new();
        let idle_wait = Duration::from_millis(self.config.processing.idle_wait_ms);

        for topic_partition in partitions {
            match self.assign(topic_partition.clone()).await {
                Ok(supervisor) => Self::spawn_cycle(&mut running, supervisor),
                Err(e) => error!("failed to assign {}: {}", topic_partition, e),
            }
        }

        loop {
            if running.is_empty() && parked.is_empty() {
                break;
            }
            tokio::select! {
                cause = shutdown.recv(), if !shutdown.is_shutdown() => {
                    info!(
                        "scheduler shutting down ({:?}), waiting for {} running cycles",
                        cause,
                        running.len()
                    );
                    parked.clear();
                }
                Some(joined) = running.join_next() => {
                    let (supervisor, result) = match joined {
                        Ok(done) => done,
                        Err(e) => {
                            error!("cycle task failed: {}", e);
                            continue;
                        }
                    };
                    let topic_partition = supervisor.topic_partition().clone();
                    match result {
                        Err(e) if shutdown.is_shutdown() => {
                            warn!("{} stopped during shutdown: {}", topic_partition, e);
                            self.release(&topic_partition);
                        }
                        Err(e) => {
                            error!("{} halted: {}", topic_partition, e);
                            self.release(&topic_partition);
                        }
                        Ok(_) if shutdown.is_shutdown() => self.release(&topic_partition),
                        Ok(CycleOutcome::Continue) => Self::spawn_cycle(&mut running, supervisor),
                        // revoked mid cycle, the next one releases it
                        Ok(CycleOutcome::Idle | CycleOutcome::Paused { .. })
                            if supervisor.context().is_revoked() =>
                        {
                            Self::spawn_cycle(&mut running, supervisor)
                        }
                        Ok(CycleOutcome::Idle) => {
                            parked.insert(supervisor, Instant::now() + idle_wait);
                        }
                        Ok(CycleOutcome::Paused { until }) => {
                            debug!("{} parked until {:?}", topic_partition, until);
                            parked.insert(supervisor, until);
                        }
                        Ok(CycleOutcome::Revoked) => {
                            info!("{} released", topic_partition);
                            self.release(&topic_partition);
                        }
                    }
                }
                Some(supervisor) = parked.next_expired(), if !parked.is_empty() => {
                    Self::spawn_cycle(&mut running, supervisor);
                }
                Some(topic_partition) = revoked.recv() => {
                    if let Some(supervisor) = parked.wake(&topic_partition) {
                        debug!("{} revoked while parked", topic_partition);
                        Self::spawn_cycle(&mut running, supervisor);
                    }
                }
                else => break,
            }
        }

        self.contexts.clear();
        self.executor.shutdown();
        info!("scheduler stopped");
        Ok(())
    }

    fn spawn_cycle(
        running: &mut JoinSet<CycleResult<B, C>>,
        mut supervisor: PartitionSupervisor<B, C>,
    ) {
        running.spawn(async move {
            let result = supervisor.run_cycle().await;
            (supervisor, result)
        });
    }

    fn release(&self, topic_partition: &TopicPartition) {
        self.contexts.remove(topic_partition);
    }
}
