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

//! Drives the cycles of one assigned partition.
//!
//! A cycle fetches a batch, runs the filters, splits the batch into virtual
//! partitions, dispatches them to the executor pool and, once every group
//! returned, decides where the next fetch starts and what gets committed.
//! Retry and pause state live here and are only touched between cycles.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::client::BrokerClient;
use crate::message::{Batch, MarkEvent, Message, TopicPartition};
use crate::service::ConsumerConfig;
use crate::{AppError, AppResult};

use super::{
    split, Consume, CycleState, Directives, ExecutorPool, FilterChain, FilterOutcome, Group,
    GroupConsumer, OffsetReconciler, PartitionContext, Partitioner, PauseState, PauseTracker,
    RetryDecision, RetryTracker, TransactionCoordinator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// a batch went through, fetch again
    Continue,
    /// nothing to fetch
    Idle,
    /// parked until the pause expires
    Paused { until: Instant },
    /// the partition was taken away, no more cycles
    Revoked,
}

pub struct PartitionSupervisor<B: BrokerClient, C: Consume<B>> {
    context: Arc<PartitionContext<B>>,
    consumer: Arc<C>,
    executor: Arc<ExecutorPool>,
    partitioner: Arc<dyn Partitioner>,
    filters: FilterChain,
    retry: RetryTracker,
    pause: PauseTracker,
    max_messages: usize,
    next_offset: i64,
    revoke_notified: bool,
}

impl<B: BrokerClient, C: Consume<B>> std::fmt::Debug for PartitionSupervisor<B, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSupervisor")
            .field("topic_partition", self.context.topic_partition())
            .field("next_offset", &self.next_offset)
            .field("pause", &self.pause.state())
            .finish()
    }
}

impl<B: BrokerClient, C: Consume<B>> PartitionSupervisor<B, C> {
    /// Takes over a partition, fetching starts at its committed offset.
    pub async fn assign(
        topic_partition: TopicPartition,
        config: &ConsumerConfig,
        coordinator: TransactionCoordinator<B>,
        consumer: Arc<C>,
        executor: Arc<ExecutorPool>,
        partitioner: Arc<dyn Partitioner>,
        filters: FilterChain,
    ) -> AppResult<Self> {
        let committed = coordinator.client().committed(&topic_partition).await?;
        let next_offset = committed.as_ref().map_or(0, |c| c.offset);
        info!(
            "assigned {}, starting at offset {}",
            topic_partition, next_offset
        );

        let context = Arc::new(PartitionContext::new(
            topic_partition,
            coordinator,
            OffsetReconciler::new(config.offsets.offset_metadata_strategy),
            config.offsets.manual_offset_management,
        ));
        Ok(Self {
            context,
            consumer,
            executor,
            partitioner,
            filters,
            retry: RetryTracker::from_config(&config.dead_letter),
            pause: PauseTracker::from_config(&config.pause),
            max_messages: config.processing.max_messages,
            next_offset,
            revoke_notified: false,
        })
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        self.context.topic_partition()
    }

    pub fn context(&self) -> &Arc<PartitionContext<B>> {
        &self.context
    }

    /// Where the next fetch starts.
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn pause_state(&self) -> PauseState {
        self.pause.state()
    }

    /// The running cycle completes, but nothing more is committed.
    pub fn revoke(&self) {
        self.context.revoke();
    }

    pub async fn offset_metadata(&self, cache: bool) -> AppResult<Option<String>> {
        self.context.offset_metadata(cache).await
    }

    /// Runs one cycle. An error is fatal for this partition.
    pub async fn run_cycle(&mut self) -> AppResult<CycleOutcome> {
        if self.context.is_revoked() {
            if !self.revoke_notified {
                self.revoke_notified = true;
                self.consumer.revoked(self.context.topic_partition()).await;
            }
            return Ok(CycleOutcome::Revoked);
        }

        let now = Instant::now();
        if let Some(until) = self.pause.resume_at() {
            if until > now {
                return Ok(CycleOutcome::Paused { until });
            }
            if let Some(offset) = self.pause.resume() {
                debug!("{} resumed at {}", self.topic_partition(), offset);
                self.next_offset = offset;
            }
        }

        let topic_partition = self.context.topic_partition().clone();
        let mut batch = self
            .context
            .coordinator()
            .client()
            .fetch(&topic_partition, self.next_offset, self.max_messages)
            .await?;
        let Some(fetched_last) = batch.last_offset() else {
            return Ok(CycleOutcome::Idle);
        };

        let filtered = self.filters.apply(&mut batch);
        let groups = split(&batch, self.partitioner.as_ref());
        let cycle = Arc::new(CycleState::new(self.context.clone(), &groups));
        debug!(
            "{} cycle from {}: {} messages in {} groups",
            topic_partition,
            self.next_offset,
            batch.len(),
            groups.len()
        );

        if let FilterOutcome::Skip {
            last_dropped: Some(offset),
        } = filtered
        {
            let lane = cycle.tracker().engine_lane();
            cycle.tracker().record(lane, MarkEvent::new(offset, None));
        }

        let (succeeded, failed) = self.dispatch(&cycle, &groups).await?;
        let directives = cycle.take_directives();
        let manual = self.context.is_manual();

        if !manual && directives.pause.is_none() && directives.seek.is_none() {
            for index in succeeded {
                Self::auto_mark(&cycle, &groups[index]);
            }
        }

        self.position(&cycle, &batch, fetched_last, filtered, directives, failed)
            .await?;

        if manual {
            cycle.reconcile();
        } else {
            cycle.commit().await?;
        }

        Ok(match self.pause.resume_at() {
            Some(until) => CycleOutcome::Paused { until },
            None => CycleOutcome::Continue,
        })
    }

    /// Runs every group, returns the indexes of the successful ones and
    /// whether any failed. A fatal error ends the cycle without commit.
    async fn dispatch(
        &self,
        cycle: &Arc<CycleState<B>>,
        groups: &[Group],
    ) -> AppResult<(Vec<usize>, bool)> {
        let jobs = groups
            .iter()
            .map(|group| {
                let consumer = self.consumer.clone();
                let handle = GroupConsumer::new(cycle.clone(), group);
                (group.index, async move { consumer.consume(handle).await })
            })
            .collect();
        let outcomes = self.executor.dispatch(jobs).await?;

        let mut succeeded = Vec::with_capacity(outcomes.len());
        let mut failed = false;
        let mut fatal = None;
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => {
                    debug!("group {} done in {:?}", outcome.index, outcome.elapsed);
                    succeeded.push(outcome.index);
                }
                Err(e) if e.is_recoverable() => {
                    warn!(
                        "group {} of {} failed after {:?}: {}",
                        outcome.index,
                        self.topic_partition(),
                        outcome.elapsed,
                        e
                    );
                    failed = true;
                }
                Err(e) => {
                    error!(
                        "group {} of {} failed fatally: {}",
                        outcome.index,
                        self.topic_partition(),
                        e
                    );
                    fatal.get_or_insert(e);
                }
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok((succeeded, failed)),
        }
    }

    fn auto_mark(cycle: &CycleState<B>, group: &Group) {
        let Some(last) = group.last_offset() else {
            return;
        };
        let tracker = cycle.tracker();
        if tracker.highest(group.index).map_or(true, |h| h < last) {
            tracker.record(group.index, MarkEvent::new(last, None));
        }
    }

    /// Decides the next fetch offset. User positioning first, then the
    /// retry path, then filters.
    async fn position(
        &mut self,
        cycle: &CycleState<B>,
        batch: &Batch,
        fetched_last: i64,
        filtered: FilterOutcome,
        directives: Directives,
        failed: bool,
    ) -> AppResult<()> {
        let now = Instant::now();
        let head = failed.then(|| {
            let processed_end = batch.last_offset().map_or(self.next_offset, |o| o + 1);
            OffsetReconciler::first_unresolved(cycle.group_offsets(), &cycle.tracker().snapshot())
                .unwrap_or(processed_end)
        });

        if let Some(request) = directives.pause {
            if let Some(head) = head {
                self.retry.record_failure(head);
            }
            let timeout = self.pause.pause(request.offset, request.timeout, true, now);
            info!(
                "{} paused by consumer at {} for {:?}",
                self.topic_partition(),
                request.offset,
                timeout
            );
            self.next_offset = request.offset;
            return Ok(());
        }

        if let Some(offset) = directives.seek {
            if let Some(head) = head {
                self.retry.record_failure(head);
            }
            debug!("{} seeks to {}", self.topic_partition(), offset);
            self.next_offset = offset;
            return Ok(());
        }

        if let Some(head) = head {
            if let RetryDecision::DeadLetter { offset, attempts } = self.retry.record_failure(head) {
                if let Some(message) = batch.messages().iter().find(|m| m.offset == offset) {
                    self.dead_letter(cycle, message, attempts).await?;
                    self.pause.reset();
                    self.next_offset = offset + 1;
                    return Ok(());
                }
                warn!(
                    "offset {} of {} out of retries but not in the batch",
                    offset,
                    self.topic_partition()
                );
            }
            let timeout = self.pause.pause(head, None, false, now);
            warn!(
                "{} retries from {} in {:?}, attempt {}",
                self.topic_partition(),
                head,
                timeout,
                self.retry.attempts(head)
            );
            self.next_offset = head;
            return Ok(());
        }

        self.retry.reset();
        self.pause.reset();
        match filtered {
            FilterOutcome::Seek { offset, timeout } => {
                self.next_offset = offset;
                if let Some(timeout) = timeout {
                    self.pause.pause(offset, Some(timeout), false, now);
                }
            }
            FilterOutcome::Pass | FilterOutcome::Skip { .. } => {
                self.next_offset = fetched_last + 1;
            }
        }
        Ok(())
    }

    /// Produces the message to the dead letter topic and resolves its offset.
    async fn dead_letter(
        &mut self,
        cycle: &CycleState<B>,
        message: &Message,
        attempts: u32,
    ) -> AppResult<()> {
        let record = self
            .retry
            .dead_letter_record(message, attempts)
            .ok_or_else(|| {
                AppError::IllegalStateError("dead letter without a target topic".to_string())
            })?;
        let topic = record.topic.clone();
        self.context.coordinator().produce(record).await?;
        info!(
            "offset {} of {} dead lettered to {} after {} attempts",
            message.offset,
            self.topic_partition(),
            topic,
            attempts
        );

        let lane = cycle.tracker().engine_lane();
        cycle
            .tracker()
            .record(lane, MarkEvent::new(message.offset, None));
        self.retry.resolve(message.offset);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use tokio::sync::{broadcast, mpsc};

    use crate::client::InMemoryBroker;
    use crate::processing::{FilterChain, RoundRobin, SinglePartition, Throttler};

    use super::*;

    struct MarkAll;

    impl Consume<InMemoryBroker> for MarkAll {
        async fn consume(&self, consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
            for message in consumer.messages() {
                consumer.mark_as_consumed(message, Some(message.offset.to_string()));
            }
            Ok(())
        }
    }

    /// Fails on the first attempt at every batch.
    struct FlakyOnce {
        calls: AtomicI64,
    }

    impl Consume<InMemoryBroker> for FlakyOnce {
        async fn consume(&self, _consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 0 {
                return Err(AppError::consume("first try"));
            }
            Ok(())
        }
    }

    struct Halting;

    impl Consume<InMemoryBroker> for Halting {
        async fn consume(&self, _consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
            Err(AppError::InvalidValue("bad schema".to_string()))
        }
    }

    fn seeded(count: usize) -> (Arc<InMemoryBroker>, TopicPartition) {
        let broker = Arc::new(InMemoryBroker::new());
        broker.create_topic("events", 1);
        let tp = TopicPartition::new("events", 0);
        for i in 0..count {
            broker.append(&tp, None, i.to_string());
        }
        (broker, tp)
    }

    fn config() -> ConsumerConfig {
        let mut config = ConsumerConfig::default();
        config.processing.max_messages = 10;
        config.pause.pause_timeout_ms = 10;
        config.pause.pause_max_timeout_ms = 100;
        config
    }

    fn executor() -> Arc<ExecutorPool> {
        let (notify, _) = broadcast::channel(1);
        let (complete_tx, _) = mpsc::channel(1);
        Arc::new(ExecutorPool::new(4, notify, complete_tx))
    }

    async fn supervisor<C: Consume<InMemoryBroker>>(
        broker: &Arc<InMemoryBroker>,
        tp: &TopicPartition,
        config: &ConsumerConfig,
        consumer: C,
        partitioner: Arc<dyn Partitioner>,
        filters: FilterChain,
    ) -> AppResult<PartitionSupervisor<InMemoryBroker, C>> {
        PartitionSupervisor::assign(
            tp.clone(),
            config,
            TransactionCoordinator::new(broker.clone()),
            Arc::new(consumer),
            executor(),
            partitioner,
            filters,
        )
        .await
    }

    #[tokio::test]
    async fn test_cycles_commit_whole_batches() -> AppResult<()> {
        let (broker, tp) = seeded(25);
        let mut supervisor = supervisor(
            &broker,
            &tp,
            &config(),
            MarkAll,
            Arc::new(RoundRobin::new(3)),
            FilterChain::default(),
        )
        .await?;

        assert_eq!(supervisor.run_cycle().await?, CycleOutcome::Continue);
        assert_eq!(supervisor.next_offset(), 10);
        assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(10));
        assert_eq!(supervisor.offset_metadata(true).await?.as_deref(), Some("9"));

        supervisor.run_cycle().await?;
        supervisor.run_cycle().await?;
        assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(25));
        assert_eq!(supervisor.run_cycle().await?, CycleOutcome::Idle);
        assert_eq!(broker.fetch_history(&tp), vec![0, 10, 20, 25]);
        Ok(())
    }

    #[tokio::test]
    async fn test_assign_resumes_from_committed() -> AppResult<()> {
        let (broker, tp) = seeded(20);
        broker.commit(&tp, 12, None).await?;
        let mut supervisor = supervisor(
            &broker,
            &tp,
            &config(),
            MarkAll,
            Arc::new(SinglePartition),
            FilterChain::default(),
        )
        .await?;
        assert_eq!(supervisor.next_offset(), 12);
        supervisor.run_cycle().await?;
        assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(20));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_pauses_and_redelivers() -> AppResult<()> {
        let (broker, tp) = seeded(5);
        let consumer = FlakyOnce {
            calls: AtomicI64::new(0),
        };
        let mut supervisor = supervisor(
            &broker,
            &tp,
            &config(),
            consumer,
            Arc::new(SinglePartition),
            FilterChain::default(),
        )
        .await?;

        let outcome = supervisor.run_cycle().await?;
        let CycleOutcome::Paused { until } = outcome else {
            panic!("expected a pause, got {:?}", outcome);
        };
        assert_eq!(supervisor.next_offset(), 0);
        assert_eq!(broker.committed_offset(&tp), None);
        assert_eq!(supervisor.run_cycle().await?, outcome);

        tokio::time::sleep_until(until).await;
        assert_eq!(supervisor.run_cycle().await?, CycleOutcome::Continue);
        // automatic marking covered the batch
        assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(5));
        assert_eq!(broker.fetch_history(&tp), vec![0, 0]);
        Ok(())
    }

    #[tokio::test]
    async fn test_fatal_error_halts_without_commit() -> AppResult<()> {
        let (broker, tp) = seeded(5);
        let mut supervisor = supervisor(
            &broker,
            &tp,
            &config(),
            Halting,
            Arc::new(SinglePartition),
            FilterChain::default(),
        )
        .await?;
        let result = supervisor.run_cycle().await;
        assert!(matches!(result, Err(AppError::InvalidValue(_))));
        assert_eq!(broker.committed_offset(&tp), None);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_filter_seek_holds_back_rest_of_batch() -> AppResult<()> {
        let (broker, tp) = seeded(10);
        let filters = FilterChain::new(vec![Box::new(Throttler::new(
            4,
            Duration::from_secs(1),
        ))]);
        let mut supervisor = supervisor(
            &broker,
            &tp,
            &config(),
            MarkAll,
            Arc::new(SinglePartition),
            filters,
        )
        .await?;

        let outcome = supervisor.run_cycle().await?;
        assert!(matches!(outcome, CycleOutcome::Paused { .. }));
        assert_eq!(supervisor.next_offset(), 4);
        assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(4));
        Ok(())
    }

    #[tokio::test]
    async fn test_revoked_partition_stops() -> AppResult<()> {
        let (broker, tp) = seeded(5);
        let mut supervisor = supervisor(
            &broker,
            &tp,
            &config(),
            MarkAll,
            Arc::new(SinglePartition),
            FilterChain::default(),
        )
        .await?;
        supervisor.revoke();
        assert_eq!(supervisor.run_cycle().await?, CycleOutcome::Revoked);
        assert!(broker.fetch_history(&tp).is_empty());
        Ok(())
    }
}
