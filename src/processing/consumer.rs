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

//! What consumption logic sees of a cycle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::client::BrokerClient;
use crate::message::{MarkEvent, Message, ReconciledOffset, TopicPartition};
use crate::{AppError, AppResult};

use super::{Group, MarkingTracker, PartitionContext, Transaction};

/// User consumption logic, called once per virtual partition and cycle.
///
/// Returning an error (or panicking) fails the group: its unmarked messages
/// are redelivered. Recoverable errors go through retry and dead lettering,
/// anything else halts the partition.
pub trait Consume<B: BrokerClient>: Send + Sync + 'static {
    fn consume(&self, consumer: GroupConsumer<B>) -> impl Future<Output = AppResult<()>> + Send;

    /// Called once when the partition is taken away.
    fn revoked(&self, _topic_partition: &TopicPartition) -> impl Future<Output = ()> + Send {
        std::future::ready(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PauseRequest {
    pub offset: i64,
    pub timeout: Option<Duration>,
}

/// Positioning requested by consumption logic during a cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Directives {
    pub pause: Option<PauseRequest>,
    pub seek: Option<i64>,
}

/// Everything the groups of one cycle share.
#[derive(Debug)]
pub struct CycleState<B: BrokerClient> {
    context: Arc<PartitionContext<B>>,
    group_offsets: Vec<Vec<i64>>,
    tracker: MarkingTracker,
    directives: Mutex<Directives>,
}

impl<B: BrokerClient> CycleState<B> {
    pub fn new(context: Arc<PartitionContext<B>>, groups: &[Group]) -> Self {
        Self {
            context,
            group_offsets: groups.iter().map(Group::offsets).collect(),
            tracker: MarkingTracker::new(groups.len()),
            directives: Mutex::new(Directives::default()),
        }
    }

    pub fn context(&self) -> &Arc<PartitionContext<B>> {
        &self.context
    }

    pub fn tracker(&self) -> &MarkingTracker {
        &self.tracker
    }

    pub fn group_offsets(&self) -> &[Vec<i64>] {
        &self.group_offsets
    }

    /// Whether `message` was fetched by this cycle. Anything else must not
    /// be marked here.
    pub fn owns(&self, message: &Message) -> bool {
        let topic_partition = self.context.topic_partition();
        message.topic == topic_partition.topic
            && message.partition == topic_partition.partition
            && self
                .group_offsets
                .iter()
                .any(|group| group.binary_search(&message.offset).is_ok())
    }

    /// Reconciles the marks so far and remembers the result as the cached
    /// offset of the partition.
    pub fn reconcile(&self) -> Option<ReconciledOffset> {
        let reconciled = self
            .context
            .reconciler()
            .reconcile(&self.group_offsets, &self.tracker.snapshot());
        if let Some(offset) = &reconciled {
            self.context.cache_offset(offset.clone());
        }
        reconciled
    }

    /// Reconciliation as it would be with `pending` recorded on `lane`.
    pub fn reconcile_with(&self, lane: usize, pending: &[MarkEvent]) -> Option<ReconciledOffset> {
        let mut lanes = self.tracker.snapshot();
        if let Some(events) = lanes.get_mut(lane) {
            events.extend(pending.iter().cloned());
        }
        self.context.reconciler().reconcile(&self.group_offsets, &lanes)
    }

    /// Reconciles and commits. Nothing is committed for a revoked partition or
    /// when nothing was marked.
    pub async fn commit(&self) -> AppResult<Option<ReconciledOffset>> {
        if self.context.is_revoked() {
            debug!(
                "skip commit of revoked partition {}",
                self.context.topic_partition()
            );
            return Ok(None);
        }
        self.context
            .coordinator()
            .commit_with(self.context.topic_partition(), || self.reconcile())
            .await
    }

    /// The lowest requested pause offset wins.
    pub fn request_pause(&self, offset: i64, timeout: Option<Duration>) {
        let mut directives = self.directives.lock();
        match directives.pause {
            Some(current) if current.offset <= offset => {}
            _ => directives.pause = Some(PauseRequest { offset, timeout }),
        }
    }

    pub fn request_seek(&self, offset: i64) {
        self.directives.lock().seek = Some(offset);
    }

    pub fn take_directives(&self) -> Directives {
        std::mem::take(&mut *self.directives.lock())
    }
}

/// Handle given to consumption logic for one virtual partition.
#[derive(Debug)]
pub struct GroupConsumer<B: BrokerClient> {
    cycle: Arc<CycleState<B>>,
    lane: usize,
    messages: Vec<Arc<Message>>,
    in_transaction: Arc<AtomicBool>,
}

impl<B: BrokerClient> GroupConsumer<B> {
    pub fn new(cycle: Arc<CycleState<B>>, group: &Group) -> Self {
        Self {
            cycle,
            lane: group.index,
            messages: group.messages.clone(),
            in_transaction: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Messages of this group, in batch order.
    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        self.cycle.context().topic_partition()
    }

    /// Index of this virtual partition within the cycle.
    pub fn group_index(&self) -> usize {
        self.lane
    }

    pub fn is_revoked(&self) -> bool {
        self.cycle.context().is_revoked()
    }

    /// Records `message` and every earlier message of this group as consumed.
    /// Does not commit. Returns false once the partition is revoked, or for a
    /// message this cycle did not fetch; the mark is then dropped.
    pub fn mark_as_consumed(&self, message: &Message, metadata: Option<String>) -> bool {
        if self.is_revoked() {
            trace!("mark of {} ignored, partition revoked", message.offset);
            return false;
        }
        if !self.cycle.owns(message) {
            warn!(
                "mark of {}-{} offset {} ignored, not part of the cycle on {}",
                message.topic,
                message.partition,
                message.offset,
                self.topic_partition()
            );
            return false;
        }
        self.cycle
            .tracker()
            .record(self.lane, MarkEvent::new(message.offset, metadata));
        true
    }

    /// Marks, then reconciles and commits right away, even under manual
    /// offset management.
    pub async fn mark_as_consumed_and_commit(
        &self,
        message: &Message,
        metadata: Option<String>,
    ) -> AppResult<bool> {
        if !self.mark_as_consumed(message, metadata) {
            return Ok(false);
        }
        self.commit_offsets().await?;
        Ok(true)
    }

    /// Commits what is reconciled so far.
    pub async fn commit_offsets(&self) -> AppResult<()> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(AppError::IllegalStateError(
                "commit outside of the open transaction".to_string(),
            ));
        }
        self.cycle.commit().await?;
        Ok(())
    }

    /// Pauses the partition once the cycle is over; fetching resumes at
    /// `offset` after `timeout`, or the configured pause timeout.
    pub fn pause(&self, offset: i64, timeout: Option<Duration>) {
        debug!(
            "group {} of {} requests pause at {}",
            self.lane,
            self.topic_partition(),
            offset
        );
        self.cycle.request_pause(offset, timeout);
    }

    /// Next cycle fetches from `offset`.
    pub fn seek(&self, offset: i64) {
        self.cycle.request_seek(offset);
    }

    pub async fn offset_metadata(&self, cache: bool) -> AppResult<Option<String>> {
        self.cycle.context().offset_metadata(cache).await
    }

    /// Opens a transaction on the shared connection, waiting for any other
    /// transaction to finish first.
    pub async fn transaction(&self) -> AppResult<Transaction<B>> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(AppError::IllegalStateError(
                "transaction already open for this group".to_string(),
            ));
        }
        let open = self.cycle.context().coordinator().begin().await?;
        Ok(Transaction::new(
            open,
            self.cycle.clone(),
            self.lane,
            self.in_transaction.clone(),
        ))
    }
}
