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

//! Exclusive access to the broker connection.
//!
//! Offset commits, dead letter produces and whole transactions all go through
//! the [`TransactionCoordinator`]. A transaction holds the connection from
//! `begin` to `commit`/`abort`, so nothing else can slip into it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::client::{BrokerClient, ProduceRecord};
use crate::message::{MarkEvent, Message, ReconciledOffset, TopicPartition};
use crate::processing::consumer::CycleState;
use crate::{AppError, AppResult};

#[derive(Debug)]
pub struct TransactionCoordinator<B: BrokerClient> {
    client: Arc<B>,
    connection: Arc<Mutex<()>>,
}

impl<B: BrokerClient> Clone for TransactionCoordinator<B> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl<B: BrokerClient> TransactionCoordinator<B> {
    pub fn new(client: Arc<B>) -> Self {
        Self {
            client,
            connection: Arc::new(Mutex::new(())),
        }
    }

    pub fn client(&self) -> &Arc<B> {
        &self.client
    }

    /// Reconciles and commits while holding the connection, so the value
    /// committed reflects every mark recorded before the call.
    pub async fn commit_with<F>(
        &self,
        topic_partition: &TopicPartition,
        reconcile: F,
    ) -> AppResult<Option<ReconciledOffset>>
    where
        F: FnOnce() -> Option<ReconciledOffset>,
    {
        let _connection = self.connection.lock().await;
        let reconciled = reconcile();
        if let Some(offset) = &reconciled {
            self.client
                .commit(topic_partition, offset.next_offset(), offset.metadata.clone())
                .await?;
            debug!(
                "committed {} at {} ({:?})",
                topic_partition,
                offset.next_offset(),
                offset.metadata
            );
        }
        Ok(reconciled)
    }

    pub async fn produce(&self, record: ProduceRecord) -> AppResult<()> {
        let _connection = self.connection.lock().await;
        self.client.produce(record).await
    }

    /// Waits for the connection, then opens a broker transaction on it.
    pub async fn begin(&self) -> AppResult<OpenTransaction<B>> {
        let guard = self.connection.clone().lock_owned().await;
        self.client.begin_transaction().await?;
        Ok(OpenTransaction {
            client: self.client.clone(),
            guard: Some(guard),
        })
    }
}

/// A broker transaction owning the connection. Dropping it unfinished
/// aborts it in the background.
#[derive(Debug)]
pub struct OpenTransaction<B: BrokerClient> {
    client: Arc<B>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<B: BrokerClient> OpenTransaction<B> {
    pub async fn produce(&self, record: ProduceRecord) -> AppResult<()> {
        self.client.produce(record).await
    }

    pub async fn commit_offset(
        &self,
        topic_partition: &TopicPartition,
        offset: &ReconciledOffset,
    ) -> AppResult<()> {
        self.client
            .commit(topic_partition, offset.next_offset(), offset.metadata.clone())
            .await
    }

    /// A broker side failure closes the transaction, the error says so.
    pub async fn commit(self) -> AppResult<()> {
        self.commit_then(|| ()).await
    }

    /// Commits and runs `on_commit` once the broker accepted, before the
    /// connection is released.
    pub async fn commit_then<F: FnOnce()>(mut self, on_commit: F) -> AppResult<()> {
        let guard = self.guard.take();
        let result = self.client.commit_transaction().await;
        if result.is_ok() {
            on_commit();
        }
        drop(guard);
        result.map_err(|e| match e {
            AppError::TransactionAborted(_) => e,
            other => AppError::TransactionAborted(other.to_string()),
        })
    }

    pub async fn abort(mut self) -> AppResult<()> {
        let guard = self.guard.take();
        let result = self.client.abort_transaction().await;
        drop(guard);
        result
    }
}

impl<B: BrokerClient> Drop for OpenTransaction<B> {
    fn drop(&mut self) {
        let Some(guard) = self.guard.take() else {
            return;
        };
        warn!("transaction dropped without commit or abort, aborting");
        let client = self.client.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                // the connection stays held until the abort went through
                handle.spawn(async move {
                    if let Err(e) = client.abort_transaction().await {
                        warn!("background abort failed: {}", e);
                    }
                    drop(guard);
                });
            }
            Err(_) => warn!("no runtime to abort the dropped transaction"),
        }
    }
}

/// A transactional block opened by consumption logic.
///
/// Marks taken here stay private to the block: they reach the partition's
/// marking state only once the broker accepted the transaction, and vanish
/// with it otherwise.
#[derive(Debug)]
pub struct Transaction<B: BrokerClient> {
    open: Option<OpenTransaction<B>>,
    cycle: Arc<CycleState<B>>,
    lane: usize,
    pending: Vec<MarkEvent>,
    in_transaction: Arc<AtomicBool>,
}

impl<B: BrokerClient> Transaction<B> {
    pub(crate) fn new(
        open: OpenTransaction<B>,
        cycle: Arc<CycleState<B>>,
        lane: usize,
        in_transaction: Arc<AtomicBool>,
    ) -> Self {
        in_transaction.store(true, Ordering::SeqCst);
        Self {
            open: Some(open),
            cycle,
            lane,
            pending: Vec::new(),
            in_transaction,
        }
    }

    fn open(&self) -> AppResult<&OpenTransaction<B>> {
        self.open
            .as_ref()
            .ok_or_else(|| AppError::IllegalStateError("transaction already finished".to_string()))
    }

    /// Returns false for a message the cycle did not fetch, nothing is kept.
    pub fn mark_as_consumed(&mut self, message: &Message, metadata: Option<String>) -> bool {
        if !self.cycle.owns(message) {
            warn!(
                "transactional mark of {}-{} offset {} ignored, not part of the cycle",
                message.topic, message.partition, message.offset
            );
            return false;
        }
        self.pending.push(MarkEvent::new(message.offset, metadata));
        true
    }

    pub async fn produce(&self, record: ProduceRecord) -> AppResult<()> {
        self.open()?.produce(record).await
    }

    /// Commits the block: the offset reconciled with the pending marks goes
    /// into the transaction, and the marks are kept only if it commits.
    pub async fn commit(mut self) -> AppResult<()> {
        let open = self
            .open
            .take()
            .ok_or_else(|| AppError::IllegalStateError("transaction already finished".to_string()))?;
        let pending = std::mem::take(&mut self.pending);
        let context = self.cycle.context();
        let topic_partition = context.topic_partition().clone();

        let reconciled = self.cycle.reconcile_with(self.lane, &pending);
        if let Some(offset) = reconciled.as_ref().filter(|_| !context.is_revoked()) {
            if let Err(e) = open.commit_offset(&topic_partition, offset).await {
                warn!("offset commit inside transaction failed: {}", e);
                if let Err(abort) = open.abort().await {
                    warn!("abort after failed commit failed: {}", abort);
                }
                return Err(e);
            }
        }

        let marks = pending.len();
        let (cycle, lane) = (&self.cycle, self.lane);
        open.commit_then(|| {
            cycle.tracker().record_all(lane, pending);
            if let Some(offset) = reconciled {
                cycle.context().cache_offset(offset);
            }
        })
        .await?;
        debug!("transaction on {} committed {} marks", topic_partition, marks);
        Ok(())
    }

    /// Drops the pending marks and aborts.
    pub async fn abort(mut self) -> AppResult<()> {
        debug!("aborting transaction, {} marks discarded", self.pending.len());
        self.pending.clear();
        match self.open.take() {
            Some(open) => open.abort().await,
            None => Ok(()),
        }
    }
}

impl<B: BrokerClient> Drop for Transaction<B> {
    fn drop(&mut self) {
        self.in_transaction.store(false, Ordering::SeqCst);
    }
}
