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

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;
use tracing::info;

use crate::client::BrokerClient;
use crate::message::{ReconciledOffset, TopicPartition};
use crate::AppResult;

use super::{OffsetReconciler, TransactionCoordinator};

/// State of one assigned partition that outlives its cycles and is shared
/// with the consumption logic running them.
#[derive(Debug)]
pub struct PartitionContext<B: BrokerClient> {
    topic_partition: TopicPartition,
    coordinator: TransactionCoordinator<B>,
    reconciler: OffsetReconciler,
    manual_offset_management: bool,
    offset_cache: Mutex<Option<ReconciledOffset>>,
    revoked: AtomicCell<bool>,
}

impl<B: BrokerClient> PartitionContext<B> {
    pub fn new(
        topic_partition: TopicPartition,
        coordinator: TransactionCoordinator<B>,
        reconciler: OffsetReconciler,
        manual_offset_management: bool,
    ) -> Self {
        Self {
            topic_partition,
            coordinator,
            reconciler,
            manual_offset_management,
            offset_cache: Mutex::new(None),
            revoked: AtomicCell::new(false),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn coordinator(&self) -> &TransactionCoordinator<B> {
        &self.coordinator
    }

    pub fn reconciler(&self) -> &OffsetReconciler {
        &self.reconciler
    }

    pub fn is_manual(&self) -> bool {
        self.manual_offset_management
    }

    pub fn revoke(&self) {
        if !self.revoked.swap(true) {
            info!("partition {} revoked", self.topic_partition);
        }
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load()
    }

    pub fn cache_offset(&self, offset: ReconciledOffset) {
        *self.offset_cache.lock() = Some(offset);
    }

    pub fn cached_offset(&self) -> Option<ReconciledOffset> {
        self.offset_cache.lock().clone()
    }

    /// Metadata of the last reconciled offset, or of what the broker holds as
    /// committed when `cache` is off.
    pub async fn offset_metadata(&self, cache: bool) -> AppResult<Option<String>> {
        if cache {
            return Ok(self.cached_offset().and_then(|offset| offset.metadata));
        }
        let committed = self
            .coordinator
            .client()
            .committed(&self.topic_partition)
            .await?;
        Ok(committed.and_then(|offset| offset.metadata))
    }
}
