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

use std::future::{ready, Future};
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::message::{Batch, CommittedOffset, Headers, Message, TopicPartition};
use crate::{AppError, AppResult};

use super::{BrokerClient, ProduceRecord};

#[derive(Debug, Default)]
struct PartitionLog {
    messages: Vec<Message>,
    next_offset: i64,
}

#[derive(Debug)]
struct OpenTransaction {
    id: Uuid,
    commits: Vec<(TopicPartition, CommittedOffset)>,
    records: Vec<ProduceRecord>,
}

/// Broker kept in memory, one instance stands for one connection.
///
/// Topics are created on first produce with a single partition unless
/// created up front with [`InMemoryBroker::create_topic`].
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    logs: DashMap<TopicPartition, PartitionLog>,
    partition_counts: DashMap<String, i32>,
    committed: DashMap<TopicPartition, CommittedOffset>,
    fetch_history: DashMap<TopicPartition, Vec<i64>>,
    transaction: Mutex<Option<OpenTransaction>>,
    fail_transaction_commits: AtomicUsize,
    fail_commits: AtomicUsize,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        self.partition_counts.insert(topic.to_string(), partitions);
        for partition in 0..partitions {
            self.logs
                .entry(TopicPartition::new(topic, partition))
                .or_default();
        }
    }

    /// Appends a message directly to a partition, returns its offset.
    pub fn append(
        &self,
        topic_partition: &TopicPartition,
        key: Option<Bytes>,
        payload: impl Into<Bytes>,
    ) -> i64 {
        self.append_with_headers(topic_partition, key, payload.into(), Headers::new())
    }

    fn append_with_headers(
        &self,
        topic_partition: &TopicPartition,
        key: Option<Bytes>,
        payload: Bytes,
        headers: Headers,
    ) -> i64 {
        self.partition_counts
            .entry(topic_partition.topic.clone())
            .and_modify(|count| *count = (*count).max(topic_partition.partition + 1))
            .or_insert(topic_partition.partition + 1);
        let mut log = self.logs.entry(topic_partition.clone()).or_default();
        let offset = log.next_offset;
        let mut message = Message::new(topic_partition, offset, payload);
        message.key = key;
        message.raw_metadata = headers;
        log.messages.push(message);
        log.next_offset += 1;
        offset
    }

    /// Every message of a topic, partition by partition.
    pub fn topic_messages(&self, topic: &str) -> Vec<Message> {
        let partitions = self
            .partition_counts
            .get(topic)
            .map(|count| *count)
            .unwrap_or(0);
        (0..partitions)
            .filter_map(|partition| {
                self.logs
                    .get(&TopicPartition::new(topic, partition))
                    .map(|log| log.messages.clone())
            })
            .flatten()
            .collect()
    }

    pub fn committed_offset(&self, topic_partition: &TopicPartition) -> Option<CommittedOffset> {
        self.committed.get(topic_partition).map(|c| c.clone())
    }

    /// Offsets every fetch of this partition started from, oldest first.
    pub fn fetch_history(&self, topic_partition: &TopicPartition) -> Vec<i64> {
        self.fetch_history
            .get(topic_partition)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    pub fn high_watermark(&self, topic_partition: &TopicPartition) -> i64 {
        self.logs
            .get(topic_partition)
            .map(|log| log.next_offset)
            .unwrap_or(0)
    }

    /// The next `count` transaction commits fail and abort.
    pub fn fail_next_commit_transaction(&self, count: usize) {
        self.fail_transaction_commits.store(count, Ordering::SeqCst);
    }

    /// The next `count` offset commits fail with a broker error.
    pub fn fail_next_commit(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction.lock().is_some()
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn do_fetch(
        &self,
        topic_partition: &TopicPartition,
        from_offset: i64,
        max_messages: usize,
    ) -> AppResult<Batch> {
        let log = self.logs.get(topic_partition).ok_or_else(|| {
            AppError::BrokerError(format!("unknown topic partition: {}", topic_partition))
        })?;
        self.fetch_history
            .entry(topic_partition.clone())
            .or_default()
            .push(from_offset);

        let low_watermark = log.messages.first().map_or(log.next_offset, |m| m.offset);
        let start = log.messages.partition_point(|m| m.offset < from_offset);
        let messages: Vec<Message> = log.messages[start..]
            .iter()
            .take(max_messages)
            .cloned()
            .collect();
        trace!(
            "fetch {} from {} got {} messages",
            topic_partition,
            from_offset,
            messages.len()
        );
        Ok(Batch::new(
            topic_partition.clone(),
            messages,
            low_watermark,
            log.next_offset,
        ))
    }

    fn do_commit(
        &self,
        topic_partition: &TopicPartition,
        offset: i64,
        metadata: Option<String>,
    ) -> AppResult<()> {
        if Self::take_failure(&self.fail_commits) {
            return Err(AppError::BrokerError(format!(
                "offset commit rejected for {}",
                topic_partition
            )));
        }
        if !self.logs.contains_key(topic_partition) {
            return Err(AppError::BrokerError(format!(
                "unknown topic partition: {}",
                topic_partition
            )));
        }
        let committed = CommittedOffset {
            offset,
            metadata,
            commit_timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let mut transaction = self.transaction.lock();
        match transaction.as_mut() {
            Some(open) => open.commits.push((topic_partition.clone(), committed)),
            None => {
                self.committed.insert(topic_partition.clone(), committed);
            }
        }
        Ok(())
    }

    fn do_produce(&self, record: ProduceRecord) -> AppResult<()> {
        let mut transaction = self.transaction.lock();
        if let Some(open) = transaction.as_mut() {
            open.records.push(record);
            return Ok(());
        }
        drop(transaction);
        self.write_record(record);
        Ok(())
    }

    fn write_record(&self, record: ProduceRecord) {
        let partitions = self
            .partition_counts
            .get(&record.topic)
            .map(|count| *count)
            .unwrap_or(1);
        let partition = match &record.key {
            Some(key) => (crc32c::crc32c(key) % partitions as u32) as i32,
            None => 0,
        };
        let topic_partition = TopicPartition::new(record.topic, partition);
        self.append_with_headers(&topic_partition, record.key, record.payload, record.headers);
    }

    fn do_begin_transaction(&self) -> AppResult<()> {
        let mut transaction = self.transaction.lock();
        if let Some(open) = transaction.as_ref() {
            return Err(AppError::BrokerError(format!(
                "transaction {} already open on this connection",
                open.id
            )));
        }
        let id = Uuid::new_v4();
        debug!("begin transaction {}", id);
        *transaction = Some(OpenTransaction {
            id,
            commits: Vec::new(),
            records: Vec::new(),
        });
        Ok(())
    }

    fn do_commit_transaction(&self) -> AppResult<()> {
        let open = self
            .transaction
            .lock()
            .take()
            .ok_or_else(|| AppError::BrokerError("no open transaction to commit".to_string()))?;

        if Self::take_failure(&self.fail_transaction_commits) {
            debug!("transaction {} failed to commit, aborted", open.id);
            return Err(AppError::TransactionAborted(format!(
                "broker rejected transaction {}",
                open.id
            )));
        }

        for record in open.records {
            self.write_record(record);
        }
        for (topic_partition, committed) in open.commits {
            self.committed.insert(topic_partition, committed);
        }
        debug!("commit transaction {}", open.id);
        Ok(())
    }

    fn do_abort_transaction(&self) -> AppResult<()> {
        match self.transaction.lock().take() {
            Some(open) => {
                debug!("abort transaction {}", open.id);
                Ok(())
            }
            None => Err(AppError::BrokerError(
                "no open transaction to abort".to_string(),
            )),
        }
    }
}

impl BrokerClient for InMemoryBroker {
    fn fetch(
        &self,
        topic_partition: &TopicPartition,
        from_offset: i64,
        max_messages: usize,
    ) -> impl Future<Output = AppResult<Batch>> + Send {
        ready(self.do_fetch(topic_partition, from_offset, max_messages))
    }

    fn commit(
        &self,
        topic_partition: &TopicPartition,
        offset: i64,
        metadata: Option<String>,
    ) -> impl Future<Output = AppResult<()>> + Send {
        ready(self.do_commit(topic_partition, offset, metadata))
    }

    fn committed(
        &self,
        topic_partition: &TopicPartition,
    ) -> impl Future<Output = AppResult<Option<CommittedOffset>>> + Send {
        ready(Ok(self.committed_offset(topic_partition)))
    }

    fn produce(&self, record: ProduceRecord) -> impl Future<Output = AppResult<()>> + Send {
        ready(self.do_produce(record))
    }

    fn begin_transaction(&self) -> impl Future<Output = AppResult<()>> + Send {
        ready(self.do_begin_transaction())
    }

    fn commit_transaction(&self) -> impl Future<Output = AppResult<()>> + Send {
        ready(self.do_commit_transaction())
    }

    fn abort_transaction(&self) -> impl Future<Output = AppResult<()>> + Send {
        ready(self.do_abort_transaction())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(count: i64) -> (InMemoryBroker, TopicPartition) {
        let broker = InMemoryBroker::new();
        let tp = TopicPartition::new("events", 0);
        broker.create_topic("events", 1);
        for i in 0..count {
            broker.append(&tp, None, i.to_string());
        }
        (broker, tp)
    }

    #[tokio::test]
    async fn test_fetch_window() -> AppResult<()> {
        let (broker, tp) = seeded(25);
        let batch = broker.fetch(&tp, 20, 10).await?;
        assert_eq!(batch.offsets(), vec![20, 21, 22, 23, 24]);
        assert_eq!(batch.high_watermark(), 25);

        let batch = broker.fetch(&tp, 25, 10).await?;
        assert!(batch.is_empty());
        assert_eq!(broker.fetch_history(&tp), vec![20, 25]);
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_partition_is_fatal() {
        let (broker, _) = seeded(1);
        let err = broker
            .fetch(&TopicPartition::new("missing", 0), 0, 10)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_transaction_commit_applies_offsets_and_records() -> AppResult<()> {
        let (broker, tp) = seeded(5);
        broker.begin_transaction().await?;
        broker.commit(&tp, 3, Some("2".to_string())).await?;
        broker.produce(ProduceRecord::new("audit", "x")).await?;
        assert_eq!(broker.committed_offset(&tp), None);
        assert!(broker.topic_messages("audit").is_empty());

        broker.commit_transaction().await?;
        assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(3));
        assert_eq!(broker.topic_messages("audit").len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_transaction_discards_everything() -> AppResult<()> {
        let (broker, tp) = seeded(5);
        broker.fail_next_commit_transaction(1);
        broker.begin_transaction().await?;
        broker.commit(&tp, 3, None).await?;
        let err = broker.commit_transaction().await.unwrap_err();
        assert!(matches!(err, AppError::TransactionAborted(_)));
        assert_eq!(broker.committed_offset(&tp), None);
        assert!(!broker.in_transaction());
        Ok(())
    }

    #[tokio::test]
    async fn test_single_transaction_per_connection() -> AppResult<()> {
        let (broker, _) = seeded(1);
        broker.begin_transaction().await?;
        assert!(broker.begin_transaction().await.is_err());
        broker.abort_transaction().await?;
        assert!(broker.abort_transaction().await.is_err());
        Ok(())
    }
}
