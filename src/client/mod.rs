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

//! The broker side of the engine. Fetching, committing and producing are
//! delegated to a [`BrokerClient`]; the engine never speaks a wire protocol.

use std::future::Future;

use bytes::Bytes;

use crate::message::{Batch, CommittedOffset, Headers, TopicPartition};
use crate::AppResult;

pub use memory_broker::InMemoryBroker;

mod memory_broker;

/// A record to be produced, used for dead letter dispatch and by user logic
/// producing inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub headers: Headers,
}

impl ProduceRecord {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_key(mut self, key: Option<Bytes>) -> Self {
        self.key = key;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Broker connection used by the engine.
///
/// One client is one connection: at most one transaction is open on it at a
/// time, offsets committed while a transaction is open become durable with
/// `commit_transaction` and are dropped by `abort_transaction`.
pub trait BrokerClient: Send + Sync + 'static {
    /// Reads up to `max_messages` messages starting at `from_offset`.
    fn fetch(
        &self,
        topic_partition: &TopicPartition,
        from_offset: i64,
        max_messages: usize,
    ) -> impl Future<Output = AppResult<Batch>> + Send;

    /// Stores `offset` (the next offset to read) with optional metadata.
    fn commit(
        &self,
        topic_partition: &TopicPartition,
        offset: i64,
        metadata: Option<String>,
    ) -> impl Future<Output = AppResult<()>> + Send;

    fn committed(
        &self,
        topic_partition: &TopicPartition,
    ) -> impl Future<Output = AppResult<Option<CommittedOffset>>> + Send;

    fn produce(&self, record: ProduceRecord) -> impl Future<Output = AppResult<()>> + Send;

    fn begin_transaction(&self) -> impl Future<Output = AppResult<()>> + Send;

    fn commit_transaction(&self) -> impl Future<Output = AppResult<()>> + Send;

    fn abort_transaction(&self) -> impl Future<Output = AppResult<()>> + Send;
}
