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

use std::sync::Arc;

use super::{Message, TopicPartition};

/// Ordered messages of one topic partition, as returned by a single fetch.
#[derive(Debug, Clone)]
pub struct Batch {
    topic_partition: TopicPartition,
    messages: Vec<Arc<Message>>,
    low_watermark: i64,
    high_watermark: i64,
}

impl Batch {
    /// Messages must already be in ascending offset order.
    pub fn new(
        topic_partition: TopicPartition,
        messages: Vec<Message>,
        low_watermark: i64,
        high_watermark: i64,
    ) -> Self {
        debug_assert!(messages.windows(2).all(|w| w[0].offset < w[1].offset));
        Self {
            topic_partition,
            messages: messages.into_iter().map(Arc::new).collect(),
            low_watermark,
            high_watermark,
        }
    }

    pub fn empty(topic_partition: TopicPartition, low_watermark: i64, high_watermark: i64) -> Self {
        Self {
            topic_partition,
            messages: Vec::new(),
            low_watermark,
            high_watermark,
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn messages(&self) -> &[Arc<Message>] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }

    pub fn offsets(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.offset).collect()
    }

    pub fn low_watermark(&self) -> i64 {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> i64 {
        self.high_watermark
    }

    /// Drops every message at or after `offset`, returns how many were removed.
    pub fn truncate_before(&mut self, offset: i64) -> usize {
        let keep = self.messages.partition_point(|m| m.offset < offset);
        let removed = self.messages.len() - keep;
        self.messages.truncate(keep);
        removed
    }

    /// Drops all messages, returns the removed ones.
    pub fn clear(&mut self) -> Vec<Arc<Message>> {
        std::mem::take(&mut self.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(offsets: &[i64]) -> Batch {
        let tp = TopicPartition::new("events", 0);
        let messages = offsets
            .iter()
            .map(|o| Message::new(&tp, *o, o.to_string()))
            .collect();
        Batch::new(tp, messages, 0, 100)
    }

    #[test]
    fn test_truncate_before() {
        let mut b = batch(&[3, 4, 6, 9]);
        assert_eq!(b.truncate_before(6), 2);
        assert_eq!(b.offsets(), vec![3, 4]);
        assert_eq!(b.truncate_before(100), 0);
        assert_eq!(b.truncate_before(0), 2);
        assert!(b.is_empty());
        assert_eq!(b.first_offset(), None);
    }

    #[test]
    fn test_clear_returns_removed() {
        let mut b = batch(&[1, 2]);
        let removed = b.clear();
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[1].offset, 2);
        assert!(b.is_empty());
    }
}
