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

//! Splits one partition's batch into virtual partitions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;

use crate::message::{Batch, Message};
use crate::service::{PartitionerKind, VirtualPartitionsConfig};

/// Maps a message to its virtual partition key.
///
/// The key must be stable for a given message within one cycle. Nothing
/// checks it, a non-deterministic key only scatters messages differently.
pub trait Partitioner: Send + Sync {
    fn key(&self, message: &Message) -> u64;
}

impl<F> Partitioner for F
where
    F: Fn(&Message) -> u64 + Send + Sync,
{
    fn key(&self, message: &Message) -> u64 {
        self(message)
    }
}

/// Everything in one group, the batch is processed as is.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinglePartition;

impl Partitioner for SinglePartition {
    fn key(&self, _message: &Message) -> u64 {
        0
    }
}

/// Cycles through `count` keys, the cursor survives across batches.
#[derive(Debug)]
pub struct RoundRobin {
    count: u64,
    cursor: AtomicU64,
}

impl RoundRobin {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1) as u64,
            cursor: AtomicU64::new(0),
        }
    }
}

impl Partitioner for RoundRobin {
    fn key(&self, _message: &Message) -> u64 {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.count
    }
}

/// crc32c of the message key, keyless messages hash their offset.
#[derive(Debug, Clone, Copy)]
pub struct KeyHash {
    count: u64,
}

impl KeyHash {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1) as u64,
        }
    }
}

impl Partitioner for KeyHash {
    fn key(&self, message: &Message) -> u64 {
        let hash = match &message.key {
            Some(key) => crc32c::crc32c(key),
            None => crc32c::crc32c(&message.offset.to_be_bytes()),
        };
        hash as u64 % self.count
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RandomPartitioner {
    count: u64,
}

impl RandomPartitioner {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1) as u64,
        }
    }
}

impl Partitioner for RandomPartitioner {
    fn key(&self, _message: &Message) -> u64 {
        rand::thread_rng().gen_range(0..self.count)
    }
}

pub fn partitioner_from_config(config: &VirtualPartitionsConfig) -> Arc<dyn Partitioner> {
    match config.partitioner {
        PartitionerKind::None => Arc::new(SinglePartition),
        PartitionerKind::RoundRobin => Arc::new(RoundRobin::new(config.max_partitions)),
        PartitionerKind::KeyHash => Arc::new(KeyHash::new(config.max_partitions)),
        PartitionerKind::Random => Arc::new(RandomPartitioner::new(config.max_partitions)),
    }
}

/// One virtual partition: the messages of a batch sharing a key, in batch order.
#[derive(Debug, Clone)]
pub struct Group {
    /// position of the group in the cycle, also its marking lane
    pub index: usize,
    pub key: u64,
    pub messages: Vec<Arc<Message>>,
}

impl Group {
    pub fn offsets(&self) -> Vec<i64> {
        self.messages.iter().map(|m| m.offset).collect()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.messages.first().map(|m| m.offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.messages.last().map(|m| m.offset)
    }

    pub fn contains(&self, offset: i64) -> bool {
        self.messages
            .binary_search_by_key(&offset, |m| m.offset)
            .is_ok()
    }
}

/// Walks the batch once, groups are ordered by first appearance of their key.
pub fn split(batch: &Batch, partitioner: &dyn Partitioner) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut index_by_key: HashMap<u64, usize> = HashMap::new();

    for message in batch.messages() {
        let key = partitioner.key(message);
        let index = *index_by_key.entry(key).or_insert_with(|| {
            groups.push(Group {
                index: groups.len(),
                key,
                messages: Vec::new(),
            });
            groups.len() - 1
        });
        groups[index].messages.push(Arc::clone(message));
    }

    groups
}
