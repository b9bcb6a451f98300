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

//! Failure accounting for the unresolved head of a partition, and the dead
//! letter records built once it runs out of retries.

use tracing::debug;

use crate::client::ProduceRecord;
use crate::message::Message;
use crate::service::DeadLetterConfig;

/// Slots of the independent-mode counter table.
pub const RETRY_WINDOW: usize = 64;

pub const HEADER_ORIGINAL_TOPIC: &str = "original_topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "original_partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "original_offset";
pub const HEADER_ORIGINAL_ATTEMPTS: &str = "original_attempts";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// one counter following the head as it rolls forward
    Rolling,
    /// one counter per offset
    Independent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { attempt: u32 },
    DeadLetter { offset: i64, attempts: u32 },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: i64,
    attempts: u32,
}

#[derive(Debug)]
pub struct RetryTracker {
    mode: RetryMode,
    max_retries: u32,
    dead_letter_topic: Option<String>,
    rolling: u32,
    slots: [Option<Slot>; RETRY_WINDOW],
    head: Option<i64>,
}

impl RetryTracker {
    pub fn new(mode: RetryMode, max_retries: u32, dead_letter_topic: Option<String>) -> Self {
        Self {
            mode,
            max_retries,
            dead_letter_topic,
            rolling: 0,
            slots: [None; RETRY_WINDOW],
            head: None,
        }
    }

    pub fn from_config(config: &DeadLetterConfig) -> Self {
        let mode = if config.independent_retries {
            RetryMode::Independent
        } else {
            RetryMode::Rolling
        };
        Self::new(mode, config.max_retries, config.topic.clone())
    }

    pub fn dead_letter_topic(&self) -> Option<&str> {
        self.dead_letter_topic.as_deref()
    }

    /// Counts one failed attempt at `head`, the first unresolved offset of the
    /// partition. Dead lettering needs a target topic, without one the
    /// partition retries forever.
    pub fn record_failure(&mut self, head: i64) -> RetryDecision {
        let attempts = match self.mode {
            RetryMode::Rolling => {
                self.rolling += 1;
                self.rolling
            }
            RetryMode::Independent => {
                if self.head.is_some_and(|previous| previous < head) {
                    self.clear_below(head);
                }
                let index = Self::slot_of(head);
                let attempts = match self.slots[index] {
                    Some(slot) if slot.offset == head => slot.attempts + 1,
                    _ => 1,
                };
                self.slots[index] = Some(Slot {
                    offset: head,
                    attempts,
                });
                attempts
            }
        };
        self.head = Some(head);

        debug!(
            "failure at offset {} ({:?}), attempt {} of {}",
            head,
            self.mode,
            attempts,
            self.max_retries + 1
        );

        if attempts > self.max_retries && self.dead_letter_topic.is_some() {
            RetryDecision::DeadLetter {
                offset: head,
                attempts,
            }
        } else {
            RetryDecision::Retry { attempt: attempts }
        }
    }

    /// Attempts counted so far against `offset`.
    pub fn attempts(&self, offset: i64) -> u32 {
        match self.mode {
            RetryMode::Rolling => self.rolling,
            RetryMode::Independent => self.slots[Self::slot_of(offset)]
                .filter(|s| s.offset == offset)
                .map_or(0, |s| s.attempts),
        }
    }

    /// The message at `offset` left the retry path (dead lettered).
    pub fn resolve(&mut self, offset: i64) {
        match self.mode {
            RetryMode::Rolling => self.rolling = 0,
            RetryMode::Independent => self.clear_below(offset + 1),
        }
    }

    /// A cycle completed without failure.
    pub fn reset(&mut self) {
        self.rolling = 0;
        self.slots = [None; RETRY_WINDOW];
        self.head = None;
    }

    fn clear_below(&mut self, offset: i64) {
        for slot in self.slots.iter_mut() {
            if slot.is_some_and(|s| s.offset < offset) {
                *slot = None;
            }
        }
    }

    fn slot_of(offset: i64) -> usize {
        offset.rem_euclid(RETRY_WINDOW as i64) as usize
    }

    /// Copy of `message` for the dead letter topic, original headers kept.
    pub fn dead_letter_record(&self, message: &Message, attempts: u32) -> Option<ProduceRecord> {
        let topic = self.dead_letter_topic.as_ref()?;
        let mut headers = message.raw_metadata.clone();
        headers.insert(HEADER_ORIGINAL_TOPIC.to_string(), message.topic.clone());
        headers.insert(
            HEADER_ORIGINAL_PARTITION.to_string(),
            message.partition.to_string(),
        );
        headers.insert(HEADER_ORIGINAL_OFFSET.to_string(), message.offset.to_string());
        headers.insert(HEADER_ORIGINAL_ATTEMPTS.to_string(), attempts.to_string());

        Some(
            ProduceRecord::new(topic.clone(), message.payload.clone())
                .with_key(message.key.clone())
                .with_headers(headers),
        )
    }
}
