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

//! Hooks run on a fetched batch before it is split and dispatched.

use std::any::type_name;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::message::{Batch, TopicPartition};

/// What a filter wants done with the current batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Pass,
    /// drop the rest of the batch, keep fetching after it
    Skip,
    /// process only what precedes the offset, refetch from it next cycle
    Seek(i64),
}

/// A stateful filter. One instance serves a single partition, its state
/// outlives cycles.
pub trait Filter: Send + Sync {
    fn apply(&mut self, batch: &Batch) -> FilterAction;

    /// How long to pause the partition after a seek, if at all.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn name(&self) -> &'static str {
        type_name::<Self>()
    }
}

/// Builds fresh filters for a newly assigned partition.
pub type FilterFactory = Arc<dyn Fn(&TopicPartition) -> Vec<Box<dyn Filter>> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterOutcome {
    Pass,
    Skip {
        /// last dropped offset, none when the batch was already empty
        last_dropped: Option<i64>,
    },
    Seek {
        offset: i64,
        timeout: Option<Duration>,
    },
}

#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn Filter>>) -> Self {
        Self { filters }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Runs filters in declaration order, the first one that does not pass
    /// decides and the rest are not consulted.
    pub fn apply(&mut self, batch: &mut Batch) -> FilterOutcome {
        for filter in self.filters.iter_mut() {
            match filter.apply(batch) {
                FilterAction::Pass => continue,
                FilterAction::Skip => {
                    let last_dropped = batch.clear().last().map(|m| m.offset);
                    debug!(
                        "filter {} skipped batch of {} up to {:?}",
                        filter.name(),
                        batch.topic_partition(),
                        last_dropped
                    );
                    return FilterOutcome::Skip { last_dropped };
                }
                FilterAction::Seek(offset) => {
                    let removed = batch.truncate_before(offset);
                    debug!(
                        "filter {} seeks {} to {}, {} messages held back",
                        filter.name(),
                        batch.topic_partition(),
                        offset,
                        removed
                    );
                    return FilterOutcome::Seek {
                        offset,
                        timeout: filter.timeout(),
                    };
                }
            }
        }
        FilterOutcome::Pass
    }
}

/// Holds a batch back until at least `min` messages are available.
#[derive(Debug)]
pub struct MinBatchSize {
    min: usize,
    wait: Duration,
}

impl MinBatchSize {
    pub fn new(min: usize, wait: Duration) -> Self {
        Self { min, wait }
    }
}

impl Filter for MinBatchSize {
    fn apply(&mut self, batch: &Batch) -> FilterAction {
        match batch.first_offset() {
            Some(first) if batch.len() < self.min => FilterAction::Seek(first),
            _ => FilterAction::Pass,
        }
    }

    fn timeout(&self) -> Option<Duration> {
        Some(self.wait)
    }
}

/// Lets at most `limit` messages through per `interval`.
#[derive(Debug)]
pub struct Throttler {
    limit: usize,
    interval: Duration,
    window_start: Option<Instant>,
    passed: usize,
    remaining: Option<Duration>,
}

impl Throttler {
    pub fn new(limit: usize, interval: Duration) -> Self {
        Self {
            limit,
            interval,
            window_start: None,
            passed: 0,
            remaining: None,
        }
    }
}

impl Filter for Throttler {
    fn apply(&mut self, batch: &Batch) -> FilterAction {
        let now = Instant::now();
        let start = match self.window_start {
            Some(start) if now.duration_since(start) < self.interval => start,
            _ => {
                self.window_start = Some(now);
                self.passed = 0;
                now
            }
        };

        let allowed = self.limit.saturating_sub(self.passed);
        if batch.len() <= allowed {
            self.passed += batch.len();
            self.remaining = None;
            return FilterAction::Pass;
        }

        self.passed = self.limit;
        self.remaining = Some(self.interval.saturating_sub(now.duration_since(start)));
        FilterAction::Seek(batch.messages()[allowed].offset)
    }

    fn timeout(&self) -> Option<Duration> {
        self.remaining
    }
}

/// Only lets through messages older than `delay`.
#[derive(Debug)]
pub struct Delayer {
    delay: Duration,
    remaining: Option<Duration>,
}

impl Delayer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            remaining: None,
        }
    }
}

impl Filter for Delayer {
    fn apply(&mut self, batch: &Batch) -> FilterAction {
        let now = chrono::Utc::now().timestamp_millis();
        // delays beyond i64 millis never elapse
        let delay_ms = i64::try_from(self.delay.as_millis()).unwrap_or(i64::MAX);
        let too_young = batch
            .messages()
            .iter()
            .map(|m| (m, m.timestamp.saturating_add(delay_ms)))
            .find(|(_, ready_at)| *ready_at > now);

        match too_young {
            Some((message, ready_at)) => {
                let wait_ms = u64::try_from(ready_at.saturating_sub(now)).unwrap_or(0);
                self.remaining = Some(Duration::from_millis(wait_ms));
                FilterAction::Seek(message.offset)
            }
            None => {
                self.remaining = None;
                FilterAction::Pass
            }
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.remaining
    }
}
