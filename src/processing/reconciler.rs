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

//! Turns the marks of independently progressing virtual partitions into the
//! one offset a partition commits.
//!
//! Inputs are plain data: the ascending offsets of every group, and the mark
//! lanes of the [`MarkingTracker`](super::MarkingTracker). Lane `i` belongs to
//! group `i` for `i < groups.len()`; any further lane holds offsets resolved
//! individually. A mark inside a group covers every earlier message of that
//! group, since a group is consumed in order. Marks below the first offset
//! of the cycle are stale and never count.

use std::collections::{BTreeMap, HashMap};

use crate::message::{MarkEvent, OffsetMetadataStrategy, ReconciledOffset};

#[derive(Debug, Clone, Copy)]
pub struct OffsetReconciler {
    strategy: OffsetMetadataStrategy,
}

/// Every offset of a cycle, and whether a mark covers it.
struct Coverage {
    /// offset -> covered
    offsets: BTreeMap<i64, bool>,
}

/// Lowest offset of the cycle, none for a cycle without messages.
fn cycle_start(groups: &[Vec<i64>]) -> Option<i64> {
    groups.iter().filter_map(|group| group.first()).min().copied()
}

/// Events of a lane that are not below the cycle.
fn current<'a>(
    lane: &'a [MarkEvent],
    start: Option<i64>,
) -> impl Iterator<Item = &'a MarkEvent> + 'a {
    lane.iter()
        .filter(move |event| start.map_or(true, |start| event.offset >= start))
}

impl Coverage {
    fn build(groups: &[Vec<i64>], lanes: &[Vec<MarkEvent>]) -> Self {
        let start = cycle_start(groups);
        let mut offsets = BTreeMap::new();
        for (index, group) in groups.iter().enumerate() {
            let highest = lanes.get(index).and_then(|lane| {
                lane.iter()
                    .map(|e| e.offset)
                    .filter(|offset| group.binary_search(offset).is_ok())
                    .max()
            });
            for offset in group {
                let covered = highest.is_some_and(|h| h >= *offset);
                offsets.insert(*offset, covered);
            }
        }

        for (index, lane) in lanes.iter().enumerate() {
            for event in current(lane, start) {
                let in_own_group = groups
                    .get(index)
                    .is_some_and(|group| group.binary_search(&event.offset).is_ok());
                if !in_own_group {
                    offsets.insert(event.offset, true);
                }
            }
        }

        Self { offsets }
    }

    /// Last offset of the fully covered prefix, and the first offset after it.
    fn prefix(&self) -> (Option<i64>, Option<i64>) {
        let mut last_covered = None;
        for (offset, covered) in &self.offsets {
            if !covered {
                return (last_covered, Some(*offset));
            }
            last_covered = Some(*offset);
        }
        (last_covered, None)
    }
}

impl OffsetReconciler {
    pub fn new(strategy: OffsetMetadataStrategy) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> OffsetMetadataStrategy {
        self.strategy
    }

    /// Nothing marked means nothing to commit.
    pub fn reconcile(
        &self,
        groups: &[Vec<i64>],
        lanes: &[Vec<MarkEvent>],
    ) -> Option<ReconciledOffset> {
        match self.strategy {
            OffsetMetadataStrategy::Latest => Self::latest(groups, lanes),
            OffsetMetadataStrategy::Exact => Self::exact(groups, lanes),
        }
    }

    /// First offset of the cycle that no mark covers, none when every offset
    /// is covered. Independent of the strategy.
    pub fn first_unresolved(groups: &[Vec<i64>], lanes: &[Vec<MarkEvent>]) -> Option<i64> {
        Coverage::build(groups, lanes).prefix().1
    }

    fn latest(groups: &[Vec<i64>], lanes: &[Vec<MarkEvent>]) -> Option<ReconciledOffset> {
        let start = cycle_start(groups);
        lanes
            .iter()
            .flat_map(|lane| current(lane, start))
            .enumerate()
            .max_by_key(|(position, event)| (event.offset, event.timestamp, *position))
            .map(|(_, event)| ReconciledOffset::new(event.offset, event.metadata.clone()))
    }

    fn exact(groups: &[Vec<i64>], lanes: &[Vec<MarkEvent>]) -> Option<ReconciledOffset> {
        let (last_covered, _) = Coverage::build(groups, lanes).prefix();
        let offset = last_covered?;

        let group_of: HashMap<i64, usize> = groups
            .iter()
            .enumerate()
            .flat_map(|(index, group)| group.iter().map(move |offset| (*offset, index)))
            .collect();

        // the covering mark: lowest mark at or above the offset within its
        // group, the most recent one on ties
        let covering = match group_of.get(&offset) {
            Some(index) => lanes.get(*index).and_then(|lane| {
                lane.iter()
                    .enumerate()
                    .filter(|(_, event)| event.offset >= offset)
                    .min_by_key(|(position, event)| (event.offset, std::cmp::Reverse(*position)))
                    .map(|(_, event)| event)
            }),
            None => None,
        };
        let covering = covering.or_else(|| {
            lanes
                .iter()
                .flatten()
                .filter(|event| event.offset == offset)
                .last()
        });

        Some(ReconciledOffset::new(
            offset,
            covering.and_then(|event| event.metadata.clone()),
        ))
    }
}
