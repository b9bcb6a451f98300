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

use parking_lot::Mutex;
use tracing::trace;

use crate::message::MarkEvent;

/// Append-only mark log of one cycle, one lane per virtual partition plus a
/// trailing engine lane for offsets the engine resolves on its own
/// (dead-lettered or filtered messages).
///
/// Marks are taken as they come: a lane may go backwards, reconciliation
/// sorts it out.
#[derive(Debug)]
pub struct MarkingTracker {
    lanes: Vec<Mutex<Vec<MarkEvent>>>,
}

impl MarkingTracker {
    pub fn new(group_count: usize) -> Self {
        Self {
            lanes: (0..=group_count).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    pub fn group_count(&self) -> usize {
        self.lanes.len() - 1
    }

    pub fn engine_lane(&self) -> usize {
        self.lanes.len() - 1
    }

    pub fn record(&self, lane: usize, event: MarkEvent) {
        trace!(
            "lane {} marked {} ({:?})",
            lane,
            event.offset,
            event.metadata
        );
        self.lanes[lane].lock().push(event);
    }

    pub fn record_all(&self, lane: usize, events: impl IntoIterator<Item = MarkEvent>) {
        self.lanes[lane].lock().extend(events);
    }

    /// Most recently recorded event of a lane.
    pub fn latest(&self, lane: usize) -> Option<MarkEvent> {
        self.lanes[lane].lock().last().cloned()
    }

    /// Highest offset a lane marked so far.
    pub fn highest(&self, lane: usize) -> Option<i64> {
        self.lanes[lane].lock().iter().map(|e| e.offset).max()
    }

    pub fn events(&self, lane: usize) -> Vec<MarkEvent> {
        self.lanes[lane].lock().clone()
    }

    pub fn snapshot(&self) -> Vec<Vec<MarkEvent>> {
        self.lanes.iter().map(|lane| lane.lock().clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(|lane| lane.lock().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lanes_are_independent() {
        let tracker = MarkingTracker::new(2);
        assert_eq!(tracker.group_count(), 2);
        assert_eq!(tracker.engine_lane(), 2);
        assert!(tracker.is_empty());

        tracker.record(0, MarkEvent::new(9, Some("9".to_string())));
        tracker.record(0, MarkEvent::new(3, None));
        tracker.record(1, MarkEvent::new(4, None));

        assert_eq!(tracker.latest(0).map(|e| e.offset), Some(3));
        assert_eq!(tracker.highest(0), Some(9));
        assert_eq!(tracker.events(0).len(), 2);
        assert_eq!(tracker.highest(2), None);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[1][0].offset, 4);
    }
}
