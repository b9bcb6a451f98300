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

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::service::PauseConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    Running,
    Paused {
        resume_at: Instant,
        /// where fetching restarts once the pause expires
        seek_to: i64,
        timeout: Duration,
        /// requested by user logic rather than the retry path
        manual: bool,
    },
}

/// Timer driven pause state of one partition. Nothing sleeps here, the
/// scheduler parks the partition until [`resume_at`](Self::resume_at).
#[derive(Debug)]
pub struct PauseTracker {
    state: PauseState,
    attempt: u32,
    base: Duration,
    max: Duration,
    exponential_backoff: bool,
}

impl PauseTracker {
    pub fn new(base: Duration, max: Duration, exponential_backoff: bool) -> Self {
        Self {
            state: PauseState::Running,
            attempt: 0,
            base,
            max,
            exponential_backoff,
        }
    }

    pub fn from_config(config: &PauseConfig) -> Self {
        Self::new(
            config.pause_timeout(),
            config.pause_max_timeout(),
            config.pause_with_exponential_backoff,
        )
    }

    /// Pauses until `now + timeout` and returns the timeout used. An
    /// override is taken as is, otherwise the base timeout doubles with
    /// every consecutive pause up to the ceiling.
    pub fn pause(
        &mut self,
        seek_to: i64,
        timeout_override: Option<Duration>,
        manual: bool,
        now: Instant,
    ) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let timeout = timeout_override.unwrap_or_else(|| self.backoff());
        self.state = PauseState::Paused {
            resume_at: now + timeout,
            seek_to,
            timeout,
            manual,
        };
        debug!(
            "paused until +{:?} at offset {}, attempt {}, manual {}",
            timeout, seek_to, self.attempt, manual
        );
        timeout
    }

    fn backoff(&self) -> Duration {
        if !self.exponential_backoff {
            return self.base;
        }
        let exponent = self.attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |timeout| timeout.min(self.max))
    }

    pub fn state(&self) -> PauseState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        matches!(self.state, PauseState::Paused { .. })
    }

    pub fn resume_at(&self) -> Option<Instant> {
        match self.state {
            PauseState::Paused { resume_at, .. } => Some(resume_at),
            PauseState::Running => None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.resume_at().is_some_and(|at| at <= now)
    }

    /// Back to running, returns the offset to fetch from.
    pub fn resume(&mut self) -> Option<i64> {
        match std::mem::replace(&mut self.state, PauseState::Running) {
            PauseState::Paused { seek_to, .. } => Some(seek_to),
            PauseState::Running => None,
        }
    }

    /// Consecutive pauses so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// A cycle went through without pausing.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
