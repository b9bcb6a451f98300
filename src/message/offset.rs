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

use serde::{Deserialize, Serialize};

/// How the committed offset and its metadata are picked when several virtual
/// partitions marked independently.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetMetadataStrategy {
    /// longest fully consumed prefix of the batch
    #[default]
    Exact,
    /// highest marked offset
    Latest,
}

/// One `mark_as_consumed` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkEvent {
    pub offset: i64,
    pub metadata: Option<String>,
    /// milliseconds since epoch
    pub timestamp: i64,
}

impl MarkEvent {
    pub fn new(offset: i64, metadata: Option<String>) -> Self {
        Self {
            offset,
            metadata,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Last consumed offset of a partition after reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciledOffset {
    pub offset: i64,
    pub metadata: Option<String>,
}

impl ReconciledOffset {
    pub fn new(offset: i64, metadata: Option<String>) -> Self {
        Self { offset, metadata }
    }

    /// Position to commit, the broker stores the next offset to read.
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// Offset as stored by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedOffset {
    /// next offset to read
    pub offset: i64,
    pub metadata: Option<String>,
    pub commit_timestamp: i64,
}
