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

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::message::OffsetMetadataStrategy;

use super::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct GeneralConfig {
    pub client_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            client_id: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProcessingConfig {
    /// max number of virtual partitions executing at the same time
    pub concurrency: usize,
    /// max number of messages in one fetched batch
    pub max_messages: usize,
    /// wait before refetching after an empty fetch
    pub idle_wait_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get(),
            max_messages: 100,
            idle_wait_ms: 100,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct OffsetsConfig {
    pub offset_metadata_strategy: OffsetMetadataStrategy,
    pub manual_offset_management: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PauseConfig {
    pub pause_timeout_ms: u64,
    pub pause_max_timeout_ms: u64,
    pub pause_with_exponential_backoff: bool,
}

impl Default for PauseConfig {
    fn default() -> Self {
        Self {
            pause_timeout_ms: 1_000,
            pause_max_timeout_ms: 30_000,
            pause_with_exponential_backoff: true,
        }
    }
}

impl PauseConfig {
    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }
    pub fn pause_max_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_max_timeout_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// dead letter target topic, retries are unbounded without it
    pub topic: Option<String>,
    pub max_retries: u32,
    pub independent_retries: bool,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            topic: None,
            max_retries: 3,
            independent_retries: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionerKind {
    #[default]
    None,
    RoundRobin,
    KeyHash,
    Random,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct VirtualPartitionsConfig {
    pub partitioner: PartitionerKind,
    pub max_partitions: usize,
}

impl Default for VirtualPartitionsConfig {
    fn default() -> Self {
        Self {
            partitioner: PartitionerKind::None,
            max_partitions: 10,
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub general: GeneralConfig,
    pub processing: ProcessingConfig,
    pub offsets: OffsetsConfig,
    pub pause: PauseConfig,
    pub dead_letter: DeadLetterConfig,
    pub virtual_partitions: VirtualPartitionsConfig,
}

impl ConsumerConfig {
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<ConsumerConfig> {
        let path_str = path.as_ref().to_str().ok_or_else(|| {
            AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            ))
        })?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(config::Environment::with_prefix("STONEFLOW").separator("__"))
            .build()?;

        let consumer_config: ConsumerConfig = config.try_deserialize()?;
        consumer_config.validate()?;

        Ok(consumer_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.processing.concurrency == 0 {
            return Err(AppError::InvalidValue(
                "processing.concurrency must be at least 1".to_string(),
            ));
        }
        if self.processing.max_messages == 0 {
            return Err(AppError::InvalidValue(
                "processing.max_messages must be at least 1".to_string(),
            ));
        }
        if self.virtual_partitions.max_partitions == 0 {
            return Err(AppError::InvalidValue(
                "virtual_partitions.max_partitions must be at least 1".to_string(),
            ));
        }
        if self.pause.pause_timeout_ms > self.pause.pause_max_timeout_ms {
            return Err(AppError::InvalidValue(format!(
                "pause.pause_timeout_ms ({}) exceeds pause.pause_max_timeout_ms ({})",
                self.pause.pause_timeout_ms, self.pause.pause_max_timeout_ms
            )));
        }
        if let Some(topic) = &self.dead_letter.topic {
            if topic.is_empty() {
                return Err(AppError::InvalidValue(
                    "dead_letter.topic must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}
