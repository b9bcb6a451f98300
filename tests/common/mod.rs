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

#![allow(dead_code)]

use std::sync::Arc;

use stoneflow::message::TopicPartition;
use stoneflow::processing::{
    CycleOutcome, ExecutorPool, FilterChain, PartitionSupervisor, Partitioner,
    TransactionCoordinator,
};
use stoneflow::{AppResult, ConsumerConfig, Consume, InMemoryBroker};
use tokio::sync::{broadcast, mpsc};

pub const TOPIC: &str = "events";

/// A broker with one partition of `TOPIC` holding `count` messages whose
/// payload is their offset.
pub fn seeded(count: usize) -> (Arc<InMemoryBroker>, TopicPartition) {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic(TOPIC, 1);
    let tp = TopicPartition::new(TOPIC, 0);
    for i in 0..count {
        broker.append(&tp, None, i.to_string());
    }
    (broker, tp)
}

pub fn config(max_messages: usize) -> ConsumerConfig {
    let mut config = ConsumerConfig::default();
    config.processing.concurrency = 4;
    config.processing.max_messages = max_messages;
    config.processing.idle_wait_ms = 10;
    config.pause.pause_timeout_ms = 10;
    config.pause.pause_max_timeout_ms = 100;
    config
}

pub fn executor(concurrency: usize) -> Arc<ExecutorPool> {
    let (notify, _) = broadcast::channel(1);
    let (complete_tx, _) = mpsc::channel(1);
    Arc::new(ExecutorPool::new(concurrency, notify, complete_tx))
}

pub async fn supervisor<C: Consume<InMemoryBroker>>(
    broker: &Arc<InMemoryBroker>,
    tp: &TopicPartition,
    config: &ConsumerConfig,
    consumer: Arc<C>,
    partitioner: Arc<dyn Partitioner>,
) -> AppResult<PartitionSupervisor<InMemoryBroker, C>> {
    PartitionSupervisor::assign(
        tp.clone(),
        config,
        TransactionCoordinator::new(broker.clone()),
        consumer,
        executor(config.processing.concurrency),
        partitioner,
        FilterChain::default(),
    )
    .await
}

/// Runs cycles until the partition has nothing left to fetch, sleeping
/// through pauses. Returns the number of cycles that fetched.
pub async fn drain<C: Consume<InMemoryBroker>>(
    supervisor: &mut PartitionSupervisor<InMemoryBroker, C>,
    max_cycles: usize,
) -> AppResult<usize> {
    let mut cycles = 0;
    while cycles < max_cycles {
        match supervisor.run_cycle().await? {
            CycleOutcome::Continue => cycles += 1,
            CycleOutcome::Paused { until } => {
                cycles += 1;
                tokio::time::sleep_until(until).await;
            }
            CycleOutcome::Idle | CycleOutcome::Revoked => break,
        }
    }
    Ok(cycles)
}
