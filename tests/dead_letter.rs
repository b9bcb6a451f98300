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

mod common;

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use rstest::rstest;
use stoneflow::processing::{
    CycleOutcome, PauseState, SinglePartition, HEADER_ORIGINAL_ATTEMPTS, HEADER_ORIGINAL_OFFSET,
    HEADER_ORIGINAL_PARTITION, HEADER_ORIGINAL_TOPIC,
};
use stoneflow::{AppError, AppResult, Consume, GroupConsumer, InMemoryBroker};

use common::{config, drain, seeded, supervisor, TOPIC};

/// Marks message by message and fails on every offset divisible by three
/// with remainder two.
#[derive(Default)]
struct BrokenEveryThird {
    calls: AtomicUsize,
}

impl Consume<InMemoryBroker> for BrokenEveryThird {
    async fn consume(&self, consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for message in consumer.messages() {
            if message.offset % 3 == 2 {
                return Err(AppError::consume(format!("cannot handle {}", message.offset)));
            }
            consumer.mark_as_consumed(message, None);
        }
        Ok(())
    }
}

#[rstest]
#[case::rolling(false)]
#[case::independent(true)]
#[tokio::test(start_paused = true)]
async fn test_broken_messages_are_dead_lettered(#[case] independent: bool) -> AppResult<()> {
    let (broker, tp) = seeded(10);
    let mut config = config(10);
    config.dead_letter.topic = Some("dead".to_string());
    config.dead_letter.max_retries = 2;
    config.dead_letter.independent_retries = independent;
    let consumer = Arc::new(BrokenEveryThird::default());
    let mut supervisor = supervisor(
        &broker,
        &tp,
        &config,
        consumer.clone(),
        Arc::new(SinglePartition),
    )
    .await?;

    drain(&mut supervisor, 50).await?;

    let dead = broker.topic_messages("dead");
    let payloads: Vec<String> = dead.iter().map(|m| m.payload_str().into_owned()).collect();
    assert_eq!(payloads, vec!["2", "5", "8"]);
    // each broken message ran once plus two retries
    assert_eq!(consumer.calls.load(Ordering::SeqCst), 3 * 3 + 1);

    let first = &dead[0];
    assert_eq!(first.raw_metadata[HEADER_ORIGINAL_TOPIC], TOPIC);
    assert_eq!(first.raw_metadata[HEADER_ORIGINAL_PARTITION], "0");
    assert_eq!(first.raw_metadata[HEADER_ORIGINAL_OFFSET], "2");
    assert_eq!(first.raw_metadata[HEADER_ORIGINAL_ATTEMPTS], "3");

    assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(10));
    assert_eq!(
        broker.fetch_history(&tp),
        vec![0, 2, 2, 3, 5, 5, 6, 8, 8, 9, 10]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_without_target_retries_forever() -> AppResult<()> {
    let (broker, tp) = seeded(10);
    let mut config = config(10);
    config.dead_letter.max_retries = 1;
    let mut supervisor = supervisor(
        &broker,
        &tp,
        &config,
        Arc::new(BrokenEveryThird::default()),
        Arc::new(SinglePartition),
    )
    .await?;

    let mut pauses = Vec::new();
    for _ in 0..6 {
        if let CycleOutcome::Paused { until } = supervisor.run_cycle().await? {
            pauses.push(until - tokio::time::Instant::now());
            tokio::time::sleep_until(until).await;
        }
    }

    assert_eq!(supervisor.next_offset(), 2);
    assert!(broker.topic_messages("dead").is_empty());
    // everything before the broken message is committed
    assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(2));
    // exponential backoff capped at the max timeout
    let millis: Vec<u128> = pauses.iter().map(|d| d.as_millis()).collect();
    assert_eq!(millis, vec![10, 20, 40, 80, 100, 100]);
    assert!(matches!(
        supervisor.pause_state(),
        PauseState::Paused { manual: false, .. }
    ));
    Ok(())
}

/// Fails on the message whose offset equals the number of previous runs, so
/// every redelivery fails one message further.
struct FailsAtRunCount {
    runs: AtomicI64,
}

impl Consume<InMemoryBroker> for FailsAtRunCount {
    async fn consume(&self, consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
        let messages = consumer.messages();
        if messages.len() < 3 {
            consumer.seek(messages[0].offset);
            return Ok(());
        }
        let runs = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        for message in messages {
            if message.offset == runs {
                return Err(AppError::consume(format!("run {} failed", runs)));
            }
            consumer.mark_as_consumed(message, None);
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_rolling_attempts_accumulate_across_positions() -> AppResult<()> {
    let (broker, tp) = seeded(100);
    let mut config = config(10);
    config.dead_letter.topic = Some("dead".to_string());
    config.dead_letter.max_retries = 2;
    let mut supervisor = supervisor(
        &broker,
        &tp,
        &config,
        Arc::new(FailsAtRunCount {
            runs: AtomicI64::new(-1),
        }),
        Arc::new(SinglePartition),
    )
    .await?;

    for _ in 0..50 {
        if broker.topic_messages("dead").len() >= 3 {
            break;
        }
        if let CycleOutcome::Paused { until } = supervisor.run_cycle().await? {
            tokio::time::sleep_until(until).await;
        }
    }

    let broken: Vec<String> = broker
        .topic_messages("dead")
        .iter()
        .map(|m| m.payload_str().into_owned())
        .collect();
    assert_eq!(broken, vec!["2", "5", "8"]);
    assert_eq!(broker.committed_offset(&tp).map(|c| c.offset), Some(9));
    Ok(())
}
