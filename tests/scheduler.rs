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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stoneflow::message::TopicPartition;
use stoneflow::service::PartitionerKind;
use stoneflow::{
    AppError, AppResult, ConsumerConfig, Consume, GroupConsumer, InMemoryBroker, Scheduler,
};
use tokio::sync::{broadcast, mpsc};

use common::config;

#[derive(Default)]
struct Counting {
    revoked: AtomicUsize,
}

impl Consume<InMemoryBroker> for Counting {
    async fn consume(&self, consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
        // the first partition pauses itself for a long time
        if consumer.topic_partition().partition == 0 && consumer.group_index() == 0 {
            if let Some(first) = consumer.messages().first() {
                if first.offset == 0 {
                    consumer.pause(0, Some(Duration::from_secs(3600)));
                    return Ok(());
                }
            }
        }
        for message in consumer.messages() {
            consumer.mark_as_consumed(message, Some(message.offset.to_string()));
        }
        Ok(())
    }

    async fn revoked(&self, _topic_partition: &TopicPartition) {
        self.revoked.fetch_add(1, Ordering::SeqCst);
    }
}

struct Halting;

impl Consume<InMemoryBroker> for Halting {
    async fn consume(&self, _consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
        Err(AppError::InvalidValue("unreadable payload".to_string()))
    }
}

struct Fixture<C: Consume<InMemoryBroker>> {
    broker: Arc<InMemoryBroker>,
    partitions: Vec<TopicPartition>,
    scheduler: Arc<Scheduler<InMemoryBroker, C>>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

fn fixture<C: Consume<InMemoryBroker>>(
    partitions: i32,
    per_partition: usize,
    config: ConsumerConfig,
    consumer: Arc<C>,
) -> Fixture<C> {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic("orders", partitions);
    let partitions: Vec<TopicPartition> = (0..partitions)
        .map(|p| TopicPartition::new("orders", p))
        .collect();
    for tp in &partitions {
        for i in 0..per_partition {
            broker.append(tp, None, i.to_string());
        }
    }
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(config),
        broker.clone(),
        consumer,
        notify_shutdown.clone(),
        shutdown_complete_tx,
    ));
    Fixture {
        broker,
        partitions,
        scheduler,
        notify_shutdown,
        shutdown_complete_rx,
    }
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..1000 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn committed(broker: &InMemoryBroker, tp: &TopicPartition) -> Option<i64> {
    broker.committed_offset(tp).map(|c| c.offset)
}

#[tokio::test(start_paused = true)]
async fn test_paused_partition_does_not_block_others() -> AppResult<()> {
    let mut config = config(10);
    config.virtual_partitions.partitioner = PartitionerKind::RoundRobin;
    config.virtual_partitions.max_partitions = 3;
    let Fixture {
        broker,
        partitions,
        scheduler,
        notify_shutdown,
        mut shutdown_complete_rx,
    } = fixture(3, 30, config, Arc::new(Counting::default()));

    let running = {
        let scheduler = scheduler.clone();
        let partitions = partitions.clone();
        tokio::spawn(async move { scheduler.run(partitions).await })
    };

    let others_done = wait_for(|| {
        partitions[1..]
            .iter()
            .all(|tp| committed(&broker, tp) == Some(30))
    })
    .await;
    assert!(others_done);
    assert_eq!(broker.fetch_history(&partitions[0]), vec![0]);
    assert_eq!(committed(&broker, &partitions[0]), None);
    assert_eq!(scheduler.assigned().len(), 3);

    notify_shutdown.send(()).expect("scheduler subscribed");
    running
        .await
        .map_err(|e| AppError::IllegalStateError(e.to_string()))??;
    assert!(scheduler.assigned().is_empty());
    drop(scheduler);
    assert_eq!(shutdown_complete_rx.recv().await, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_revoked_partition_is_released() -> AppResult<()> {
    let consumer = Arc::new(Counting::default());
    let Fixture {
        broker,
        partitions,
        scheduler,
        ..
    } = fixture(2, 20, config(10), consumer.clone());
    // only the second partition is consumed
    let tp = partitions[1].clone();

    let running = {
        let scheduler = scheduler.clone();
        let tp = tp.clone();
        tokio::spawn(async move { scheduler.run(vec![tp]).await })
    };

    assert!(wait_for(|| committed(&broker, &tp) == Some(20)).await);
    assert!(scheduler.is_assigned(&tp));
    assert!(!scheduler.revoke(&partitions[0]));
    assert!(scheduler.revoke(&tp));

    // the run ends on its own once nothing is assigned
    running
        .await
        .map_err(|e| AppError::IllegalStateError(e.to_string()))??;
    assert!(!scheduler.is_assigned(&tp));
    assert_eq!(consumer.revoked.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_revoking_paused_partition_releases_it_at_once() -> AppResult<()> {
    let consumer = Arc::new(Counting::default());
    let Fixture {
        broker,
        partitions,
        scheduler,
        ..
    } = fixture(1, 20, config(10), consumer.clone());
    let tp = partitions[0].clone();

    let running = {
        let scheduler = scheduler.clone();
        let tp = tp.clone();
        tokio::spawn(async move { scheduler.run(vec![tp]).await })
    };

    // first cycle pauses the partition for an hour
    assert!(wait_for(|| broker.fetch_history(&tp) == vec![0]).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.is_assigned(&tp));

    let revoked_at = tokio::time::Instant::now();
    assert!(scheduler.revoke(&tp));
    running
        .await
        .map_err(|e| AppError::IllegalStateError(e.to_string()))??;
    assert!(revoked_at.elapsed() < Duration::from_secs(60));
    assert!(!scheduler.is_assigned(&tp));
    assert_eq!(consumer.revoked.load(Ordering::SeqCst), 1);
    assert_eq!(broker.fetch_history(&tp), vec![0]);
    assert_eq!(committed(&broker, &tp), None);
    Ok(())
}

#[tokio::test]
async fn test_fatal_errors_halt_each_partition() -> AppResult<()> {
    let Fixture {
        broker,
        partitions,
        scheduler,
        ..
    } = fixture(2, 5, config(10), Arc::new(Halting));

    scheduler.run(partitions.clone()).await?;
    for tp in &partitions {
        assert_eq!(committed(&broker, tp), None);
        assert_eq!(broker.fetch_history(tp), vec![0]);
    }
    assert!(scheduler.assigned().is_empty());
    Ok(())
}
