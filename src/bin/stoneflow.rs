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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use dotenv::dotenv;
use stoneflow::message::TopicPartition;
use stoneflow::{
    setup_tracing, AppResult, ConsumerConfig, Consume, GroupConsumer, InMemoryBroker, Scheduler,
};
use tokio::runtime;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::IntervalStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// directory for the rolling log files
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// print the effective configuration and exit
    PrintConfig,
    /// consume an in-memory topic until everything is committed
    Demo {
        #[arg(long, default_value_t = 1000)]
        messages: usize,
        #[arg(long, default_value_t = 3)]
        partitions: i32,
        #[arg(long, default_value = "demo")]
        topic: String,
    },
}

/// Logs every message and marks it with its offset as metadata.
struct LoggingConsumer;

impl Consume<InMemoryBroker> for LoggingConsumer {
    async fn consume(&self, consumer: GroupConsumer<InMemoryBroker>) -> AppResult<()> {
        for message in consumer.messages() {
            debug!(
                "{} group {} offset {}: {}",
                consumer.topic_partition(),
                consumer.group_index(),
                message.offset,
                message.payload_str()
            );
            consumer.mark_as_consumed(message, Some(message.offset.to_string()));
        }
        Ok(())
    }
}

fn main() -> AppResult<()> {
    dotenv().ok();
    let commandline: CommandLine = CommandLine::parse();

    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = setup_tracing(&commandline.log_dir, level)?;

    let config = load_config(commandline.conf.as_deref())?;

    match commandline.command {
        Some(Command::PrintConfig) => {
            println!("{:#?}", config);
            Ok(())
        }
        Some(Command::Demo {
            messages,
            partitions,
            topic,
        }) => {
            let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
            rt.block_on(run_demo(config, &topic, partitions, messages))
        }
        None => {
            info!("nothing to do, see --help");
            Ok(())
        }
    }
}

fn load_config(conf: Option<&str>) -> AppResult<ConsumerConfig> {
    let path = conf.map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    if conf.is_none() && !Path::new(&path).exists() {
        let config = ConsumerConfig::default();
        config.validate()?;
        return Ok(config);
    }
    ConsumerConfig::set_up_config(path)
}

async fn run_demo(
    config: ConsumerConfig,
    topic: &str,
    partitions: i32,
    messages: usize,
) -> AppResult<()> {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic(topic, partitions);
    let topic_partitions: Vec<TopicPartition> = (0..partitions)
        .map(|partition| TopicPartition::new(topic, partition))
        .collect();
    for i in 0..messages {
        let tp = &topic_partitions[i % topic_partitions.len()];
        broker.append(tp, Some(format!("key-{}", i % 7).into()), i.to_string());
    }

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(config),
        broker.clone(),
        Arc::new(LoggingConsumer),
        notify_shutdown.clone(),
        shutdown_complete_tx,
    ));

    let running = {
        let scheduler = scheduler.clone();
        let partitions = topic_partitions.clone();
        tokio::spawn(async move { scheduler.run(partitions).await })
    };

    let mut ticker = IntervalStream::new(tokio::time::interval(Duration::from_millis(100)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            Some(_) = ticker.next() => {
                let done = topic_partitions.iter().all(|tp| {
                    broker.committed_offset(tp).map(|c| c.offset) == Some(broker.high_watermark(tp))
                });
                if done {
                    break;
                }
            }
        }
    }

    let _ = notify_shutdown.send(());
    running
        .await
        .map_err(|e| stoneflow::AppError::IllegalStateError(format!("scheduler task: {e}")))??;
    drop(scheduler);
    let _ = shutdown_complete_rx.recv().await;

    for tp in &topic_partitions {
        let committed = broker.committed_offset(tp);
        println!(
            "{}: committed {:?} of {}",
            tp,
            committed.as_ref().map(|c| c.offset),
            broker.high_watermark(tp)
        );
    }
    Ok(())
}
