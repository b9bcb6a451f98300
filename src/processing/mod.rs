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

pub use consumer::{Consume, CycleState, Directives, GroupConsumer, PauseRequest};
pub use context::PartitionContext;
pub use executor::{ExecutorPool, GroupOutcome};
pub use filter::{
    Delayer, Filter, FilterAction, FilterChain, FilterFactory, FilterOutcome, MinBatchSize,
    Throttler,
};
pub use marking::MarkingTracker;
pub use partitioner::{
    partitioner_from_config, split, Group, KeyHash, Partitioner, RandomPartitioner, RoundRobin,
    SinglePartition,
};
pub use pause::{PauseState, PauseTracker};
pub use reconciler::OffsetReconciler;
pub use retry::{
    RetryDecision, RetryMode, RetryTracker, HEADER_ORIGINAL_ATTEMPTS, HEADER_ORIGINAL_OFFSET,
    HEADER_ORIGINAL_PARTITION, HEADER_ORIGINAL_TOPIC, RETRY_WINDOW,
};
pub use scheduler::Scheduler;
pub use supervisor::{CycleOutcome, PartitionSupervisor};
pub use transaction::{OpenTransaction, Transaction, TransactionCoordinator};

mod consumer;
mod context;
mod executor;
mod filter;
mod marking;
mod partitioner;
mod pause;
mod reconciler;
mod retry;
mod scheduler;
mod supervisor;
mod transaction;
