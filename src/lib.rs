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

//! Virtual partition execution and offset reconciliation for message queue
//! consumers.
//!
//! A partition's batch is split into virtual partitions that run
//! concurrently; their marks are reconciled into one committable offset,
//! with retry, dead lettering, pausing and transactions layered on top.

pub mod client;
pub mod message;
pub mod processing;
pub mod service;

pub use client::{BrokerClient, InMemoryBroker, ProduceRecord};
pub use processing::{Consume, GroupConsumer, Scheduler};
pub use service::{
    setup_local_tracing, setup_tracing, AppError, AppResult, ConsumerConfig, Shutdown,
    ShutdownCause, TracingGuard,
};
