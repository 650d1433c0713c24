//! A service input that consumes a sharded, resharding record stream.
//!
//! The [`Orchestrator`] discovers the stream's shards and runs one [`ShardConsumer`] per shard,
//! starting a child shard only once all of its parents are fully consumed. Each record is handed
//! to a [`RecordHandler`]; the default [`MetricRecordHandler`] decodes and parses it and
//! dispatches the metrics through the [`DeliveryCoordinator`], which bounds the number of groups
//! awaiting delivery and advances the shard's checkpoint in the [`CheckpointStore`] only once
//! delivery is confirmed. Delivery is at-least-once: after a restart, consumption resumes after
//! the last confirmed record of every shard.
//!
//! [`KinesisConsumer`] wires these together behind the agent's [`ServiceInput`] contract. The
//! stream service, checkpoint table, accumulator and parser are all traits; the `memory` module,
//! built for tests or with the `test-util` feature, has in-memory implementations of each.

pub mod accumulator;
pub mod checkpoint;
pub mod client;
pub mod consumer;
pub mod decode;
pub mod delivery;
pub mod handler;
pub mod input;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod metric;
pub mod orchestrator;
pub mod plugin;
pub mod registry;
pub mod sequence;
pub mod shard;

pub use checkpoint::{CheckpointBackend, CheckpointStore};
pub use client::StreamClient;
pub use consumer::ShardConsumer;
pub use delivery::DeliveryCoordinator;
pub use handler::{MetricRecordHandler, RecordHandler};
pub use input::ServiceInput;
pub use orchestrator::Orchestrator;
pub use plugin::{Error, KinesisConsumer};
pub use sequence::SequenceNumber;
pub use shard::{Shard, ShardId};
