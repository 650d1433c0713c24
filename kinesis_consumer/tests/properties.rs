//! Invariants that must hold however the shards, deliveries and discovery passes interleave.

use std::{sync::Arc, time::Duration};

use agent_clap_blocks::kinesis::KinesisConsumerConfig;
use kinesis_consumer::{
    CheckpointStore, KinesisConsumer, Orchestrator, SequenceNumber, ServiceInput, Shard, ShardId,
    accumulator::TrackingId,
    consumer::ConsumerOptions,
    memory::{
        LineParser, MemoryAccumulator, MemoryCheckpointBackend, MemoryStreamClient,
        RecordingHandler,
    },
    orchestrator::OrchestratorOptions,
    registry::ShardRegistry,
    shard::{ChildShard, ShardState},
};
use tokio_util::sync::CancellationToken;

const STREAM: &str = "metrics";

fn seq(n: u64) -> SequenceNumber {
    SequenceNumber::from(n)
}

fn config() -> KinesisConsumerConfig {
    let mut config = KinesisConsumerConfig::new(STREAM);
    config.poll_interval = Duration::from_millis(10);
    config.checkpoint_app_name = Some("agent".into());
    config.checkpoint_table_name = Some("checkpoints".into());
    config
}

fn input(
    config: KinesisConsumerConfig,
    client: &Arc<MemoryStreamClient>,
    backend: &Arc<MemoryCheckpointBackend>,
) -> KinesisConsumer {
    KinesisConsumer::new(
        config,
        Arc::clone(client) as _,
        Some(Arc::clone(backend) as _),
        Some(Arc::new(LineParser)),
    )
    .unwrap()
}

async fn wait_for(mut cond: impl FnMut() -> bool) {
    while !cond() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn checkpointed(input: &KinesisConsumer, shard: &str) -> Option<SequenceNumber> {
    input
        .checkpoints()
        .checkpoint(STREAM, &ShardId::from(shard))
        .map(|c| c.sequence_number)
}

#[tokio::test(start_paused = true)]
async fn concurrent_discovery_claims_each_shard_once() {
    let client = Arc::new(MemoryStreamClient::new(STREAM));
    for n in 0..4 {
        client.add_shard(Shard::new(format!("shard-{n}"), 0_u64));
    }
    let checkpoints = Arc::new(CheckpointStore::new(
        Arc::new(MemoryCheckpointBackend::default()),
        "agent",
        Duration::from_secs(1),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&client) as _,
        Arc::new(RecordingHandler::default()),
        STREAM,
        Arc::new(ShardRegistry::new()),
        checkpoints,
        OrchestratorOptions {
            consumer: ConsumerOptions {
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            ..Default::default()
        },
    ));
    let cancel = CancellationToken::new();

    let passes = (0..8).map(|_| orchestrator.refresh(&cancel));
    for res in futures::future::join_all(passes).await {
        res.unwrap();
    }

    assert_eq!(orchestrator.registry().active_shards().len(), 4);
    for n in 0..4 {
        assert_eq!(client.iterator_positions(&format!("shard-{n}")).len(), 1);
    }
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn undelivered_groups_stay_within_bound() {
    let client = Arc::new(MemoryStreamClient::new(STREAM));
    let backend = Arc::new(MemoryCheckpointBackend::default());
    client.add_shard(Shard::new("shard-0", 0_u64));
    for n in 1..=5 {
        client.push_record("shard-0", n, format!("r{n}"));
    }
    let mut config = config();
    config.max_undelivered_messages = 2;
    let accumulator = MemoryAccumulator::manual();

    let input = input(config, &client, &backend);
    input.start(Arc::new(accumulator.clone())).await.unwrap();
    wait_for(|| accumulator.groups().len() == 2).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(accumulator.groups().len(), 2);

    let first = accumulator.groups()[0].0;
    assert!(accumulator.confirm(first, true));
    wait_for(|| accumulator.groups().len() == 3).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(accumulator.groups().len(), 3);

    input.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn checkpoints_never_move_backwards() {
    let client = Arc::new(MemoryStreamClient::new(STREAM));
    let backend = Arc::new(MemoryCheckpointBackend::default());
    client.add_shard(Shard::new("shard-0", 0_u64));
    for n in 1..=3 {
        client.push_record("shard-0", n, format!("r{n}"));
    }
    let accumulator = MemoryAccumulator::manual();

    let input = input(config(), &client, &backend);
    input.start(Arc::new(accumulator.clone())).await.unwrap();
    wait_for(|| accumulator.groups().len() == 3).await;
    let ids: Vec<TrackingId> = accumulator.groups().iter().map(|(id, _)| *id).collect();

    accumulator.confirm(ids[2], true);
    wait_for(|| checkpointed(&input, "shard-0") == Some(seq(3))).await;

    accumulator.confirm(ids[0], true);
    accumulator.confirm(ids[1], true);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(checkpointed(&input, "shard-0"), Some(seq(3)));

    input.stop().await.unwrap();
    assert_eq!(
        backend.get("agent-metrics", &ShardId::from("shard-0")),
        Some(seq(3))
    );
}

#[tokio::test(start_paused = true)]
async fn stop_flushes_every_shard() {
    let client = Arc::new(MemoryStreamClient::new(STREAM));
    let backend = Arc::new(MemoryCheckpointBackend::default());
    for n in 0..3 {
        let shard = format!("shard-{n}");
        client.add_shard(Shard::new(shard.as_str(), 0_u64));
        client.push_record(&shard, 10 + n, "x");
    }
    let mut config = config();
    // nothing reaches the table before stop
    config.checkpoint_flush_interval = Duration::from_secs(3600);
    let accumulator = MemoryAccumulator::auto();

    let input = input(config, &client, &backend);
    input.start(Arc::new(accumulator.clone())).await.unwrap();
    wait_for(|| input.checkpoints().dirty_count() == 3).await;
    assert_eq!(backend.put_count(), 0);

    input.stop().await.unwrap();
    assert_eq!(input.checkpoints().dirty_count(), 0);
    for n in 0..3 {
        assert_eq!(
            backend.get("agent-metrics", &ShardId::from(format!("shard-{n}"))),
            Some(seq(10 + n))
        );
    }
}

#[tokio::test(start_paused = true)]
async fn merged_child_starts_exactly_once() {
    let client = Arc::new(MemoryStreamClient::new(STREAM));
    let backend = Arc::new(MemoryCheckpointBackend::default());
    client.add_shard(Shard::new("shard-a", 0_u64));
    client.add_shard(Shard::new("shard-b", 0_u64));
    client.add_shard(
        Shard::new("shard-c", 100_u64)
            .with_parent("shard-a")
            .with_adjacent_parent("shard-b"),
    );
    let mut config = config();
    config.shard_update_interval = Some(Duration::from_millis(50));
    let accumulator = MemoryAccumulator::auto();

    let input = input(config, &client, &backend);
    input.start(Arc::new(accumulator.clone())).await.unwrap();
    wait_for(|| input.registry().active_shards().len() == 2).await;

    // both parents close at once
    let parents = [ShardId::from("shard-a"), ShardId::from("shard-b")];
    client.close_shard("shard-a", vec![ChildShard::new("shard-c", parents.clone())]);
    client.close_shard("shard-b", vec![ChildShard::new("shard-c", parents.clone())]);

    wait_for(|| input.registry().state(&ShardId::from("shard-c")) == ShardState::Active).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.iterator_positions("shard-c").len(), 1);
    assert!(input.registry().all_consumed(&parents));

    input.stop().await.unwrap();
}
