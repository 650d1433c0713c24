//! CLI config for the Kinesis consumer input.

use std::time::Duration;

/// Where a shard with no stored checkpoint starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ShardIteratorType {
    /// The oldest record still retained by the stream.
    #[default]
    TrimHorizon,

    /// Only records written after the iterator was acquired.
    Latest,
}

/// Compression applied by producers to record payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ContentEncoding {
    /// Payloads are used as-is.
    #[default]
    Identity,

    /// Payloads are gzip members.
    Gzip,

    /// Payloads are zlib streams.
    Zlib,
}

const DEFAULT_POLL_INTERVAL: &str = "250ms";
const DEFAULT_MAX_UNDELIVERED_MESSAGES: &str = "1000";
const DEFAULT_MAX_RECORDS: &str = "10000";
const DEFAULT_THROUGHPUT_RETRY_DELAY: &str = "1s";
const DEFAULT_CHECKPOINT_FLUSH_INTERVAL: &str = "1m";

/// Settings of the Kinesis consumer input.
#[derive(Debug, Clone, PartialEq, Eq, clap::Parser)]
pub struct KinesisConsumerConfig {
    /// Name of the stream to consume.
    #[clap(long = "kinesis-stream-name", env = "AGENT_KINESIS_STREAM_NAME", action)]
    pub stream_name: String,

    /// Starting position for shards that have no stored checkpoint.
    #[clap(
        long = "kinesis-shard-iterator-type",
        env = "AGENT_KINESIS_SHARD_ITERATOR_TYPE",
        default_value_t = ShardIteratorType::default(),
        value_enum,
        action
    )]
    pub shard_iterator_type: ShardIteratorType,

    /// How long a shard consumer waits between two `GetRecords` calls.
    #[clap(
        long = "kinesis-poll-interval",
        env = "AGENT_KINESIS_POLL_INTERVAL",
        default_value = DEFAULT_POLL_INTERVAL,
        value_parser = humantime::parse_duration,
    )]
    pub poll_interval: Duration,

    /// Maximum number of record groups handed to outputs but not yet confirmed.
    ///
    /// Consumption pauses while this many groups are in flight. Zero selects the default.
    #[clap(
        long = "kinesis-max-undelivered-messages",
        env = "AGENT_KINESIS_MAX_UNDELIVERED_MESSAGES",
        default_value = DEFAULT_MAX_UNDELIVERED_MESSAGES,
        action
    )]
    pub max_undelivered_messages: usize,

    /// Upper bound on records returned by a single `GetRecords` call.
    #[clap(
        long = "kinesis-max-records",
        env = "AGENT_KINESIS_MAX_RECORDS",
        default_value = DEFAULT_MAX_RECORDS,
        action
    )]
    pub max_records: u32,

    /// How often to list the stream's shards looking for new ones.
    ///
    /// When unset the shards are listed once at startup; children of closed shards are still
    /// picked up as their parents finish.
    #[clap(
        long = "kinesis-shard-update-interval",
        env = "AGENT_KINESIS_SHARD_UPDATE_INTERVAL",
        value_parser = humantime::parse_duration,
    )]
    pub shard_update_interval: Option<Duration>,

    /// Pause before retrying a fetch rejected for exceeding provisioned throughput.
    #[clap(
        long = "kinesis-throughput-retry-delay",
        env = "AGENT_KINESIS_THROUGHPUT_RETRY_DELAY",
        default_value = DEFAULT_THROUGHPUT_RETRY_DELAY,
        value_parser = humantime::parse_duration,
    )]
    pub throughput_retry_delay: Duration,

    /// Compression of record payloads.
    #[clap(
        long = "kinesis-content-encoding",
        env = "AGENT_KINESIS_CONTENT_ENCODING",
        default_value_t = ContentEncoding::default(),
        value_enum,
        action
    )]
    pub content_encoding: ContentEncoding,

    /// Application name used to namespace stored checkpoints.
    ///
    /// Checkpointing is enabled only when both this and the table name are set.
    #[clap(
        long = "kinesis-checkpoint-app-name",
        env = "AGENT_KINESIS_CHECKPOINT_APP_NAME",
        action
    )]
    pub checkpoint_app_name: Option<String>,

    /// Table holding stored checkpoints.
    #[clap(
        long = "kinesis-checkpoint-table-name",
        env = "AGENT_KINESIS_CHECKPOINT_TABLE_NAME",
        action
    )]
    pub checkpoint_table_name: Option<String>,

    /// How often buffered checkpoints are written to the table.
    ///
    /// Also bounds the final write performed when the input stops.
    #[clap(
        long = "kinesis-checkpoint-flush-interval",
        env = "AGENT_KINESIS_CHECKPOINT_FLUSH_INTERVAL",
        default_value = DEFAULT_CHECKPOINT_FLUSH_INTERVAL,
        value_parser = humantime::parse_duration,
    )]
    pub checkpoint_flush_interval: Duration,
}

impl KinesisConsumerConfig {
    /// Config for `stream_name` with every other setting at its default.
    pub fn new(stream_name: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            shard_iterator_type: ShardIteratorType::default(),
            poll_interval: Duration::from_millis(250),
            max_undelivered_messages: 1000,
            max_records: 10_000,
            shard_update_interval: None,
            throughput_retry_delay: Duration::from_secs(1),
            content_encoding: ContentEncoding::default(),
            checkpoint_app_name: None,
            checkpoint_table_name: None,
            checkpoint_flush_interval: Duration::from_secs(60),
        }
    }

    /// The undelivered-group bound to use, with zero meaning the default.
    pub fn effective_max_undelivered_messages(&self) -> usize {
        match self.max_undelivered_messages {
            0 => 1000,
            n => n,
        }
    }

    /// Whether both checkpoint table settings are present.
    pub fn checkpointing_enabled(&self) -> bool {
        self.checkpoint_app_name.is_some() && self.checkpoint_table_name.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_match_constructor() {
        let parsed =
            KinesisConsumerConfig::try_parse_from(["agent", "--kinesis-stream-name", "metrics"])
                .unwrap();
        assert_eq!(parsed, KinesisConsumerConfig::new("metrics"));
    }

    #[test]
    fn parses_all_flags() {
        let parsed = KinesisConsumerConfig::try_parse_from([
            "agent",
            "--kinesis-stream-name",
            "metrics",
            "--kinesis-shard-iterator-type",
            "latest",
            "--kinesis-poll-interval",
            "2s",
            "--kinesis-max-undelivered-messages",
            "5",
            "--kinesis-max-records",
            "100",
            "--kinesis-shard-update-interval",
            "30s",
            "--kinesis-throughput-retry-delay",
            "500ms",
            "--kinesis-content-encoding",
            "gzip",
            "--kinesis-checkpoint-app-name",
            "agent",
            "--kinesis-checkpoint-table-name",
            "checkpoints",
            "--kinesis-checkpoint-flush-interval",
            "10s",
        ])
        .unwrap();

        assert_eq!(parsed.shard_iterator_type, ShardIteratorType::Latest);
        assert_eq!(parsed.poll_interval, Duration::from_secs(2));
        assert_eq!(parsed.max_undelivered_messages, 5);
        assert_eq!(parsed.max_records, 100);
        assert_eq!(parsed.shard_update_interval, Some(Duration::from_secs(30)));
        assert_eq!(parsed.throughput_retry_delay, Duration::from_millis(500));
        assert_eq!(parsed.content_encoding, ContentEncoding::Gzip);
        assert_eq!(parsed.checkpoint_app_name.as_deref(), Some("agent"));
        assert_eq!(parsed.checkpoint_table_name.as_deref(), Some("checkpoints"));
        assert_eq!(parsed.checkpoint_flush_interval, Duration::from_secs(10));
    }

    #[test]
    fn rejects_unknown_encoding() {
        let res = KinesisConsumerConfig::try_parse_from([
            "agent",
            "--kinesis-stream-name",
            "metrics",
            "--kinesis-content-encoding",
            "brotli",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn zero_undelivered_selects_default() {
        let mut config = KinesisConsumerConfig::new("metrics");
        config.max_undelivered_messages = 0;
        assert_eq!(config.effective_max_undelivered_messages(), 1000);
        config.max_undelivered_messages = 7;
        assert_eq!(config.effective_max_undelivered_messages(), 7);

        assert!(!config.checkpointing_enabled());
        config.checkpoint_app_name = Some("agent".into());
        assert!(!config.checkpointing_enabled());
        config.checkpoint_table_name = Some("checkpoints".into());
        assert!(config.checkpointing_enabled());
    }
}
