//! Building blocks for [`clap`]-driven configuration of agent plugins.
pub mod kinesis;
