//! The contract between the agent and an input that runs in the background.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;

use crate::accumulator::Accumulator;

/// An input that collects on its own schedule rather than on each gather cycle.
///
/// The agent calls [`start`](ServiceInput::start) once, [`gather`](ServiceInput::gather) on
/// every collection interval, and [`stop`](ServiceInput::stop) on shutdown.
#[async_trait]
pub trait ServiceInput: Debug + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn start(&self, accumulator: Arc<dyn Accumulator>) -> Result<(), Self::Error>;

    async fn gather(&self, accumulator: &dyn Accumulator) -> Result<(), Self::Error>;

    /// Stop background work and persist whatever state must survive a restart.
    async fn stop(&self) -> Result<(), Self::Error>;
}
