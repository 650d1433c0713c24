//! Downstream side of the input: where metric groups go and how their delivery is reported.

use std::{fmt::Debug, sync::Arc};

use tokio::sync::mpsc;

use crate::metric::Metric;

/// Identifies a metric group handed to a [`TrackingAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackingId(u64);

impl TrackingId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Outcome of a tracked metric group once every output has accepted or rejected it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub id: TrackingId,
    pub delivered: bool,
}

/// Accepts metric groups and later reports their delivery on the handle's channel.
pub trait TrackingAccumulator: Debug + Send + Sync + 'static {
    fn add_tracking_metric_group(&self, metrics: Vec<Metric>) -> TrackingId;
}

/// Returned by [`Accumulator::with_tracking`].
#[derive(Debug)]
pub struct TrackingHandle {
    pub accumulator: Arc<dyn TrackingAccumulator>,
    /// One [`DeliveryInfo`] per group added through `accumulator`.
    pub delivered: mpsc::Receiver<DeliveryInfo>,
}

/// The agent's accumulator, from which service inputs obtain tracking handles.
pub trait Accumulator: Debug + Send + Sync + 'static {
    /// A tracking handle whose delivery channel can hold `max_in_flight` outstanding reports.
    fn with_tracking(&self, max_in_flight: usize) -> TrackingHandle;
}
