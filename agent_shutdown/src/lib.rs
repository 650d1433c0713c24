//! Ordered shutdown for the agent's service inputs
//!
//! Inputs such as the Kinesis consumer hold state that has to reach durable storage before the
//! process exits. Each one hands its stop routine to [`ShutdownManager::on_shutdown`]. Nothing
//! runs until [`shutdown`][ShutdownManager::shutdown] is requested; then every routine runs
//! concurrently, and [`join`][ShutdownManager::join] returns once all of them have finished, at
//! which point the agent token is cancelled.
use std::{fmt::Display, future::Future};

use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info};

/// Runs the stop routines of registered components when the agent shuts down
#[derive(Debug)]
pub struct ShutdownManager {
    agent_shutdown: CancellationToken,
    requested: CancellationToken,
    stops: TaskTracker,
}

impl ShutdownManager {
    /// Create a [`ShutdownManager`]
    ///
    /// `agent_shutdown` is cancelled once every registered stop routine has returned.
    pub fn new(agent_shutdown: CancellationToken) -> Self {
        Self {
            agent_shutdown,
            requested: CancellationToken::new(),
            stops: TaskTracker::new(),
        }
    }

    /// Create a [`ShutdownManager`] whose agent token nobody observes
    pub fn new_testing() -> Self {
        Self::new(CancellationToken::new())
    }

    /// Run `stop` for `component` once shutdown is requested
    ///
    /// A failing routine is logged; it does not hold up the other components or
    /// [`join`][ShutdownManager::join].
    pub fn on_shutdown<F, Fut, E>(&self, component: impl Into<String>, stop: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let component = component.into();
        let requested = self.requested.clone();
        self.stops.spawn(async move {
            requested.cancelled().await;
            info!(%component, "stopping component");
            match stop().await {
                Ok(()) => info!(%component, "component stopped"),
                Err(e) => error!(%component, error = %e, "component did not stop cleanly"),
            }
        });
    }

    /// Stop routines registered and not yet finished
    pub fn pending(&self) -> usize {
        self.stops.len()
    }

    /// Ask every registered component to stop
    pub fn shutdown(&self) {
        self.requested.cancel();
    }

    /// Whether [`shutdown`][ShutdownManager::shutdown] has been requested
    pub fn is_shutdown(&self) -> bool {
        self.requested.is_cancelled()
    }

    /// Wait for every stop routine to finish, then cancel the agent token
    ///
    /// Only returns after [`shutdown`][ShutdownManager::shutdown] has been called.
    pub async fn join(&self) {
        self.stops.close();
        self.stops.wait().await;
        self.agent_shutdown.cancel();
    }
}
