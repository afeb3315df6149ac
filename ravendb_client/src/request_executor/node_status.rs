use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    commands::GetStatisticsCommand, node_selector::NodeSelection, server_node::ServerNode,
    timer::Timer,
};

use super::{
    request_executor_dispatch::Attempt,
    request_executor_state::{lock, RequestExecutorState},
    ExecuteOptions, RequestExecutorError,
};

/// The delay between health probes of a failed node. Starts at 100ms and doubles after every
/// failed probe, up to 5 seconds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HealthCheckBackoff {
    period: Duration,
}

impl HealthCheckBackoff {
    pub const INITIAL_PERIOD: Duration = Duration::from_millis(100);
    pub const MAX_PERIOD: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self {
            period: Self::INITIAL_PERIOD,
        }
    }

    pub fn current(&self) -> Duration {
        self.period
    }

    /// Advances to, and returns, the delay before the next probe.
    pub fn next_period(&mut self) -> Duration {
        self.period = (self.period * 2).min(Self::MAX_PERIOD);
        self.period
    }
}

impl Default for HealthCheckBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// A failed node being probed until it recovers.
#[derive(Debug)]
pub(crate) struct NodeStatus {
    selection: NodeSelection,
    timer: Timer,
}

enum HealthCheckOutcome {
    Recovered,
    StillDown,
    Moved,
}

impl RequestExecutorState {
    /// Starts probing the node in `selection` in the background, unless it is being probed
    /// already.
    pub(crate) fn spawn_health_checks(self: &Arc<Self>, selection: &NodeSelection) {
        let mut failed_nodes = lock(&self.failed_nodes_timers);
        if failed_nodes.contains_key(&selection.node) {
            return;
        }

        tracing::debug!("Starting health checks for `{}`", selection.node.url);
        let timer = Timer::spawn(run_health_checks(self.downgrade(), selection.clone()));
        failed_nodes.insert(
            selection.node.clone(),
            NodeStatus {
                selection: selection.clone(),
                timer,
            },
        );
    }

    async fn check_node_status(self: &Arc<Self>, selection: &NodeSelection) -> HealthCheckOutcome {
        if !self.node_selector.node_still_at(selection) {
            self.remove_failed_node(&selection.node);
            return HealthCheckOutcome::Moved;
        }

        match self.perform_health_check(&selection.node).await {
            Ok(()) => {
                tracing::info!("`{}` is available again", selection.node.url);
                self.node_selector.restore_node_index(selection);
                self.remove_failed_node(&selection.node);
                HealthCheckOutcome::Recovered
            }
            Err(e) => {
                tracing::info!("`{}` is still down. Caused by: {}", selection.node.url, e);
                HealthCheckOutcome::StillDown
            }
        }
    }

    async fn perform_health_check(
        self: &Arc<Self>,
        node: &ServerNode,
    ) -> Result<(), RequestExecutorError> {
        let command = GetStatisticsCommand::health_check(&self.database);
        self.execute_on_node(
            node.clone(),
            None,
            &command,
            Attempt::no_retry(),
            &ExecuteOptions::default(),
        )
        .await
        .map(|_| ())
    }

    /// Forgets the status of `node` without cancelling its task, which is the one calling.
    fn remove_failed_node(&self, node: &ServerNode) {
        if let Some(status) = lock(&self.failed_nodes_timers).remove(node) {
            tracing::trace!("Health checks for `{}` done", status.selection.node.url);
            status.timer.disarm();
        }
    }
}

async fn run_health_checks(state: Weak<RequestExecutorState>, selection: NodeSelection) {
    let mut backoff = HealthCheckBackoff::new();
    let mut period = backoff.current();

    loop {
        tokio::time::sleep(period).await;

        let Some(state) = state.upgrade() else {
            return;
        };
        if state.is_disposed() {
            return;
        }

        match state.check_node_status(&selection).await {
            HealthCheckOutcome::StillDown => period = backoff.next_period(),
            HealthCheckOutcome::Recovered | HealthCheckOutcome::Moved => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::HealthCheckBackoff;

    #[test]
    fn backoff_doubles_up_to_five_seconds() {
        let mut backoff = HealthCheckBackoff::new();
        let mut periods = vec![backoff.current()];
        for _ in 0..7 {
            periods.push(backoff.next_period());
        }

        let expected = [100, 200, 400, 800, 1600, 3200, 5000, 5000]
            .into_iter()
            .map(Duration::from_millis)
            .collect::<Vec<_>>();
        assert_eq!(periods, expected);
    }
}
