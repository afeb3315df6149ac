use std::{sync::Weak, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Interval, MissedTickBehavior},
};
use tracing::instrument;

use crate::document_conventions::ReadBalanceBehavior;

use super::{request_executor_state::RequestExecutorState, RequestExecutorMessage};

/// Runs the periodic maintenance of a request executor: refreshing the topology and starting
/// new speed tests.
///
/// The actor only holds a weak reference to the executor state, so it stops once every
/// [`RequestExecutor`](super::RequestExecutor) handle is gone.
pub(crate) struct RequestExecutorActor {
    state: Weak<RequestExecutorState>,
    receiver: mpsc::Receiver<RequestExecutorMessage>,
    topology_refresh_interval: Duration,
    speed_test_interval: Duration,
    /// Armed once the first topology update is done
    topology_update_timer: Option<Interval>,
}

impl RequestExecutorActor {
    pub(crate) fn new(
        state: Weak<RequestExecutorState>,
        receiver: mpsc::Receiver<RequestExecutorMessage>,
        topology_refresh_interval: Duration,
        speed_test_interval: Duration,
    ) -> Self {
        Self {
            state,
            receiver,
            topology_refresh_interval,
            speed_test_interval,
            topology_update_timer: None,
        }
    }

    fn handle_message(&mut self, msg: RequestExecutorMessage) {
        match msg {
            RequestExecutorMessage::StartTopologyUpdates => {
                if self.topology_update_timer.is_some() {
                    return;
                }

                tracing::debug!(
                    "Refreshing the topology every {:?}",
                    self.topology_refresh_interval
                );
                self.topology_update_timer = Some(delayed_interval(self.topology_refresh_interval));
            }
        }
    }
}

/// An interval whose first tick is one `period` from now.
fn delayed_interval(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[instrument(level = "debug", name = "Running Request Executor Actor", skip(actor))]
pub(crate) async fn run_request_executor_actor(mut actor: RequestExecutorActor) {
    let mut speed_test_timer = delayed_interval(actor.speed_test_interval);
    loop {
        tokio::select! {
            _ = tick(&mut actor.topology_update_timer) => {
                let Some(state) = actor.state.upgrade() else { break };
                if state.is_disposed() {
                    break;
                }
                tracing::debug!("Updating topology via timer.");
                state.update_topology_callback().await;
            },
            _ = speed_test_timer.tick() => {
                let Some(state) = actor.state.upgrade() else { break };
                if state.is_disposed() {
                    break;
                }
                if state.read_balance_behavior() == ReadBalanceBehavior::FastestNode {
                    tracing::debug!("Starting a new speed test via timer.");
                    state.node_selector.schedule_speed_test();
                }
            },
            opt_msg = actor.receiver.recv() => {
                let msg = match opt_msg {
                    Some(msg) => msg,
                    None => break,
                };
                actor.handle_message(msg);
            }
        }
    }
    tracing::debug!("Request executor actor stopped");
}
