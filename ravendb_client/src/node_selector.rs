//! Decides which node of the current topology should serve a request.
//!
//! The selector keeps its whole state (topology, per-node failure counters and speed test
//! results) in one immutable [`NodeSelectorState`] snapshot. A topology update builds a new
//! snapshot and swaps it in, so concurrent readers never see a half-updated node list and
//! counters can never be applied to a node list they were not created for.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::{ArcSwap, Guard};

use crate::{
    document_conventions::ReadBalanceBehavior, raven_command::RavenCommand,
    server_node::ServerNode, topology::Topology,
};

/// Identifies the session a request belongs to. Used to pin round-robin reads.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionInfo {
    pub session_id: i32,
}

impl SessionInfo {
    pub fn new(session_id: i32) -> Self {
        Self { session_id }
    }
}

/// The node picked for a request together with the topology snapshot it was picked from.
#[derive(Clone, Debug)]
pub struct NodeSelection {
    pub index: usize,
    pub node: ServerNode,
    topology: Arc<Topology>,
}

impl NodeSelection {
    pub(crate) fn new(index: usize, topology: Arc<Topology>) -> Self {
        Self {
            index,
            node: topology.nodes[index].clone(),
            topology,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }
}

const NO_FASTEST_NODE: usize = usize::MAX;

#[derive(Debug)]
struct NodeSelectorState {
    topology: Arc<Topology>,
    /// Counts the failures of each node since it was last known healthy
    failures: Vec<AtomicU32>,
    /// Index of the node that won the last speed test
    fastest: AtomicUsize,
    speed_test_mode: AtomicBool,
}

impl NodeSelectorState {
    fn new(topology: Arc<Topology>, speed_test_mode: bool) -> Self {
        let failures = topology.nodes.iter().map(|_| AtomicU32::new(0)).collect();
        Self {
            topology,
            failures,
            fastest: AtomicUsize::new(NO_FASTEST_NODE),
            speed_test_mode: AtomicBool::new(speed_test_mode),
        }
    }

    fn is_healthy(&self, index: usize) -> bool {
        self.failures[index].load(Ordering::Acquire) == 0
    }

    fn preferred(&self) -> Option<NodeSelection> {
        if self.topology.is_empty() {
            return None;
        }

        let index = (0..self.failures.len())
            .find(|index| self.is_healthy(*index))
            // Everyone has faulted, fall back to the first node and let failover sort it out.
            .unwrap_or(0);

        Some(NodeSelection::new(index, self.topology.clone()))
    }

    /// Whether `selection` still points at the same node in this state's topology.
    fn matches_shape(&self, selection: &NodeSelection) -> bool {
        self.topology
            .nodes
            .get(selection.index)
            .map(|node| *node == selection.node)
            .unwrap_or(false)
    }
}

#[derive(Debug)]
pub struct NodeSelector {
    state: ArcSwap<NodeSelectorState>,
}

impl NodeSelector {
    pub fn new(topology: Topology) -> Self {
        Self {
            state: ArcSwap::from_pointee(NodeSelectorState::new(Arc::new(topology), false)),
        }
    }

    /// Returns the current topology snapshot.
    pub fn topology(&self) -> Arc<Topology> {
        self.state.load().topology.clone()
    }

    /// Picks the node that should serve `command`.
    ///
    /// Writes, and reads when read balancing is off, go to the preferred node. Round robin pins
    /// a session to one node, and fastest-node mode uses the last speed test winner.
    pub fn choose_node<C: RavenCommand>(
        &self,
        command: &C,
        read_balance_behavior: ReadBalanceBehavior,
        session_info: Option<&SessionInfo>,
    ) -> Option<NodeSelection> {
        if !command.is_read_request() {
            return self.preferred_node();
        }

        match read_balance_behavior {
            ReadBalanceBehavior::None => self.preferred_node(),
            ReadBalanceBehavior::RoundRobin => {
                self.node_by_session_id(session_info.map(|s| s.session_id).unwrap_or(0))
            }
            ReadBalanceBehavior::FastestNode => self.fastest_node(),
        }
    }

    /// Returns the first node that has not failed, or the first node if every node has.
    pub fn preferred_node(&self) -> Option<NodeSelection> {
        self.state.load().preferred()
    }

    /// Returns the node a session is pinned to, unless it is currently failing.
    pub fn node_by_session_id(&self, session_id: i32) -> Option<NodeSelection> {
        let state = self.state.load();
        if state.topology.is_empty() {
            return None;
        }

        let index = session_id.rem_euclid(state.topology.len() as i32) as usize;
        if !state.is_healthy(index) {
            return state.preferred();
        }

        Some(NodeSelection::new(index, state.topology.clone()))
    }

    /// Returns the last speed test winner.
    ///
    /// With no winner yet, or a winner that has since failed, a new speed test is started and
    /// the preferred node is used in the meantime.
    pub fn fastest_node(&self) -> Option<NodeSelection> {
        let state = self.state.load();
        let fastest = state.fastest.load(Ordering::Acquire);
        if fastest != NO_FASTEST_NODE && fastest < state.failures.len() && state.is_healthy(fastest)
        {
            return Some(NodeSelection::new(fastest, state.topology.clone()));
        }

        state.speed_test_mode.store(true, Ordering::Release);
        state.preferred()
    }

    /// Replaces the topology when `topology` is newer than the current one, or when `force_update`
    /// is set. Returns whether a replacement happened.
    pub fn on_topology_received(&self, topology: Topology, force_update: bool) -> bool {
        let topology = Arc::new(topology);
        let mut current = self.state.load_full();
        loop {
            if topology.etag <= current.topology.etag && !force_update {
                return false;
            }

            let speed_test_mode = current.speed_test_mode.load(Ordering::Acquire);
            let replacement = Arc::new(NodeSelectorState::new(topology.clone(), speed_test_mode));
            let previous = self.state.compare_and_swap(&current, replacement);
            if Arc::ptr_eq(&*previous, &current) {
                return true;
            }
            current = Guard::into_inner(previous);
        }
    }

    /// Demotes the selected node so the next preferred node is a different one.
    ///
    /// Ignored when the topology was swapped after `selection` was made.
    pub fn on_failed_request(&self, selection: &NodeSelection) {
        let state = self.state.load();
        if !Arc::ptr_eq(&state.topology, &selection.topology) {
            return;
        }

        state.failures[selection.index].fetch_add(1, Ordering::AcqRel);
    }

    /// Puts a recovered node back into the preferred rotation.
    pub fn restore_node_index(&self, selection: &NodeSelection) {
        let state = self.state.load();
        if !state.matches_shape(selection) {
            return;
        }

        state.failures[selection.index].store(0, Ordering::Release);
    }

    /// Whether `node` is still at `index` in the current topology.
    pub fn node_still_at(&self, selection: &NodeSelection) -> bool {
        self.state.load().matches_shape(selection)
    }

    pub fn schedule_speed_test(&self) {
        self.state
            .load()
            .speed_test_mode
            .store(true, Ordering::Release);
    }

    pub fn in_speed_test_phase(&self) -> bool {
        self.state.load().speed_test_mode.load(Ordering::Acquire)
    }

    /// Records the winner of a speed test and leaves the racing phase.
    pub fn record_fastest(&self, selection: &NodeSelection, latency: Duration) {
        let state = self.state.load();
        if !state.matches_shape(selection) {
            return;
        }

        state.fastest.store(selection.index, Ordering::Release);
        state.speed_test_mode.store(false, Ordering::Release);
        tracing::debug!(
            "Node `{}` recorded as the fastest node, answered in {:?}",
            selection.node.url,
            latency
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use url::Url;

    use crate::{
        commands::GetDocumentsCommand, document_conventions::ReadBalanceBehavior,
        raven_command::RavenCommand, server_node::ServerNode, topology::Topology,
    };

    use super::{NodeSelector, SessionInfo};

    struct WriteCommand;

    impl RavenCommand for WriteCommand {
        type Result = ();

        fn create_request(
            &self,
            client: &reqwest::Client,
            node: &ServerNode,
        ) -> anyhow::Result<reqwest::Request> {
            Ok(client.put(node.url.clone()).build()?)
        }

        fn parse_response(&self, _body: &[u8], _from_cache: bool) -> anyhow::Result<()> {
            Ok(())
        }

        fn is_read_request(&self) -> bool {
            false
        }
    }

    fn topology(etag: i64, hosts: &[&str]) -> Topology {
        let nodes = hosts
            .iter()
            .map(|host| {
                ServerNode::new(
                    Url::parse(&format!("http://{}:8080", host)).unwrap(),
                    "db".to_string(),
                )
                .with_cluster_tag(&host.to_uppercase())
            })
            .collect();
        Topology::new(etag, nodes)
    }

    #[test]
    fn topology_version_never_goes_backwards() {
        let selector = NodeSelector::new(topology(5, &["a"]));

        assert!(!selector.on_topology_received(topology(4, &["b"]), false));
        assert!(!selector.on_topology_received(topology(5, &["b"]), false));
        assert_eq!(selector.topology().etag, 5);
        assert_eq!(selector.topology().nodes[0].cluster_tag, "A");

        assert!(selector.on_topology_received(topology(6, &["b"]), false));
        assert_eq!(selector.topology().etag, 6);

        assert!(selector.on_topology_received(topology(3, &["c"]), true));
        assert_eq!(selector.topology().nodes[0].cluster_tag, "C");
    }

    #[test]
    fn round_robin_pins_session_to_index_modulo_node_count() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        let command = GetDocumentsCommand::by_id("db", "users/1");

        let selection = selector
            .choose_node(
                &command,
                ReadBalanceBehavior::RoundRobin,
                Some(&SessionInfo::new(3)),
            )
            .unwrap();

        assert_eq!(selection.index, 1);
        assert_eq!(selection.node.cluster_tag, "B");
    }

    #[test]
    fn round_robin_falls_back_to_preferred_when_pinned_node_failed() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        let pinned = selector.node_by_session_id(1).unwrap();
        selector.on_failed_request(&pinned);

        let selection = selector.node_by_session_id(1).unwrap();

        assert_eq!(selection.index, 0);
    }

    #[test]
    fn failed_request_demotes_preferred_node_and_restore_brings_it_back() {
        let selector = NodeSelector::new(topology(1, &["a", "b", "c"]));
        let first = selector.preferred_node().unwrap();

        selector.on_failed_request(&first);
        let second = selector.preferred_node().unwrap();
        assert_eq!(second.index, 1);

        selector.restore_node_index(&first);
        assert_eq!(selector.preferred_node().unwrap().index, 0);
    }

    #[test]
    fn every_node_failed_falls_back_to_first_node() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        for _ in 0..2 {
            let selection = selector.preferred_node().unwrap();
            selector.on_failed_request(&selection);
        }

        assert_eq!(selector.preferred_node().unwrap().index, 0);
    }

    #[test]
    fn selection_from_old_topology_is_not_applied_to_new_one() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        let stale = selector.preferred_node().unwrap();

        selector.on_topology_received(topology(2, &["a", "b"]), false);
        selector.on_failed_request(&stale);

        assert_eq!(selector.preferred_node().unwrap().index, 0);
    }

    #[test]
    fn restore_is_ignored_when_node_moved() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        let b = selector.node_by_session_id(1).unwrap();
        selector.on_failed_request(&b);

        selector.on_topology_received(topology(2, &["b", "a"]), false);
        let new_b = selector.node_by_session_id(0).unwrap();
        selector.on_failed_request(&new_b);
        selector.restore_node_index(&b);

        assert_eq!(selector.preferred_node().unwrap().node.cluster_tag, "A");
    }

    #[test]
    fn writes_ignore_read_balancing() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        let command = WriteCommand;

        let selection = selector
            .choose_node(
                &command,
                ReadBalanceBehavior::RoundRobin,
                Some(&SessionInfo::new(1)),
            )
            .unwrap();

        assert_eq!(selection.index, 0);
    }

    #[test]
    fn fastest_node_starts_speed_test_until_winner_recorded() {
        let selector = NodeSelector::new(topology(1, &["a", "b"]));
        assert!(!selector.in_speed_test_phase());

        let selection = selector.fastest_node().unwrap();
        assert_eq!(selection.index, 0);
        assert!(selector.in_speed_test_phase());

        let b = selector.node_by_session_id(1).unwrap();
        selector.record_fastest(&b, Duration::from_millis(3));

        assert!(!selector.in_speed_test_phase());
        assert_eq!(selector.fastest_node().unwrap().index, 1);
    }

    #[test]
    fn empty_topology_selects_nothing() {
        let selector = NodeSelector::new(Topology::default());

        assert!(selector.preferred_node().is_none());
        assert!(selector.node_by_session_id(3).is_none());
    }
}
