use std::{sync::Arc, time::Duration};

use tokio::sync::broadcast;
use tracing::instrument;
use url::Url;

use crate::{
    document_conventions::DocumentConventions,
    events::RequestEvent,
    http_cache::HttpCache,
    node_selector::NodeSelection,
    raven_command::RavenCommand,
    server_node::ServerNode,
    topology::Topology,
};

use super::{
    request_executor_dispatch::Attempt, request_executor_state::RequestExecutorState,
    ExecuteOptions, RequestExecutorError,
};

/// Handle to the request executor of one database. Cloning it is cheap and every clone talks to
/// the same executor, topology and cache.
///
/// Background work (topology refresh, health checks) stops once the last handle is dropped or
/// [`dispose`](RequestExecutor::dispose) is called.
#[derive(Clone)]
pub struct RequestExecutor {
    state: Arc<RequestExecutorState>,
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("database", &self.state.database)
            .field("topology_etag", &self.state.topology_etag())
            .finish()
    }
}

impl RequestExecutor {
    /// Creates an executor for a clustered database and starts discovering its topology from
    /// `initial_urls`.
    ///
    /// `client` is the connection pool every request goes through; share one between all the
    /// executors of an application.
    #[instrument(level = "debug", skip(conventions, client))]
    pub fn create(
        initial_urls: Vec<Url>,
        database: &str,
        conventions: DocumentConventions,
        client: reqwest::Client,
    ) -> Self {
        let state = RequestExecutorState::new(
            database,
            conventions,
            client,
            Topology::default(),
            Topology::UNSET_ETAG,
            false,
            false,
        );
        state.start_first_topology_update(initial_urls);

        Self { state }
    }

    /// Creates an executor that only ever talks to `url` and never asks the server for anything
    /// but the requests it is given.
    pub fn create_for_single_node(
        url: Url,
        database: &str,
        conventions: DocumentConventions,
        client: reqwest::Client,
    ) -> Self {
        Self::single_node(url, database, conventions, client, true)
    }

    /// Creates an executor that only ever talks to `url`, but still follows the client
    /// configuration the server holds for the database.
    pub fn create_for_single_node_with_configuration_updates(
        url: Url,
        database: &str,
        conventions: DocumentConventions,
        client: reqwest::Client,
    ) -> Self {
        Self::single_node(url, database, conventions, client, false)
    }

    fn single_node(
        url: Url,
        database: &str,
        conventions: DocumentConventions,
        client: reqwest::Client,
        disable_client_configuration_updates: bool,
    ) -> Self {
        let node = ServerNode::new(url, database.to_string());
        let topology = Topology::new(Topology::NO_UPDATES_ETAG, vec![node]);
        let state = RequestExecutorState::new(
            database,
            conventions,
            client,
            topology,
            Topology::NO_UPDATES_ETAG,
            true,
            disable_client_configuration_updates,
        );

        Self { state }
    }

    /// Executes `command` on the node the read balance behavior picks, failing over to other
    /// nodes when it is down.
    ///
    /// Returns `Ok(None)` when the server has nothing for the command: a 404, or a command that
    /// produces no result.
    #[instrument(level = "debug", skip(self, command), fields(database = %self.state.database))]
    pub async fn execute<C: RavenCommand>(
        &self,
        command: &C,
    ) -> Result<Option<C::Result>, RequestExecutorError> {
        self.state.execute(command, &ExecuteOptions::default()).await
    }

    /// Like [`execute`](RequestExecutor::execute), with a session to pin reads to and opt-in
    /// aggressive caching.
    #[instrument(level = "debug", skip(self, command), fields(database = %self.state.database))]
    pub async fn execute_with<C: RavenCommand>(
        &self,
        command: &C,
        options: ExecuteOptions,
    ) -> Result<Option<C::Result>, RequestExecutorError> {
        self.state.execute(command, &options).await
    }

    /// Executes `command` on `node` only, without failover.
    #[instrument(level = "debug", skip(self, command))]
    pub async fn execute_on_node<C: RavenCommand>(
        &self,
        node: &ServerNode,
        command: &C,
    ) -> Result<Option<C::Result>, RequestExecutorError> {
        if self.state.is_disposed() {
            return Err(RequestExecutorError::Disposed);
        }

        self.state
            .execute_on_node(
                node.clone(),
                None,
                command,
                Attempt::no_retry(),
                &ExecuteOptions::default(),
            )
            .await
    }

    /// Fetches the topology from `node`, waiting for any update already in flight. Returns
    /// whether the update ran.
    pub async fn update_topology(
        &self,
        node: ServerNode,
        force_update: bool,
    ) -> Result<bool, RequestExecutorError> {
        if self.state.disable_topology_updates {
            return Ok(false);
        }

        self.state.update_topology(node, None, force_update).await
    }

    /// The node requests go to when nothing else decides, once the first topology update is
    /// done.
    pub async fn preferred_node(&self) -> Result<NodeSelection, RequestExecutorError> {
        self.state.wait_for_first_topology_update().await?;
        self.state
            .node_selector
            .preferred_node()
            .ok_or(RequestExecutorError::EmptyTopology)
    }

    /// Url of the preferred node, if there is a topology yet.
    pub fn url(&self) -> Option<Url> {
        self.state
            .node_selector
            .preferred_node()
            .map(|selection| selection.node.url)
    }

    pub fn topology(&self) -> Arc<Topology> {
        self.state.node_selector.topology()
    }

    pub fn topology_nodes(&self) -> Vec<ServerNode> {
        self.topology().nodes.clone()
    }

    pub fn topology_etag(&self) -> i64 {
        self.state.topology_etag()
    }

    pub fn client_configuration_etag(&self) -> i64 {
        self.state.client_configuration_etag()
    }

    pub fn database(&self) -> &str {
        &self.state.database
    }

    /// The conventions in effect, including what the server's client configuration changed.
    pub fn conventions(&self) -> DocumentConventions {
        self.state.conventions().clone()
    }

    pub fn cache(&self) -> &HttpCache {
        &self.state.cache
    }

    /// How many requests were sent to servers, including topology updates and health checks.
    pub fn number_of_server_requests(&self) -> u64 {
        self.state
            .number_of_server_requests
            .load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.state.default_timeout()
    }

    /// Sets the timeout for commands that don't carry their own.
    pub fn set_default_timeout(&self, timeout: Option<Duration>) -> Result<(), RequestExecutorError> {
        self.state.set_default_timeout(timeout)
    }

    pub fn in_speed_test_phase(&self) -> bool {
        self.state.node_selector.in_speed_test_phase()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.state.subscribe()
    }

    /// Stops background work and empties the cache. Every later request fails.
    pub fn dispose(&self) {
        self.state.dispose();
    }
}
