use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use tokio::sync::{broadcast, mpsc, Semaphore, SemaphorePermit};
use tracing::instrument;
use url::Url;

use crate::{
    commands::{GetClientConfigurationCommand, GetDatabaseTopologyCommand},
    document_conventions::{DocumentConventions, ReadBalanceBehavior},
    events::RequestEvent,
    http_cache::HttpCache,
    node_selector::{NodeSelection, NodeSelector, SessionInfo},
    raven_command::RavenCommand,
    server_node::ServerNode,
    topology::Topology,
};

use super::{
    node_status::NodeStatus,
    request_executor_actor::{run_request_executor_actor, RequestExecutorActor},
    request_executor_dispatch::Attempt,
    ExecuteOptions, RequestExecutorError, RequestExecutorMessage, FIRST_TOPOLOGY_UPDATE_TIMEOUT,
    GLOBAL_HTTP_CLIENT_TIMEOUT,
};

/// The first topology update, shared by every request that arrives while it runs.
pub(crate) type FirstTopologyUpdate =
    Shared<BoxFuture<'static, Result<(), Arc<RequestExecutorError>>>>;

/// Everything a request executor shares between its handles, its background actor and its
/// health checks.
pub(crate) struct RequestExecutorState {
    pub(crate) database: String,
    /// Reqwest client maintains an internal connection pool, shared by every request.
    pub(crate) client: reqwest::Client,
    conventions: RwLock<DocumentConventions>,
    pub(crate) cache: HttpCache,
    pub(crate) node_selector: NodeSelector,
    topology_etag: AtomicI64,
    client_configuration_etag: AtomicI64,
    pub(crate) disable_topology_updates: bool,
    disable_client_configuration_updates: AtomicBool,
    update_topology_semaphore: Semaphore,
    update_client_configuration_semaphore: Semaphore,
    pub(crate) failed_nodes_timers: Mutex<HashMap<ServerNode, NodeStatus>>,
    first_topology_update: Mutex<Option<FirstTopologyUpdate>>,
    /// Seed urls to retry the first topology update with after it failed.
    last_known_urls: Mutex<Vec<Url>>,
    last_returned_response: Mutex<Instant>,
    default_timeout: RwLock<Option<Duration>>,
    pub(crate) number_of_server_requests: AtomicU64,
    actor_sender: mpsc::Sender<RequestExecutorMessage>,
    events: broadcast::Sender<RequestEvent>,
    disposed: AtomicBool,
}

impl RequestExecutorState {
    /// Creates the shared state and starts its background actor.
    pub(crate) fn new(
        database: &str,
        conventions: DocumentConventions,
        client: reqwest::Client,
        topology: Topology,
        topology_etag: i64,
        disable_topology_updates: bool,
        disable_client_configuration_updates: bool,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(8);
        let (events, _) = broadcast::channel(64);
        let topology_refresh_interval = conventions.topology_refresh_interval();
        let speed_test_interval = conventions.speed_test_interval();

        let state = Arc::new(Self {
            database: database.to_string(),
            client,
            cache: HttpCache::new(conventions.max_http_cache_size()),
            conventions: RwLock::new(conventions),
            node_selector: NodeSelector::new(topology),
            topology_etag: AtomicI64::new(topology_etag),
            client_configuration_etag: AtomicI64::new(0),
            disable_topology_updates,
            disable_client_configuration_updates: AtomicBool::new(
                disable_client_configuration_updates,
            ),
            update_topology_semaphore: Semaphore::new(1),
            update_client_configuration_semaphore: Semaphore::new(1),
            failed_nodes_timers: Mutex::new(HashMap::new()),
            first_topology_update: Mutex::new(None),
            last_known_urls: Mutex::new(Vec::new()),
            last_returned_response: Mutex::new(Instant::now()),
            default_timeout: RwLock::new(None),
            number_of_server_requests: AtomicU64::new(0),
            actor_sender: sender,
            events,
            disposed: AtomicBool::new(false),
        });

        let actor = RequestExecutorActor::new(
            Arc::downgrade(&state),
            receiver,
            topology_refresh_interval,
            speed_test_interval,
        );
        tokio::spawn(run_request_executor_actor(actor));

        state
    }

    pub(crate) fn conventions(&self) -> RwLockReadGuard<'_, DocumentConventions> {
        self.conventions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn conventions_mut(&self) -> RwLockWriteGuard<'_, DocumentConventions> {
        self.conventions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn read_balance_behavior(&self) -> ReadBalanceBehavior {
        self.conventions().read_balance_behavior()
    }

    pub(crate) fn topology_etag(&self) -> i64 {
        self.topology_etag.load(Ordering::Acquire)
    }

    pub(crate) fn client_configuration_etag(&self) -> i64 {
        self.client_configuration_etag.load(Ordering::Acquire)
    }

    pub(crate) fn client_configuration_updates_disabled(&self) -> bool {
        self.disable_client_configuration_updates
            .load(Ordering::Acquire)
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        *self
            .default_timeout
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_default_timeout(
        &self,
        timeout: Option<Duration>,
    ) -> Result<(), RequestExecutorError> {
        if let Some(requested) = timeout {
            if requested > GLOBAL_HTTP_CLIENT_TIMEOUT {
                return Err(RequestExecutorError::TimeoutTooLarge {
                    requested,
                    maximum: GLOBAL_HTTP_CLIENT_TIMEOUT,
                });
            }
        }

        *self
            .default_timeout
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = timeout;
        Ok(())
    }

    pub(crate) fn mark_response_returned(&self) {
        *lock(&self.last_returned_response) = Instant::now();
    }

    pub(crate) fn emit(&self, event: RequestEvent) {
        // Nobody listening is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    pub(crate) fn choose_node_for_request<C: RavenCommand>(
        &self,
        command: &C,
        session_info: Option<&SessionInfo>,
    ) -> Result<NodeSelection, RequestExecutorError> {
        self.node_selector
            .choose_node(command, self.read_balance_behavior(), session_info)
            .ok_or(RequestExecutorError::EmptyTopology)
    }

    /// Executes `command` against the best node, failing over to the others when needed.
    pub(crate) async fn execute<C: RavenCommand>(
        self: &Arc<Self>,
        command: &C,
        options: &ExecuteOptions,
    ) -> Result<Option<C::Result>, RequestExecutorError> {
        if self.is_disposed() {
            return Err(RequestExecutorError::Disposed);
        }

        self.wait_for_first_topology_update().await?;

        let selection = self.choose_node_for_request(command, options.session_info.as_ref())?;
        self.execute_on_node(
            selection.node.clone(),
            Some(selection),
            command,
            Attempt::retrying(),
            options,
        )
        .await
    }

    /// Starts the first topology update over `initial_urls` and registers it as the one every
    /// request waits for.
    pub(crate) fn start_first_topology_update(self: &Arc<Self>, initial_urls: Vec<Url>) {
        let update = self.first_topology_update_future(initial_urls);
        *lock(&self.first_topology_update) = Some(update);
    }

    fn first_topology_update_future(self: &Arc<Self>, initial_urls: Vec<Url>) -> FirstTopologyUpdate {
        let state = Arc::downgrade(self);
        let update = async move {
            let state = state
                .upgrade()
                .ok_or_else(|| Arc::new(RequestExecutorError::Disposed))?;
            state
                .first_topology_update(initial_urls)
                .await
                .map_err(Arc::new)
        }
        .boxed()
        .shared();

        // Drive the update even before any request waits on it.
        tokio::spawn(update.clone().map(|_| ()));
        update
    }

    /// Waits until the first topology update has finished.
    ///
    /// Concurrent callers all wait on the same update. When it failed, it is forgotten so the
    /// next call starts a new one from the last known urls.
    pub(crate) async fn wait_for_first_topology_update(
        self: &Arc<Self>,
    ) -> Result<(), RequestExecutorError> {
        if self.disable_topology_updates {
            return Ok(());
        }

        let update = {
            let mut current = lock(&self.first_topology_update);
            match current.as_ref() {
                Some(update) => update.clone(),
                None => {
                    let urls = lock(&self.last_known_urls).clone();
                    if urls.is_empty() {
                        return Err(anyhow::anyhow!(
                            "No known topology and no previously known one, cannot proceed"
                        )
                        .into());
                    }
                    let update = self.first_topology_update_future(urls);
                    *current = Some(update.clone());
                    update
                }
            }
        };

        match update.clone().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut current = lock(&self.first_topology_update);
                if current
                    .as_ref()
                    .map(|registered| registered.ptr_eq(&update))
                    .unwrap_or(false)
                {
                    *current = None;
                }
                Err(RequestExecutorError::FirstTopologyUpdateFailed(e))
            }
        }
    }

    #[instrument(level = "debug", skip(self))]
    async fn first_topology_update(
        self: &Arc<Self>,
        initial_urls: Vec<Url>,
    ) -> Result<(), RequestExecutorError> {
        let mut server_errors = Vec::new();

        for url in &initial_urls {
            let server_node = ServerNode::new(url.clone(), self.database.clone());
            match self.update_topology(server_node, None, false).await {
                Ok(_) => {
                    // Yay, the topology is updated, return early
                    tracing::info!("Initial topology update complete");
                    self.initialize_update_topology_timer();
                    return Ok(());
                }
                Err(e) => {
                    tracing::info!("Couldn't get the topology from `{}`. Caused by: {}", url, e);
                    server_errors.push((url.clone(), e));
                }
            }
        }

        // None of the provided urls gave us a topology. Keep whatever topology the selector
        // already has, or make one from the seed urls and hope they are actually listening.
        if self.node_selector.topology().is_empty() {
            let nodes = initial_urls
                .iter()
                .map(|url| ServerNode::new(url.clone(), self.database.clone()).with_cluster_tag("!"))
                .collect::<Vec<_>>();
            self.node_selector
                .on_topology_received(Topology::new(self.topology_etag(), nodes), true);
        }

        if initial_urls.is_empty() {
            return Err(anyhow::anyhow!("No urls were given to retrieve the topology from").into());
        }

        let details = server_errors
            .iter()
            .map(|(url, e)| format!("{} -> {}", url, e))
            .collect::<Vec<_>>()
            .join(", ");
        tracing::warn!(
            "Failed to retrieve database topology from all known nodes, using the given urls instead. {}",
            details
        );

        *lock(&self.last_known_urls) = initial_urls;
        self.initialize_update_topology_timer();
        Ok(())
    }

    fn initialize_update_topology_timer(&self) {
        if let Err(e) = self
            .actor_sender
            .try_send(RequestExecutorMessage::StartTopologyUpdates)
        {
            tracing::error!(
                "Could not send internal message to start topology updates. Caused by: {}",
                e
            );
        }
    }

    /// Fetches the topology from `node` and installs it when it is newer, or when
    /// `force_update` is set.
    ///
    /// Only one update runs at a time. `wait` bounds how long to wait for an update already in
    /// flight; `None` waits as long as it takes. Returns `false` when the update was skipped.
    pub(crate) fn update_topology(
        self: &Arc<Self>,
        node: ServerNode,
        wait: Option<Duration>,
        force_update: bool,
    ) -> BoxFuture<'static, Result<bool, RequestExecutorError>> {
        let state = self.clone();
        async move {
            if state.is_disposed() {
                return Ok(false);
            }

            let Some(_permit) = state.acquire_topology_update(wait).await? else {
                tracing::debug!(
                    "Topology update already running. Skipping to avoid duplication of effort."
                );
                return Ok(false);
            };

            if state.is_disposed() {
                return Ok(false);
            }

            let command = GetDatabaseTopologyCommand::new(&state.database)
                .with_timeout(FIRST_TOPOLOGY_UPDATE_TIMEOUT);
            let topology = state
                .execute_on_node(
                    node.clone(),
                    None,
                    &command,
                    Attempt::no_retry(),
                    &ExecuteOptions::default(),
                )
                .await?
                .with_context(|| format!("`{}` has no topology for `{}`", node.url, state.database))?;

            let etag = topology.etag;
            if state.node_selector.on_topology_received(topology, force_update) {
                tracing::debug!("Topology updated to etag {}", etag);
                state.dispose_all_failed_nodes_timers();
                if state.read_balance_behavior() == ReadBalanceBehavior::FastestNode {
                    state.node_selector.schedule_speed_test();
                }
                state.emit(RequestEvent::TopologyUpdated { etag });
            }

            state
                .topology_etag
                .store(state.node_selector.topology().etag, Ordering::Release);

            Ok(true)
        }
        .boxed()
    }

    async fn acquire_topology_update(
        &self,
        wait: Option<Duration>,
    ) -> Result<Option<SemaphorePermit<'_>>, RequestExecutorError> {
        let acquire = self.update_topology_semaphore.acquire();
        let permit = match wait {
            None => acquire.await,
            Some(wait) => match tokio::time::timeout(wait, acquire).await {
                Ok(permit) => permit,
                Err(_) => return Ok(None),
            },
        };

        let permit = permit.context("Topology update semaphore was closed")?;
        Ok(Some(permit))
    }

    /// Fetches the client configuration the server holds for this database and applies it.
    /// Skipped when another configuration update is in flight.
    pub(crate) fn update_client_configuration(
        self: &Arc<Self>,
    ) -> BoxFuture<'static, Result<(), RequestExecutorError>> {
        let state = self.clone();
        async move {
            if state.is_disposed() {
                return Ok(());
            }

            let Ok(_permit) = state.update_client_configuration_semaphore.try_acquire() else {
                tracing::debug!("Client configuration update already running.");
                return Ok(());
            };

            let previous = state
                .disable_client_configuration_updates
                .swap(true, Ordering::AcqRel);
            let result = state.fetch_client_configuration().await;
            state
                .disable_client_configuration_updates
                .store(previous, Ordering::Release);

            result
        }
        .boxed()
    }

    async fn fetch_client_configuration(self: &Arc<Self>) -> Result<(), RequestExecutorError> {
        let command = GetClientConfigurationCommand::new(&self.database);
        let selection = self.choose_node_for_request(&command, None)?;
        // Runs while a topology update may hold the permit, so a 410 here must not refresh it.
        let result = self
            .execute_on_node(
                selection.node.clone(),
                Some(selection),
                &command,
                Attempt::no_retry(),
                &ExecuteOptions::default(),
            )
            .await?;

        let Some(result) = result else {
            return Ok(());
        };

        if let Some(configuration) = &result.configuration {
            self.conventions_mut().update_from(configuration);
        }
        self.client_configuration_etag
            .store(result.etag, Ordering::Release);
        tracing::debug!("Client configuration updated to etag {}", result.etag);

        Ok(())
    }

    /// Timer driven refresh. Skipped while the client keeps getting responses, since the
    /// server would have told it about topology changes.
    pub(crate) async fn update_topology_callback(self: &Arc<Self>) {
        let interval = self.conventions().topology_refresh_interval();
        if lock(&self.last_returned_response).elapsed() <= interval {
            return;
        }

        let Some(selection) = self.node_selector.preferred_node() else {
            tracing::info!("Couldn't get preferred node topology from the update topology timer");
            return;
        };

        if let Err(e) = self
            .update_topology(selection.node, Some(Duration::ZERO), false)
            .await
        {
            tracing::info!(
                "Couldn't update topology from the update topology timer. Caused by: {}",
                e
            );
        }
    }

    pub(crate) fn dispose_all_failed_nodes_timers(&self) {
        // Dropping a status cancels its timer.
        lock(&self.failed_nodes_timers).clear();
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        self.cache.clear();
        self.dispose_all_failed_nodes_timers();
        tracing::debug!("Request executor for `{}` disposed", self.database);
    }

    pub(crate) fn downgrade(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }
}

/// Locks `mutex`, ignoring poisoning. Every critical section in the executor leaves its data
/// consistent, so a panic elsewhere doesn't invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
