//! Sending one command: choosing the cached copy, dispatching the request, classifying the
//! response and failing over to the next node when the chosen one is down.

use std::{
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant},
};

use anyhow::Context;
use bytes::Bytes;
use futures::{stream::FuturesUnordered, StreamExt};
use reqwest::{header::HeaderValue, Request, Response, StatusCode};

use crate::{
    document_conventions::ReadBalanceBehavior,
    events::RequestEvent,
    http_cache::ReleaseCacheItem,
    node_selector::NodeSelection,
    raven_command::{RavenCommand, ResponseType},
    ravendb_error::{ExceptionSchema, RavenDbError},
    server_node::ServerNode,
};

use super::{
    headers, request_executor_state::RequestExecutorState, ExecuteOptions, RequestExecutorError,
    CLIENT_VERSION, FAILOVER_TOPOLOGY_REFRESH_WAIT, GLOBAL_HTTP_CLIENT_TIMEOUT,
};

/// What a single dispatch may do when it goes wrong.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Attempt {
    /// Move on to the next node when the chosen one is down
    pub(crate) failover: bool,
    /// Refresh the topology and dispatch again when the server answers 410 Gone
    pub(crate) refresh_on_gone: bool,
    /// Send reads to every node at once while a speed test runs
    pub(crate) race: bool,
}

impl Attempt {
    pub(crate) fn retrying() -> Self {
        Self {
            failover: true,
            refresh_on_gone: true,
            race: true,
        }
    }

    pub(crate) fn no_retry() -> Self {
        Self {
            failover: false,
            refresh_on_gone: false,
            race: false,
        }
    }
}

/// The outcome of one dispatch.
enum Step<T> {
    Done(Option<T>),
    Retry {
        selection: NodeSelection,
        attempt: Attempt,
    },
}

/// Nodes that already failed during one `execute` call, with the reason each one failed.
#[derive(Default)]
struct FailedNodes {
    failures: Vec<(ServerNode, RequestExecutorError)>,
}

impl FailedNodes {
    fn push(&mut self, node: ServerNode, error: RequestExecutorError) {
        self.failures.push((node, error));
    }

    fn contains(&self, node: &ServerNode) -> bool {
        self.failures.iter().any(|(failed, _)| failed == node)
    }

    /// The error to hand back to the caller: the only failure as is, or a summary of all of
    /// them.
    fn into_error(self) -> RequestExecutorError {
        let mut failures = self.failures;
        if failures.len() == 1 {
            if let Some((_, error)) = failures.pop() {
                return error;
            }
        }

        let attempted = failures
            .iter()
            .map(|(node, error)| format!("{} -> {}", node.url, error))
            .collect::<Vec<_>>()
            .join(", ");
        RequestExecutorError::AllTopologyNodesDown(format!("Attempted nodes: {}", attempted))
    }
}

impl RequestExecutorState {
    /// Sends `command` to `node`, failing over to other nodes when `attempt` allows it and a
    /// `selection` says where `node` sits in the topology.
    pub(crate) async fn execute_on_node<C: RavenCommand>(
        self: &Arc<Self>,
        node: ServerNode,
        selection: Option<NodeSelection>,
        command: &C,
        attempt: Attempt,
        options: &ExecuteOptions,
    ) -> Result<Option<C::Result>, RequestExecutorError> {
        let mut failed_nodes = FailedNodes::default();
        let mut node = node;
        let mut selection = selection;
        let mut attempt = attempt;

        loop {
            let step = self
                .execute_once(
                    &node,
                    selection.as_ref(),
                    command,
                    attempt,
                    options,
                    &mut failed_nodes,
                )
                .await?;

            match step {
                Step::Done(result) => return Ok(result),
                Step::Retry {
                    selection: next,
                    attempt: next_attempt,
                } => {
                    tracing::debug!("Retrying request on `{}`", next.node.url);
                    node = next.node.clone();
                    selection = Some(next);
                    attempt = next_attempt;
                }
            }
        }
    }

    async fn execute_once<C: RavenCommand>(
        self: &Arc<Self>,
        chosen_node: &ServerNode,
        selection: Option<&NodeSelection>,
        command: &C,
        attempt: Attempt,
        options: &ExecuteOptions,
        failed_nodes: &mut FailedNodes,
    ) -> Result<Step<C::Result>, RequestExecutorError> {
        let request = command.create_request(&self.client, chosen_node)?;
        let url = request.url().to_string();

        let cached = is_cacheable(command).then(|| self.cache.get(&url));
        if let (Some(cached), Some(aggressive)) = (&cached, options.aggressive_cache) {
            if !cached.is_empty()
                && cached.age() < aggressive.duration
                && !cached.might_have_changed()
                && command.can_cache_aggressively()
            {
                tracing::trace!("Serving `{}` from the aggressive cache", url);
                return result_from_cache(command, cached).map(Step::Done);
            }
        }

        let change_vector = cached
            .as_ref()
            .and_then(|cached| cached.change_vector())
            .map(str::to_string);
        let timeout = self.request_timeout(command)?;

        let (response, responding_node, responding_selection) =
            if attempt.race && self.should_race_all_nodes(selection, command) {
                match self
                    .execute_on_all_to_figure_out_the_fastest(
                        command,
                        change_vector.as_deref(),
                        timeout,
                    )
                    .await
                {
                    Ok((winner, response)) => (response, winner.node.clone(), Some(winner)),
                    Err(e) => {
                        return self
                            .handle_server_down(chosen_node, selection, attempt, e, failed_nodes)
                            .await
                    }
                }
            } else {
                let request = self.prepare_request(request, change_vector.as_deref(), timeout)?;
                self.number_of_server_requests
                    .fetch_add(1, Ordering::AcqRel);
                self.emit(RequestEvent::BeforeRequest { url: url.clone() });

                match self.client.execute(request).await {
                    Ok(response) => (response, chosen_node.clone(), selection.cloned()),
                    Err(e) => {
                        let error = transport_error(&url, timeout, e);
                        return self
                            .handle_server_down(chosen_node, selection, attempt, error, failed_nodes)
                            .await;
                    }
                }
            };

        let refresh_topology = header_is_true(&response, headers::REFRESH_TOPOLOGY);
        let refresh_client_configuration =
            header_is_true(&response, headers::REFRESH_CLIENT_CONFIGURATION);

        let outcome = self
            .handle_response(
                command,
                &url,
                &responding_node,
                responding_selection.as_ref(),
                attempt,
                options,
                cached,
                response,
                failed_nodes,
            )
            .await;

        if refresh_topology || refresh_client_configuration {
            self.refresh_after_response(
                &responding_node,
                refresh_topology,
                refresh_client_configuration,
            )
            .await;
        }

        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_response<C: RavenCommand>(
        self: &Arc<Self>,
        command: &C,
        url: &str,
        node: &ServerNode,
        selection: Option<&NodeSelection>,
        attempt: Attempt,
        options: &ExecuteOptions,
        cached: Option<ReleaseCacheItem>,
        response: Response,
        failed_nodes: &mut FailedNodes,
    ) -> Result<Step<C::Result>, RequestExecutorError> {
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            drain(response).await;
            let cached = cached
                .filter(|cached| !cached.is_empty())
                .with_context(|| {
                    format!("`{}` answered 304 Not Modified but nothing is cached for it", url)
                })?;
            cached.not_modified();
            self.mark_response_returned();
            self.emit(RequestEvent::SucceedRequest {
                url: url.to_string(),
                status: status.as_u16(),
            });

            if command.response_type() == ResponseType::Object {
                return result_from_cache(command, &cached).map(Step::Done);
            }
            return Ok(Step::Done(None));
        }

        if status.is_client_error() || status.is_server_error() {
            // A stale lease must not keep the entry from being replaced or evicted.
            drop(cached);
            return self
                .handle_unsuccessful_response(
                    command,
                    url,
                    node,
                    selection,
                    attempt,
                    options,
                    response,
                    failed_nodes,
                )
                .await;
        }

        let change_vector = response
            .headers()
            .get(headers::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_matches('"').to_string());

        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => {
                let error = RequestExecutorError::RequestFailed {
                    url: url.to_string(),
                    source: e,
                };
                return self
                    .handle_server_down(node, selection, attempt, error, failed_nodes)
                    .await;
            }
        };

        self.mark_response_returned();
        self.emit(RequestEvent::SucceedRequest {
            url: url.to_string(),
            status: status.as_u16(),
        });

        if command.response_type() == ResponseType::Empty || body.is_empty() {
            return Ok(Step::Done(None));
        }

        if is_cacheable(command) {
            if let Some(change_vector) = change_vector {
                self.cache.store(url, &change_vector, body.clone());
            }
        }

        let result = command.parse_response(&body, false)?;
        Ok(Step::Done(Some(result)))
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_unsuccessful_response<C: RavenCommand>(
        self: &Arc<Self>,
        command: &C,
        url: &str,
        node: &ServerNode,
        selection: Option<&NodeSelection>,
        attempt: Attempt,
        options: &ExecuteOptions,
        response: Response,
        failed_nodes: &mut FailedNodes,
    ) -> Result<Step<C::Result>, RequestExecutorError> {
        let status = response.status();
        let database_missing = response
            .headers()
            .get(headers::DATABASE_MISSING)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.unwrap_or_default();

        // The database may be gone from this node only, so the header matters once nothing
        // else can be done about the response.
        let unrecoverable = |error: RequestExecutorError| -> RequestExecutorError {
            match &database_missing {
                Some(database) => RavenDbError::DatabaseDoesNotExist(database.clone()).into(),
                None => error,
            }
        };

        match status {
            StatusCode::NOT_FOUND => {
                if is_cacheable(command) {
                    self.cache.set_not_found(url);
                }
                self.mark_response_returned();
                self.emit(RequestEvent::SucceedRequest {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
                Ok(Step::Done(None))
            }
            StatusCode::FORBIDDEN => Err(RavenDbError::BadAuthorization(format!(
                "Forbidden access to {}@{}, {}",
                self.database, node.url, url
            ))
            .into()),
            StatusCode::CONFLICT => Err(RavenDbError::Conflict {
                url: url.to_string(),
                schema: ExceptionSchema::from_response_body(url, &body),
            }
            .into()),
            StatusCode::GONE => {
                if !attempt.refresh_on_gone {
                    return Err(unrecoverable(RavenDbError::Gone(url.to_string()).into()));
                }

                tracing::debug!("`{}` is gone, refreshing the topology", url);
                self.update_topology(node.clone(), None, true).await?;
                let next = self.choose_node_for_request(command, options.session_info.as_ref())?;
                Ok(Step::Retry {
                    selection: next,
                    attempt: Attempt::no_retry(),
                })
            }
            _ => {
                let error: RequestExecutorError = RavenDbError::ServerError {
                    url: url.to_string(),
                    status: status.as_u16(),
                    schema: ExceptionSchema::from_response_body(url, &body),
                }
                .into();

                if !error.is_server_down() {
                    return Err(unrecoverable(error));
                }
                self.handle_server_down(node, selection, attempt, error, failed_nodes)
                    .await
                    .map_err(unrecoverable)
            }
        }
    }

    /// Records the failure of `node` and picks the node to try next, or gives up when every
    /// node has failed.
    async fn handle_server_down<T>(
        self: &Arc<Self>,
        node: &ServerNode,
        selection: Option<&NodeSelection>,
        attempt: Attempt,
        error: RequestExecutorError,
        failed_nodes: &mut FailedNodes,
    ) -> Result<Step<T>, RequestExecutorError> {
        tracing::debug!("`{}` failed: {}", node.url, error);
        self.emit(RequestEvent::FailedRequest {
            url: node.url.to_string(),
            error: error.to_string(),
        });
        failed_nodes.push(node.clone(), error);

        let Some(selection) = selection.filter(|_| attempt.failover) else {
            return Err(std::mem::take(failed_nodes).into_error());
        };

        self.spawn_health_checks(selection);
        self.node_selector.on_failed_request(selection);

        let mut next = self
            .node_selector
            .preferred_node()
            .ok_or(RequestExecutorError::EmptyTopology)?;

        if failed_nodes.contains(&next.node) {
            // Every node we know of failed. The topology may be stale, so give a refresh one
            // chance to point us somewhere else.
            if let Err(e) = self
                .update_topology(next.node.clone(), Some(FAILOVER_TOPOLOGY_REFRESH_WAIT), false)
                .await
            {
                tracing::debug!("Topology refresh after failover failed: {}", e);
            }

            next = self
                .node_selector
                .preferred_node()
                .ok_or(RequestExecutorError::EmptyTopology)?;
            if failed_nodes.contains(&next.node) {
                return Err(std::mem::take(failed_nodes).into_error());
            }
        }

        // The speed test already had its chance with this request.
        Ok(Step::Retry {
            selection: next,
            attempt: Attempt {
                race: false,
                ..attempt
            },
        })
    }

    fn should_race_all_nodes<C: RavenCommand>(
        &self,
        selection: Option<&NodeSelection>,
        command: &C,
    ) -> bool {
        selection.is_some()
            && command.is_read_request()
            && command.response_type() == ResponseType::Object
            && self.read_balance_behavior() == ReadBalanceBehavior::FastestNode
            && self.node_selector.in_speed_test_phase()
            && self.node_selector.topology().len() > 1
    }

    /// Sends `command` to every node at once. The first node to answer is recorded as the
    /// fastest and its response is used; the other responses are drained in the background.
    async fn execute_on_all_to_figure_out_the_fastest<C: RavenCommand>(
        &self,
        command: &C,
        change_vector: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<(NodeSelection, Response), RequestExecutorError> {
        let topology = self.node_selector.topology();
        let mut racers = FuturesUnordered::new();

        for (index, node) in topology.nodes.iter().enumerate() {
            let request = command.create_request(&self.client, node)?;
            let request = self.prepare_request(request, change_vector, timeout)?;
            let url = request.url().to_string();
            let client = self.client.clone();
            self.number_of_server_requests
                .fetch_add(1, Ordering::AcqRel);
            self.emit(RequestEvent::BeforeRequest { url: url.clone() });

            racers.push(async move {
                let started = Instant::now();
                let result = client.execute(request).await;
                (index, url, started.elapsed(), result)
            });
        }

        let mut last_error = None;
        loop {
            let Some((index, url, latency, result)) = racers.next().await else {
                break;
            };

            match result {
                Ok(response) => {
                    let winner = NodeSelection::new(index, topology.clone());
                    self.node_selector.record_fastest(&winner, latency);

                    tokio::spawn(async move {
                        while let Some((_, _, _, result)) = racers.next().await {
                            if let Ok(response) = result {
                                drain(response).await;
                            }
                        }
                    });

                    return Ok((winner, response));
                }
                Err(e) => {
                    tracing::debug!("Speed test request to `{}` failed: {}", url, e);
                    last_error = Some(transport_error(&url, timeout, e));
                }
            }
        }

        Err(last_error.unwrap_or(RequestExecutorError::EmptyTopology))
    }

    fn request_timeout<C: RavenCommand>(
        &self,
        command: &C,
    ) -> Result<Option<Duration>, RequestExecutorError> {
        let timeout = command.timeout().or_else(|| self.default_timeout());
        match timeout {
            Some(requested) if requested > GLOBAL_HTTP_CLIENT_TIMEOUT => {
                Err(RequestExecutorError::TimeoutTooLarge {
                    requested,
                    maximum: GLOBAL_HTTP_CLIENT_TIMEOUT,
                })
            }
            _ => Ok(timeout),
        }
    }

    /// Adds the headers every request carries, and the timeout.
    fn prepare_request(
        &self,
        mut request: Request,
        change_vector: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<Request, RequestExecutorError> {
        let request_headers = request.headers_mut();
        request_headers.insert(
            headers::CLIENT_VERSION,
            HeaderValue::from_static(CLIENT_VERSION),
        );

        if let Some(change_vector) = change_vector {
            request_headers.insert(
                headers::IF_NONE_MATCH,
                HeaderValue::from_str(&format!("\"{}\"", change_vector))
                    .context("Cached change vector is not a valid header value")?,
            );
        }

        if !self.disable_topology_updates {
            request_headers.insert(
                headers::TOPOLOGY_ETAG,
                HeaderValue::from_str(&format!("\"{}\"", self.topology_etag()))
                    .context("Topology etag is not a valid header value")?,
            );
        }

        if !self.client_configuration_updates_disabled() {
            request_headers.insert(
                headers::CLIENT_CONFIGURATION_ETAG,
                HeaderValue::from_str(&format!("\"{}\"", self.client_configuration_etag()))
                    .context("Client configuration etag is not a valid header value")?,
            );
        }

        if timeout.is_some() {
            *request.timeout_mut() = timeout;
        }

        Ok(request)
    }

    /// Runs the refreshes a response asked for. They never fail the request that triggered
    /// them.
    async fn refresh_after_response(
        self: &Arc<Self>,
        node: &ServerNode,
        refresh_topology: bool,
        refresh_client_configuration: bool,
    ) {
        let topology = async {
            if refresh_topology {
                let node = ServerNode::new(node.url.clone(), self.database.clone());
                self.update_topology(node, Some(Duration::ZERO), false)
                    .await
                    .map(|_| ())
            } else {
                Ok(())
            }
        };
        let client_configuration = async {
            if refresh_client_configuration {
                self.update_client_configuration().await
            } else {
                Ok(())
            }
        };

        let (topology, client_configuration) = tokio::join!(topology, client_configuration);
        if let Err(e) = topology {
            tracing::info!("Failed to refresh the topology. Caused by: {}", e);
        }
        if let Err(e) = client_configuration {
            tracing::info!("Failed to refresh the client configuration. Caused by: {}", e);
        }
    }
}

/// Reads that may be answered from, and stored in, the response cache.
fn is_cacheable<C: RavenCommand>(command: &C) -> bool {
    command.can_cache() && command.is_read_request() && command.response_type() == ResponseType::Object
}

fn result_from_cache<C: RavenCommand>(
    command: &C,
    cached: &ReleaseCacheItem,
) -> Result<Option<C::Result>, RequestExecutorError> {
    if cached.is_not_found() {
        return Ok(None);
    }

    match cached.payload() {
        Some(payload) => Ok(Some(command.parse_response(payload, true)?)),
        None => Ok(None),
    }
}

fn transport_error(url: &str, timeout: Option<Duration>, source: reqwest::Error) -> RequestExecutorError {
    if source.is_timeout() {
        RequestExecutorError::Timeout {
            url: url.to_string(),
            timeout: timeout.unwrap_or(GLOBAL_HTTP_CLIENT_TIMEOUT),
            source,
        }
    } else {
        RequestExecutorError::RequestFailed {
            url: url.to_string(),
            source,
        }
    }
}

fn header_is_true(response: &Response, name: &str) -> bool {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Reads the rest of a response we don't need, so its connection can go back to the pool.
async fn drain(response: Response) {
    let _: Bytes = response.bytes().await.unwrap_or_default();
}
