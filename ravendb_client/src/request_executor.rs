//! Sends commands to the best node of the cluster.
//!
//! The [`RequestExecutor`] handle is cheap to clone and meant to be shared by every caller
//! talking to one database. Each call picks a node, consults the response cache, dispatches the
//! request and classifies the answer: failing nodes are demoted and probed in the background
//! until they recover, stale topology and client configuration are refreshed when the server
//! says so, and cached responses are reused when the server reports them unchanged.
mod node_status;
mod request_executor_actor;
mod request_executor_dispatch;
mod request_executor_error;
mod request_executor_handle;
mod request_executor_state;

use std::time::Duration;

pub use node_status::HealthCheckBackoff;
pub use request_executor_error::RequestExecutorError;
pub use request_executor_handle::RequestExecutor;

use crate::node_selector::SessionInfo;

pub const CLIENT_VERSION: &str = "4.0.0";

/// Requests may not ask for a longer timeout than this.
pub const GLOBAL_HTTP_CLIENT_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// How long a seed url gets to answer the first topology request.
pub(crate) const FIRST_TOPOLOGY_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a failing request waits for an in-flight topology refresh before giving up on it.
pub(crate) const FAILOVER_TOPOLOGY_REFRESH_WAIT: Duration = Duration::from_secs(2);

pub(crate) mod headers {
    pub const CLIENT_VERSION: &str = "Raven-Client-Version";
    pub const IF_NONE_MATCH: &str = "If-None-Match";
    pub const ETAG: &str = "ETag";
    pub const TOPOLOGY_ETAG: &str = "Topology-Etag";
    pub const CLIENT_CONFIGURATION_ETAG: &str = "Client-Configuration-Etag";
    pub const REFRESH_TOPOLOGY: &str = "Refresh-Topology";
    pub const REFRESH_CLIENT_CONFIGURATION: &str = "Refresh-Client-Configuration";
    pub const DATABASE_MISSING: &str = "Database-Missing";
}

/// Opt-in permission to answer a read from the cache without contacting the server, as long
/// as the cached response is younger than `duration`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AggressiveCacheOptions {
    pub duration: Duration,
}

impl AggressiveCacheOptions {
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

/// Per-call options for [`RequestExecutor::execute_with`].
#[derive(Clone, Copy, Debug, Default)]
pub struct ExecuteOptions {
    pub session_info: Option<SessionInfo>,
    pub aggressive_cache: Option<AggressiveCacheOptions>,
}

impl ExecuteOptions {
    pub fn with_session(mut self, session_info: SessionInfo) -> Self {
        self.session_info = Some(session_info);
        self
    }

    pub fn aggressively_cache_for(mut self, duration: Duration) -> Self {
        self.aggressive_cache = Some(AggressiveCacheOptions::new(duration));
        self
    }
}

/// Maintenance work handed to the background actor of a request executor.
#[derive(Debug)]
pub(crate) enum RequestExecutorMessage {
    /// Starts the periodic topology refresh once a topology has been received.
    StartTopologyUpdates,
}
