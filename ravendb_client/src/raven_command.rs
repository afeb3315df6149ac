//! The raven commands are the only way to directly interact with the server.
//!
//! A command describes one REST call: how to build the request for a given node, whether it
//! only reads, whether its response may be cached, and how to turn the response body into a
//! result. The [`RequestExecutor`](crate::request_executor::RequestExecutor) only ever talks to
//! commands through this trait and never needs to know the concrete command type.
use std::time::Duration;

use crate::server_node::ServerNode;

/// The shape of the body a command expects back from the server.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ResponseType {
    /// The body is ignored.
    Empty,
    /// The body is a JSON object. Only these responses are cached.
    Object,
    /// The body is handed to the command as-is.
    Raw,
}

pub trait RavenCommand: Send + Sync {
    type Result: Send;

    /// Builds the request for `node`. The executor adds the protocol headers and timeout.
    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request>;

    /// Turns a response body into the command result. `from_cache` is set when the body came
    /// from the response cache instead of the network.
    fn parse_response(&self, body: &[u8], from_cache: bool) -> anyhow::Result<Self::Result>;

    fn is_read_request(&self) -> bool;

    fn response_type(&self) -> ResponseType {
        ResponseType::Object
    }

    fn can_cache(&self) -> bool {
        true
    }

    fn can_cache_aggressively(&self) -> bool {
        true
    }

    /// Overrides the executor's default timeout for this command.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}
