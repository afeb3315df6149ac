use std::time::Duration;

use reqwest::Method;

use crate::{
    commands::node_url, raven_command::RavenCommand, server_node::ServerNode,
    topology::Topology,
};

/// Asks a node for the current topology of a database.
#[derive(Debug)]
pub struct GetDatabaseTopologyCommand {
    database: String,
    timeout: Option<Duration>,
}

impl GetDatabaseTopologyCommand {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl RavenCommand for GetDatabaseTopologyCommand {
    type Result = Topology;

    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        let url = node_url(node, "/topology", &[("name", self.database.clone())])?;
        Ok(client.request(Method::GET, url).build()?)
    }

    fn parse_response(&self, body: &[u8], _from_cache: bool) -> anyhow::Result<Topology> {
        Ok(serde_json::from_slice(body)?)
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn can_cache(&self) -> bool {
        false
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
