use reqwest::Method;
use serde::Deserialize;

use crate::{commands::node_url, raven_command::RavenCommand, server_node::ServerNode};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DatabaseStatistics {
    pub database_id: Option<String>,
    pub count_of_documents: i64,
    pub count_of_indexes: i64,
}

/// Reads database statistics. Also serves as the health probe for failed nodes, tagged so the
/// server can tell probes apart from real traffic.
#[derive(Debug)]
pub struct GetStatisticsCommand {
    database: String,
    debug_tag: Option<String>,
}

impl GetStatisticsCommand {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
            debug_tag: None,
        }
    }

    pub fn health_check(database: &str) -> Self {
        Self {
            database: database.to_string(),
            debug_tag: Some("check".to_string()),
        }
    }
}

impl RavenCommand for GetStatisticsCommand {
    type Result = DatabaseStatistics;

    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        let path = format!("/databases/{}/stats", self.database);
        let query = match &self.debug_tag {
            Some(tag) => vec![("failure", tag.clone())],
            None => Vec::new(),
        };
        let url = node_url(node, &path, &query)?;
        Ok(client.request(Method::GET, url).build()?)
    }

    fn parse_response(&self, body: &[u8], _from_cache: bool) -> anyhow::Result<DatabaseStatistics> {
        Ok(serde_json::from_slice(body)?)
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn can_cache(&self) -> bool {
        self.debug_tag.is_none()
    }
}
