use reqwest::Method;
use serde::Deserialize;

use crate::{
    commands::node_url, document_conventions::ReadBalanceBehavior, raven_command::RavenCommand,
    server_node::ServerNode,
};

/// Client behaviour an administrator configured on the server side.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ClientConfiguration {
    #[serde(default)]
    pub etag: i64,
    #[serde(default)]
    pub disabled: bool,
    pub read_balance_behavior: Option<ReadBalanceBehavior>,
    pub max_number_of_requests_per_session: Option<u32>,
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct GetClientConfigurationResult {
    pub etag: i64,
    pub configuration: Option<ClientConfiguration>,
}

#[derive(Debug)]
pub struct GetClientConfigurationCommand {
    database: String,
}

impl GetClientConfigurationCommand {
    pub fn new(database: &str) -> Self {
        Self {
            database: database.to_string(),
        }
    }
}

impl RavenCommand for GetClientConfigurationCommand {
    type Result = GetClientConfigurationResult;

    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        let path = format!("/databases/{}/configuration/client", self.database);
        let url = node_url(node, &path, &[])?;
        Ok(client.request(Method::GET, url).build()?)
    }

    fn parse_response(
        &self,
        body: &[u8],
        _from_cache: bool,
    ) -> anyhow::Result<GetClientConfigurationResult> {
        Ok(serde_json::from_slice(body)?)
    }

    fn is_read_request(&self) -> bool {
        true
    }

    fn can_cache(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use crate::{document_conventions::ReadBalanceBehavior, raven_command::RavenCommand};

    use super::GetClientConfigurationCommand;

    #[test]
    fn client_configuration_result_parses() {
        let body = br#"{"Etag":7,"Configuration":{"Etag":7,"Disabled":false,"ReadBalanceBehavior":"RoundRobin","MaxNumberOfRequestsPerSession":50}}"#;

        let result = GetClientConfigurationCommand::new("db")
            .parse_response(body, false)
            .unwrap();

        let configuration = result.configuration.unwrap();
        assert_eq!(result.etag, 7);
        assert_eq!(
            configuration.read_balance_behavior,
            Some(ReadBalanceBehavior::RoundRobin)
        );
        assert_eq!(configuration.max_number_of_requests_per_session, Some(50));
    }
}
