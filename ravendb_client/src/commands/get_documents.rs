use reqwest::Method;
use serde::Deserialize;

use crate::{commands::node_url, raven_command::RavenCommand, server_node::ServerNode};

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct GetDocumentsResult {
    pub results: Vec<serde_json::Value>,
    pub includes: serde_json::Map<String, serde_json::Value>,
}

/// Loads documents, either one by id or a page of all documents in the database.
#[derive(Debug)]
pub struct GetDocumentsCommand {
    database: String,
    query: DocumentsQuery,
}

#[derive(Debug)]
enum DocumentsQuery {
    ById(String),
    Paged {
        page_size: Option<i64>,
        start: Option<i64>,
    },
}

impl GetDocumentsCommand {
    pub fn by_id(database: &str, id: &str) -> Self {
        Self {
            database: database.to_string(),
            query: DocumentsQuery::ById(id.to_string()),
        }
    }

    pub fn paged(database: &str, page_size: Option<i64>, start: Option<i64>) -> Self {
        Self {
            database: database.to_string(),
            query: DocumentsQuery::Paged { page_size, start },
        }
    }
}

impl RavenCommand for GetDocumentsCommand {
    type Result = GetDocumentsResult;

    fn create_request(
        &self,
        client: &reqwest::Client,
        node: &ServerNode,
    ) -> anyhow::Result<reqwest::Request> {
        //Create a vec to hold optional parts of the query string
        let mut query = Vec::new();
        match &self.query {
            DocumentsQuery::ById(id) => query.push(("id", id.clone())),
            DocumentsQuery::Paged { page_size, start } => {
                if let Some(start) = start {
                    query.push(("start", start.to_string()));
                }
                if let Some(page_size) = page_size {
                    query.push(("pageSize", page_size.to_string()));
                }
            }
        }

        let path = format!("/databases/{}/docs", self.database);
        let url = node_url(node, &path, &query)?;
        Ok(client.request(Method::GET, url).build()?)
    }

    fn parse_response(&self, body: &[u8], _from_cache: bool) -> anyhow::Result<GetDocumentsResult> {
        Ok(serde_json::from_slice(body)?)
    }

    fn is_read_request(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use crate::{raven_command::RavenCommand, server_node::ServerNode};

    use super::GetDocumentsCommand;

    fn node() -> ServerNode {
        ServerNode::new(Url::parse("http://a.example:8080").unwrap(), "db".to_string())
    }

    #[test]
    fn paged_request_carries_start_and_page_size() {
        let client = reqwest::Client::new();

        let request = GetDocumentsCommand::paged("db", Some(25), Some(50))
            .create_request(&client, &node())
            .unwrap();

        assert_eq!(
            request.url().as_str(),
            "http://a.example:8080/databases/db/docs?start=50&pageSize=25"
        );
    }

    #[test]
    fn paged_request_without_options_has_no_query() {
        let client = reqwest::Client::new();

        let request = GetDocumentsCommand::paged("db", None, None)
            .create_request(&client, &node())
            .unwrap();

        assert_eq!(request.url().as_str(), "http://a.example:8080/databases/db/docs");
    }
}
