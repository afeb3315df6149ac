use std::sync::atomic::{AtomicU32, Ordering};

use tracing::instrument;

use crate::{
    commands::{GetDocumentsCommand, GetDocumentsResult},
    node_selector::SessionInfo,
    raven_command::RavenCommand,
    request_executor::{ExecuteOptions, RequestExecutor},
    DocumentStoreError, SessionParameters,
};

/// Implements Unit of Work for accessing the RavenDB server.
///
/// All reads of a session go through the same [`SessionInfo`], so with round-robin read
/// balancing a session keeps talking to one node.
#[derive(Debug)]
pub struct DocumentSession {
    request_executor: RequestExecutor,
    session_info: SessionInfo,
    number_of_requests: AtomicU32,
}

impl DocumentSession {
    pub(crate) fn new(parameters: SessionParameters) -> Self {
        Self {
            request_executor: parameters.request_executor,
            session_info: parameters.session_info,
            number_of_requests: AtomicU32::new(0),
        }
    }

    pub fn session_info(&self) -> SessionInfo {
        self.session_info
    }

    pub fn number_of_requests(&self) -> u32 {
        self.number_of_requests.load(Ordering::Acquire)
    }

    /// Executes `command` as part of this session.
    ///
    /// Fails without contacting the server once the session has made as many requests as the
    /// conventions allow.
    #[instrument(level = "debug", skip(self, command), fields(session_id = self.session_info.session_id))]
    pub async fn execute<C: RavenCommand>(
        &self,
        command: &C,
    ) -> Result<Option<C::Result>, DocumentStoreError> {
        self.increment_requests_count()?;

        let options = ExecuteOptions::default().with_session(self.session_info);
        Ok(self.request_executor.execute_with(command, options).await?)
    }

    /// Loads the document with `id` as raw json, or `None` when it doesn't exist.
    #[instrument(level = "info", name = "Load Document", skip(self))]
    pub async fn load_json(&self, id: &str) -> Result<Option<serde_json::Value>, DocumentStoreError> {
        let command = GetDocumentsCommand::by_id(self.request_executor.database(), id);
        let result: Option<GetDocumentsResult> = self.execute(&command).await?;
        Ok(result.and_then(|r| r.results.into_iter().next()))
    }

    fn increment_requests_count(&self) -> Result<(), DocumentStoreError> {
        // The server's client configuration may have changed the cap since the session opened.
        let max = self
            .request_executor
            .conventions()
            .max_number_of_requests_per_session();
        let previous = self.number_of_requests.fetch_add(1, Ordering::AcqRel);
        if previous >= max {
            tracing::error!(
                "Session {} exceeded its {} requests",
                self.session_info.session_id,
                max
            );
            return Err(DocumentStoreError::MaxRequestsPerSessionExceeded(max));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{document_conventions::DocumentConventions, DocumentStoreBuilder, DocumentStoreError};

    fn single_node_store(server: &MockServer, max_requests: u32) -> crate::DocumentStore {
        DocumentStoreBuilder::new()
            .set_urls(&[server.uri()])
            .set_database_name("db")
            .set_conventions(
                DocumentConventions::default()
                    .set_disable_topology_updates(true)
                    .set_max_number_of_requests_per_session(max_requests),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn load_json_returns_first_result() {
        // Arrange
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/databases/db/docs"))
            .and(query_param("id", "people/1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "Results": [{ "Name": "Leia" }], "Includes": {} })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let store = single_node_store(&server, 30);
        let session = store.open_session().await.unwrap();

        // Act
        let document = session.load_json("people/1").await.unwrap();

        // Assert
        assert_eq!(document.unwrap()["Name"], "Leia");
        assert_eq!(session.number_of_requests(), 1);
    }

    #[tokio::test]
    async fn load_json_of_missing_document_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/databases/db/docs"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let store = single_node_store(&server, 30);
        let session = store.open_session().await.unwrap();

        let document = session.load_json("people/404").await.unwrap();

        assert!(document.is_none());
    }

    #[tokio::test]
    async fn session_refuses_requests_past_the_cap() {
        // Arrange
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/databases/db/docs"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({ "Results": [{}], "Includes": {} })),
            )
            .expect(2)
            .mount(&server)
            .await;
        let store = single_node_store(&server, 2);
        let session = store.open_session().await.unwrap();

        // Act
        session.load_json("people/1").await.unwrap();
        session.load_json("people/2").await.unwrap();
        let third = session.load_json("people/3").await;

        // Assert
        assert!(matches!(
            third,
            Err(DocumentStoreError::MaxRequestsPerSessionExceeded(2))
        ));
    }
}
