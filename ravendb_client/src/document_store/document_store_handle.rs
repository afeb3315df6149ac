use tokio::sync::{mpsc, oneshot};
use tracing::instrument;

use crate::{
    raven_command::RavenCommand, request_executor::RequestExecutor, run_document_store_actor,
    DocumentSession, DocumentStoreActor, DocumentStoreBuilder, DocumentStoreError,
    DocumentStoreInitialConfiguration, DocumentStoreMessage,
};

/**
This a handle to the actor.

Only one DocumentStoreActor should exist per database cluster when possible to reduce resource
usage. Cloning this handle is very cheap and will not instantiate a new actor in the background.
It is recommended to clone this handle to each component that needs to talk to the DocumentStoreActor.
When the last handle goes out of scope and it dropped, the backing actor will also be dropped.

```rust
# tokio_test::block_on(async {
use ravendb_client::DocumentStore;

let document_store = DocumentStore::builder()
    .set_urls(&["http://localhost:8080"])
    .set_database_name("Northwind")
    .build()
    .unwrap();
println!("DEBUG: {:?}", document_store);
# })
```
*/
#[derive(Clone, Debug)]
pub struct DocumentStore {
    sender: mpsc::Sender<DocumentStoreMessage>,
}

impl DocumentStore {
    pub fn builder() -> DocumentStoreBuilder {
        DocumentStoreBuilder::default()
    }

    // This is pub(crate) so only the builder can crank it out
    pub(crate) fn new(initial_config: DocumentStoreInitialConfiguration) -> Self {
        let (sender, receiver) = mpsc::channel(8);
        let actor = DocumentStoreActor::new(receiver, initial_config);
        tokio::spawn(run_document_store_actor(actor));

        Self { sender }
    }

    /// Returns the request executor of `database`, or of the store's default database when
    /// `None`. Executors are created on first use and shared afterwards.
    #[instrument(
        level = "debug",
        name = "Actor Handle - Get Request Executor",
        skip(self)
    )]
    pub async fn get_request_executor(
        &self,
        database_name: Option<String>,
    ) -> Result<RequestExecutor, DocumentStoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(DocumentStoreMessage::GetRequestExecutor {
            database_name,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| actor_gone())?
    }

    /// Executes `command` on the default database.
    #[instrument(
        level = "debug",
        name = "Actor Handle - Execute Raven Command",
        skip(self, command)
    )]
    pub async fn execute<C: RavenCommand>(
        &self,
        command: &C,
    ) -> Result<Option<C::Result>, DocumentStoreError> {
        let executor = self.get_request_executor(None).await?;
        Ok(executor.execute(command).await?)
    }

    /// The database used when none is named.
    pub async fn database(&self) -> Result<Option<String>, DocumentStoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(DocumentStoreMessage::GetDatabase { respond_to: tx })
            .await?;
        rx.await.map_err(|_| actor_gone())
    }

    /// Opens a session on the default database.
    pub async fn open_session(&self) -> Result<DocumentSession, DocumentStoreError> {
        self.open_session_for(None).await
    }

    /// Opens a session on `database_name`, or on the default database when `None`.
    #[instrument(level = "debug", name = "Actor Handle - Open Session", skip(self))]
    pub async fn open_session_for(
        &self,
        database_name: Option<String>,
    ) -> Result<DocumentSession, DocumentStoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(DocumentStoreMessage::OpenSession {
            database_name,
            respond_to: tx,
        })
        .await?;
        let parameters = rx.await.map_err(|_| actor_gone())??;
        Ok(DocumentSession::new(parameters))
    }

    /// Disposes every request executor the store created.
    pub async fn close(&self) -> Result<(), DocumentStoreError> {
        let (tx, rx) = oneshot::channel();
        self.send(DocumentStoreMessage::Close { respond_to: tx })
            .await?;
        rx.await.map_err(|_| actor_gone())
    }

    async fn send(&self, msg: DocumentStoreMessage) -> Result<(), DocumentStoreError> {
        self.sender.send(msg).await.map_err(|_| actor_gone())
    }
}

fn actor_gone() -> DocumentStoreError {
    DocumentStoreError::UnexpectedError(anyhow::anyhow!(
        "DocumentStoreActor task has been killed"
    ))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use serde_json::json;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use crate::{
        commands::GetDocumentsCommand, document_conventions::DocumentConventions,
        DocumentStoreBuilder, DocumentStoreError,
    };

    fn topology(server: &MockServer) -> serde_json::Value {
        json!({
            "Etag": 1,
            "Nodes": [{ "Url": server.uri(), "Database": "db", "ClusterTag": "A" }],
        })
    }

    #[tokio::test]
    async fn request_executor_is_shared_per_database() {
        // Arrange
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/topology"))
            .respond_with(ResponseTemplate::new(200).set_body_json(topology(&server)))
            .mount(&server)
            .await;
        let store = DocumentStoreBuilder::new()
            .set_urls(&[server.uri()])
            .set_database_name("db")
            .build()
            .unwrap();

        // Act
        let first = store.get_request_executor(None).await.unwrap();
        let second = store.get_request_executor(Some("db".to_string())).await.unwrap();
        let other = store
            .get_request_executor(Some("other".to_string()))
            .await
            .unwrap();

        first
            .cache()
            .store("/databases/db/docs?id=people/1", "A:1", Bytes::from_static(b"{}"));

        // Assert
        assert_eq!(first.database(), "db");
        assert_eq!(second.cache().number_of_items(), 1);
        assert_eq!(other.database(), "other");
        assert_eq!(other.cache().number_of_items(), 0);
    }

    #[tokio::test]
    async fn store_executes_commands_on_default_database() {
        // Arrange
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/topology"))
            .respond_with(ResponseTemplate::new(200).set_body_json(topology(&server)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/databases/db/docs"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "Results": [{ "Name": "Luke" }], "Includes": {} })),
            )
            .expect(1)
            .mount(&server)
            .await;
        let store = DocumentStoreBuilder::new()
            .set_urls(&[server.uri()])
            .set_database_name("db")
            .build()
            .unwrap();

        // Act
        let result = store
            .execute(&GetDocumentsCommand::by_id("db", "people/1"))
            .await
            .unwrap();

        // Assert
        assert_eq!(result.unwrap().results[0]["Name"], "Luke");
    }

    #[tokio::test]
    async fn missing_database_name_is_an_error() {
        let store = DocumentStoreBuilder::new()
            .set_urls(&["http://localhost:8080"])
            .build()
            .unwrap();

        let result = store.get_request_executor(None).await;

        assert!(matches!(
            result,
            Err(DocumentStoreError::MissingDatabaseError)
        ));
    }

    #[tokio::test]
    async fn closed_store_refuses_new_executors() {
        // Arrange
        let store = DocumentStoreBuilder::new()
            .set_urls(&["http://localhost:8080"])
            .set_database_name("db")
            .set_conventions(DocumentConventions::default().set_disable_topology_updates(true))
            .build()
            .unwrap();
        let executor = store.get_request_executor(None).await.unwrap();

        // Act
        store.close().await.unwrap();
        let result = store.get_request_executor(None).await;

        // Assert
        assert!(matches!(result, Err(DocumentStoreError::Closed)));
        assert!(executor
            .execute(&GetDocumentsCommand::by_id("db", "people/1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sessions_get_increasing_ids() {
        let store = DocumentStoreBuilder::new()
            .set_urls(&["http://localhost:8080"])
            .set_database_name("db")
            .set_conventions(DocumentConventions::default().set_disable_topology_updates(true))
            .build()
            .unwrap();

        let first = store.open_session().await.unwrap();
        let second = store.open_session().await.unwrap();

        assert_eq!(first.session_info().session_id + 1, second.session_info().session_id);
    }
}
