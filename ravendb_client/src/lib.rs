/*!
ravendb_client is a client library for the RavenDB document database.
It aims to compete with the existing libraries officially offered, but
using more rusty ways of doing things.

This library requires tokio and async, and uses the actor pattern to maintain
a single instance of the [`DocumentStore`] per cluster, as recommended by the
official libraries. This is designed to keep resource usage in your app to a minimum.

Every request goes through the [`RequestExecutor`](request_executor::RequestExecutor) of its
database. It discovers the cluster topology, picks the node a request should go to, fails over
to the other nodes when one goes down and caches read responses by change vector.

A [`DocumentSession`] can be requested from the [`DocumentStore`] to interact with the
database. It is considered a unit of work.

# Example
```rust,no_run
# tokio_test::block_on(async {
use ravendb_client::DocumentStoreBuilder;

let document_store = DocumentStoreBuilder::new()
    .set_urls(&["http://localhost:8080"])
    .set_database_name("Northwind")
    .build()?;
let session = document_store.open_session().await?;

let employee = session.load_json("employees/1-A").await?;
println!("{:?}", employee);
# Ok::<(), ravendb_client::DocumentStoreError>(())
# });
```
*/

mod document_session;
mod document_store;
mod timer;

pub mod commands;
pub mod document_conventions;
pub mod events;
pub mod http_cache;
pub mod node_selector;
pub mod raven_command;
pub mod ravendb_error;
pub mod request_executor;
pub mod server_node;
pub mod topology;

pub use document_session::*;
pub use document_store::*;

pub fn error_chain_fmt(
    e: &impl std::error::Error,
    f: &mut std::fmt::Formatter<'_>,
) -> std::fmt::Result {
    writeln!(f, "{}\n", e)?;
    let mut current = e.source();
    while let Some(cause) = current {
        writeln!(f, "Caused by:\n\t{}", cause)?;
        current = cause.source();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::{ravendb_error::RavenDbError, request_executor::RequestExecutorError};

    #[test]
    fn error_chain_fmt_prints_every_cause() {
        let error = RequestExecutorError::from(RavenDbError::UnexpectedError(anyhow::anyhow!(
            "the server went away"
        )));

        let formatted = format!("{:?}", error);

        assert!(formatted.starts_with("the server went away"));
    }

    #[test]
    fn error_chain_fmt_walks_sources() {
        let source = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let error = anyhow::Error::new(source).context("request failed");
        let error = RequestExecutorError::UnexpectedError(error);

        let formatted = format!("{:?}", error);

        assert!(formatted.contains("request failed"));
        assert!(formatted.contains("Caused by:\n\tconnection reset"));
    }
}
