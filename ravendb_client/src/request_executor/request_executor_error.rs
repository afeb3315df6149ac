use std::{sync::Arc, time::Duration};

use crate::{error_chain_fmt, ravendb_error::RavenDbError};

#[derive(thiserror::Error)]
pub enum RequestExecutorError {
    #[error(transparent)]
    Server(#[from] RavenDbError),
    #[error("Tried to send the request to every node in the topology and all of them failed. {0}")]
    AllTopologyNodesDown(String),
    #[error("The request to {url} timed out after {timeout:?}")]
    Timeout {
        url: String,
        timeout: Duration,
        #[source]
        source: reqwest::Error,
    },
    #[error("Maximum request timeout is {maximum:?} but {requested:?} was requested")]
    TimeoutTooLarge {
        requested: Duration,
        maximum: Duration,
    },
    #[error("Failed to send the request to {url}")]
    RequestFailed {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("The topology is empty, there is no node to send the request to")]
    EmptyTopology,
    #[error("Failed to retrieve the database topology from all known nodes")]
    FirstTopologyUpdateFailed(#[source] Arc<RequestExecutorError>),
    #[error("The request executor has been disposed")]
    Disposed,
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for RequestExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

impl RequestExecutorError {
    /// Whether another node could succeed where this one failed.
    pub fn is_server_down(&self) -> bool {
        match self {
            RequestExecutorError::Timeout { .. } | RequestExecutorError::RequestFailed { .. } => {
                true
            }
            RequestExecutorError::Server(RavenDbError::ServerError { status, .. }) => {
                matches!(status, 408 | 502 | 503 | 504)
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ravendb_error::{ExceptionSchema, RavenDbError};

    use super::RequestExecutorError;

    fn server_error(status: u16) -> RequestExecutorError {
        RavenDbError::ServerError {
            url: "http://a.example:8080/databases/db/docs".to_string(),
            status,
            schema: ExceptionSchema::default(),
        }
        .into()
    }

    #[test]
    fn unavailable_statuses_count_as_server_down() {
        for status in [408, 502, 503, 504] {
            assert!(server_error(status).is_server_down(), "{}", status);
        }
    }

    #[test]
    fn other_failures_are_not_server_down() {
        for status in [400, 500, 501] {
            assert!(!server_error(status).is_server_down(), "{}", status);
        }
        let gone: RequestExecutorError = RavenDbError::Gone("http://a.example:8080".to_string()).into();
        assert!(!gone.is_server_down());
        assert!(!RequestExecutorError::EmptyTopology.is_server_down());
    }
}
