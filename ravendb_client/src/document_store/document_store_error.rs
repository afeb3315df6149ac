use crate::{error_chain_fmt, request_executor::RequestExecutorError};

#[derive(thiserror::Error)]
pub enum DocumentStoreError {
    #[error("No URLs were supplied and a document store can't exist without at least one")]
    MissingUrlsError,
    #[error("Unable to determine which database to operate on")]
    MissingDatabaseError,
    #[error("The document store has been closed")]
    Closed,
    #[error("The maximum number of requests ({0}) allowed for this session has been reached")]
    MaxRequestsPerSessionExceeded(u32),
    #[error(transparent)]
    RequestExecutor(#[from] RequestExecutorError),
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for DocumentStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
