use std::{collections::HashMap, net::IpAddr};

use tokio::sync::oneshot;
use url::Url;

use crate::{
    document_conventions::DocumentConventions, node_selector::SessionInfo,
    request_executor::RequestExecutor, DocumentStoreError,
};

pub type DnsOverrides = HashMap<String, IpAddr>;

#[derive(Debug)]
pub enum DocumentStoreMessage {
    /// Returns the executor of the given database, or of the store's default database.
    GetRequestExecutor {
        database_name: Option<String>,
        respond_to: oneshot::Sender<Result<RequestExecutor, DocumentStoreError>>,
    },
    GetDatabase {
        respond_to: oneshot::Sender<Option<String>>,
    },
    /// Hands out what a new session needs: its executor and a fresh session id.
    OpenSession {
        database_name: Option<String>,
        respond_to: oneshot::Sender<Result<SessionParameters, DocumentStoreError>>,
    },
    /// Disposes every executor. The store refuses requests afterwards.
    Close { respond_to: oneshot::Sender<()> },
}

#[derive(Debug)]
pub struct SessionParameters {
    pub(crate) request_executor: RequestExecutor,
    pub(crate) session_info: SessionInfo,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DocumentStoreState {
    /// [`DocumentStore`](crate::DocumentStore) was initialized but has since been closed.
    Closed,

    /// [`DocumentStore`](crate::DocumentStore) is initialized.
    Initialized,
}

/// Everything the builder validated, handed to a new [`DocumentStoreActor`](crate::DocumentStoreActor).
#[derive(Debug)]
pub struct DocumentStoreInitialConfiguration {
    /// Shared by every request executor the store creates.
    pub(crate) client: reqwest::Client,
    pub(crate) conventions: DocumentConventions,
    pub(crate) database_name: Option<String>,
    pub(crate) initial_urls: Vec<Url>,
}
