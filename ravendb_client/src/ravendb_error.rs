use serde::Deserialize;

use crate::error_chain_fmt;

/// The error document the server sends back with failed requests.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "PascalCase", default)]
pub struct ExceptionSchema {
    pub url: String,
    pub r#type: String,
    pub message: String,
    pub error: String,
}

impl ExceptionSchema {
    /// Reads the server's error document from `body`, or describes the body as unparsable.
    pub fn from_response_body(url: &str, body: &[u8]) -> Self {
        match serde_json::from_slice::<ExceptionSchema>(body) {
            Ok(schema) if !schema.r#type.is_empty() || !schema.message.is_empty() => schema,
            _ => Self {
                url: url.to_string(),
                r#type: "Unparsable Server Response".to_string(),
                message: "Got unrecognized response from the server".to_string(),
                error: String::from_utf8_lossy(body).into_owned(),
            },
        }
    }
}

impl std::fmt::Display for ExceptionSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.r#type, self.message)
    }
}

/// Failures the server reported about a request. None of these are retried.
#[derive(thiserror::Error)]
pub enum RavenDbError {
    #[error("Invalid authorization, ensure valid certificate supplied. {0}")]
    BadAuthorization(String),
    #[error("Database `{0}` does not exist")]
    DatabaseDoesNotExist(String),
    #[error("Conflict on {url}: {schema}")]
    Conflict { url: String, schema: ExceptionSchema },
    #[error("The resource at {0} moved to another node and the refreshed topology still did not serve it")]
    Gone(String),
    #[error("Server responded to {url} with status {status}: {schema}")]
    ServerError {
        url: String,
        status: u16,
        schema: ExceptionSchema,
    },
    #[error(transparent)]
    UnexpectedError(#[from] anyhow::Error),
}
impl std::fmt::Debug for RavenDbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
