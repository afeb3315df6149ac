use std::{collections::HashMap, fs::File, io::Read, net::SocketAddr};

use tracing::instrument;
use url::Url;

use crate::{
    document_conventions::DocumentConventions, request_executor::GLOBAL_HTTP_CLIENT_TIMEOUT,
    DnsOverrides, DocumentStore, DocumentStoreError, DocumentStoreInitialConfiguration,
};

#[derive(Debug, Default)]
pub struct DocumentStoreBuilder {
    client_certificate_path: Option<String>,
    conventions: DocumentConventions,
    database_name: Option<String>,
    dns_overrides: Option<DnsOverrides>,
    document_store_urls: Vec<String>,
    proxy_address: Option<String>,
}

impl DocumentStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_dns_overrides(mut self, overrides: DnsOverrides) -> Self {
        tracing::trace!("Adding to dns_overrides: {:?}", &overrides);
        self.dns_overrides = Some(overrides);
        self
    }

    pub fn set_client_certificate(mut self, certificate_path: &str) -> Self {
        self.client_certificate_path = Some(certificate_path.to_string());
        self
    }

    pub fn set_conventions(mut self, conventions: DocumentConventions) -> Self {
        self.conventions = conventions;
        self
    }

    pub fn set_proxy_address(mut self, proxy_address: &str) -> Self {
        self.proxy_address = Some(proxy_address.to_string());
        self
    }

    pub fn set_urls<T>(mut self, urls: &[T]) -> Self
    where
        T: AsRef<str>,
    {
        for u in urls {
            self.document_store_urls.push(u.as_ref().to_string());
        }
        self
    }

    pub fn set_database_name(mut self, database_name: &str) -> Self {
        self.database_name = Some(database_name.to_string());
        self
    }

    /// Initializes a new [`DocumentStoreActor`](crate::DocumentStoreActor) and returns a handle
    /// to it.
    ///
    /// Each call to this will create a new actor and a new connection pool. It is not
    /// recommended to create more than one per database cluster. This function is allowed to be
    /// called more than once so the builder can act as a template after being set up once.
    #[instrument(level = "debug", name = "Build DocumentStoreBuilder", skip(self))]
    pub fn build(&self) -> Result<DocumentStore, DocumentStoreError> {
        // Ensure DocumentStore URLs are valid and there is at least one
        if self.document_store_urls.is_empty() {
            tracing::error!(
                "No URLs were supplied and a document store can't exist without at least one"
            );
            return Err(DocumentStoreError::MissingUrlsError);
        }

        let initial_urls = validate_urls(
            self.document_store_urls.as_slice(),
            self.client_certificate_path.is_some(),
        )?;

        let identity = match &self.client_certificate_path {
            Some(certpath) => Some(load_identity(certpath)?),
            None => None,
        };

        let client = self.build_client(identity)?;

        // Create an initial configuration for the DocumentStoreActor
        let initial_config = DocumentStoreInitialConfiguration {
            client,
            conventions: self.conventions.clone(),
            database_name: self.database_name.clone(),
            initial_urls,
        };

        tracing::trace!("Initial Configuration: {:?}", &initial_config);

        Ok(DocumentStore::new(initial_config))
    }

    /// Builds the connection pool every request executor of the store sends through.
    fn build_client(&self, identity: Option<reqwest::Identity>) -> anyhow::Result<reqwest::Client> {
        let mut client = reqwest::Client::builder().timeout(GLOBAL_HTTP_CLIENT_TIMEOUT);

        if let Some(identity) = identity {
            client = client.identity(identity).use_rustls_tls();
        }

        // Convert Option<HashMap<String, IpAddr>> into HashMap<String,SocketAddr>
        let overrides = self
            .dns_overrides
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, SocketAddr::new(v, 0)))
            .collect::<HashMap<String, SocketAddr>>();

        for (domain, address) in overrides {
            tracing::trace!(
                "Adding `{}->{}` to dns overrides for this client.",
                domain,
                address
            );
            client = client.resolve(domain.as_str(), address);
        }

        if let Some(proxy) = &self.proxy_address {
            tracing::trace!("Proxy set to `{}`", proxy);
            client = client.proxy(reqwest::Proxy::http(proxy)?);
        } else {
            tracing::trace!("No proxy defined. Using system settings.");
        }

        Ok(client.build()?)
    }
}

/// Opens and validates the certificate at `certpath`, and creates an identity from it.
fn load_identity(certpath: &str) -> anyhow::Result<reqwest::Identity> {
    let mut buf = Vec::new();
    File::open(certpath)
        .map_err(|e| {
            let err = anyhow::anyhow!("Failed to open certificate file. Caused by: {}", e);
            tracing::error!("{}", &err);
            err
        })?
        .read_to_end(&mut buf)
        .map_err(|e| {
            let err = anyhow::anyhow!("File was opened but unable to read. Caused by: {}", e);
            tracing::error!("{}", err);
            err
        })?;
    reqwest::Identity::from_pem(&buf).map_err(|e| {
        let err = anyhow::anyhow!("Invalid pem file. Caused by: {}", e);
        tracing::error!("{}", err);
        err
    })
}

/// Converts the provided URL strings to a [`Vec`] of [`Url`] in the order given, dropping
/// duplicates and trailing slashes.
///
/// Also ensures all provided URL strings use the same scheme: https when a client certificate
/// is used, http otherwise, never both within the list.
#[instrument(level = "debug", name = "Validate URLs")]
fn validate_urls<T: std::fmt::Debug>(urls: &[T], require_https: bool) -> anyhow::Result<Vec<Url>>
where
    T: AsRef<str>,
{
    let desired_scheme = if require_https { "https" } else { "http" };

    let mut clean_urls: Vec<Url> = Vec::with_capacity(urls.len());
    for url in urls {
        let trimmed = url.as_ref().trim().trim_end_matches('/');
        let url = Url::parse(trimmed)
            .map_err(|e| anyhow::anyhow!("`{}` is not a valid url. Caused by: {}", trimmed, e))?;

        if url.scheme() != desired_scheme {
            return Err(anyhow::anyhow!("Url does not have correct scheme: {}", url));
        }

        if !clean_urls.contains(&url) {
            clean_urls.push(url);
        }
    }

    Ok(clean_urls)
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use url::Url;

    use crate::{DocumentStoreBuilder, DocumentStoreError};

    use super::validate_urls;

    #[test]
    fn validate_urls_returns_urls_in_order_for_http_strings() {
        // Arrange
        let baseline_urls = vec![
            Url::parse("http://starwars.com").unwrap(),
            Url::parse("http://google.com").unwrap(),
        ];

        let urls = vec!["http://starwars.com/", "http://google.com"];

        // Act
        let result = validate_urls(urls.as_slice(), false).unwrap();

        // Assert
        assert_eq!(result, baseline_urls);
    }

    #[test]
    fn validate_urls_returns_urls_for_https_strings() {
        // Arrange
        let baseline_urls = vec![
            Url::parse("https://starwars.com").unwrap(),
            Url::parse("https://google.com").unwrap(),
        ];

        let urls = vec!["https://starwars.com", "https://google.com"];

        // Act
        let result = validate_urls(urls.as_slice(), true).unwrap();

        // Assert
        assert_eq!(result, baseline_urls);
    }

    #[test]
    fn validate_urls_drops_duplicates() {
        let urls = vec!["http://a.example:8080", "http://a.example:8080/"];

        let result = validate_urls(urls.as_slice(), false).unwrap();

        assert_eq!(result.len(), 1);
    }

    #[test]
    fn validate_urls_fails_for_mixed_http_and_https_strings() {
        // Arrange
        let urls = vec!["https://starwars.com", "http://google.com"];

        // Assert
        assert!(validate_urls(urls.as_slice(), true).is_err());
        assert!(validate_urls(urls.as_slice(), false).is_err());
    }

    #[test]
    fn validate_urls_fails_for_unparsable_string() {
        let urls = vec!["http://starwars.com", "not a url"];

        assert!(validate_urls(urls.as_slice(), false).is_err());
    }

    #[tokio::test]
    async fn documentstorebuilder_build_succeeds_for_valid_configuration() {
        // Arrange
        let urls = ["http://localhost:8080"];

        let document_store = DocumentStoreBuilder::new()
            .set_urls(&urls)
            .set_database_name("db")
            .build();

        // Assert
        assert!(document_store.is_ok());
    }

    #[tokio::test]
    async fn documentstorebuilder_build_fails_for_missing_certificate() {
        // Arrange
        let urls = ["https://localhost:8080"];

        let document_store = DocumentStoreBuilder::new()
            .set_client_certificate("does-not-exist.pem")
            .set_urls(&urls)
            .build();

        // Assert
        assert!(document_store.is_err());
    }

    #[tokio::test]
    async fn documentstorebuilder_build_fails_for_invalid_pem() {
        // Arrange
        let urls = ["https://localhost:8080"];

        let document_store = DocumentStoreBuilder::new()
            // Cargo.toml is not a valid PEM file
            .set_client_certificate("Cargo.toml")
            .set_urls(&urls)
            .build();

        // Assert
        assert!(document_store.is_err());
    }

    #[tokio::test]
    async fn documentstorebuilder_build_fails_if_no_urls() {
        let document_store = DocumentStoreBuilder::new().build();

        assert!(
            document_store.is_err()
                && matches!(document_store, Err(DocumentStoreError::MissingUrlsError))
        );
    }
}
