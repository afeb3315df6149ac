//! Commands the client needs for its own bookkeeping, plus plain document reads.
mod get_client_configuration;
mod get_database_topology;
mod get_documents;
mod get_statistics;

pub use get_client_configuration::*;
pub use get_database_topology::*;
pub use get_documents::*;
pub use get_statistics::*;

use url::Url;

use crate::server_node::ServerNode;

/// Joins `path` onto the node's url and appends the query pairs, percent-encoding them.
pub(crate) fn node_url(
    node: &ServerNode,
    path: &str,
    query: &[(&str, String)],
) -> anyhow::Result<Url> {
    let mut url = Url::parse(&format!("{}{}", node.base_url(), path))?;
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in query {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use url::Url;

    use crate::server_node::ServerNode;

    use super::node_url;

    #[test]
    fn node_url_joins_path_and_encodes_query() {
        let node = ServerNode::new(
            Url::parse("http://a.example:8080").unwrap(),
            "db".to_string(),
        );

        let url = node_url(&node, "/databases/db/docs", &[("id", "users/1 a".to_string())])
            .unwrap();

        assert_eq!(
            url.as_str(),
            "http://a.example:8080/databases/db/docs?id=users%2F1+a"
        );
    }
}
