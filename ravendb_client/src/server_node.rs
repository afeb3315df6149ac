use std::hash::{Hash, Hasher};

use serde::Deserialize;
use url::Url;

/// A single cluster member able to serve requests for one database.
///
/// Two nodes are the same node when they share a url and a database. The cluster tag and
/// role are informational and do not take part in equality.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerNode {
    pub url: Url,
    pub database: String,
    #[serde(default)]
    pub cluster_tag: String,
    #[serde(default)]
    pub server_role: ServerRole,
}

impl ServerNode {
    pub fn new(url: Url, database: String) -> Self {
        Self {
            url,
            database,
            cluster_tag: String::default(),
            server_role: ServerRole::default(),
        }
    }

    pub fn with_cluster_tag(mut self, cluster_tag: &str) -> Self {
        self.cluster_tag = cluster_tag.to_string();
        self
    }

    /// The url without a trailing slash, which is how request paths get appended to it.
    pub fn base_url(&self) -> &str {
        self.url.as_str().trim_end_matches('/')
    }
}

impl PartialEq for ServerNode {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.database == other.database
    }
}

impl Eq for ServerNode {}

impl Hash for ServerNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.database.hash(state);
    }
}

#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash, Deserialize)]
pub enum ServerRole {
    #[default]
    None,
    Promotable,
    Member,
    Rehab,
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use url::Url;

    use super::{ServerNode, ServerRole};

    #[test]
    fn nodes_with_same_url_and_database_are_equal_regardless_of_tag() {
        let url = Url::parse("http://a.example:8080").unwrap();
        let first = ServerNode::new(url.clone(), "db".to_string()).with_cluster_tag("A");
        let second = ServerNode::new(url, "db".to_string()).with_cluster_tag("!");

        assert_eq!(first, second);

        let mut set = HashSet::new();
        set.insert(first);
        assert!(set.contains(&second));
    }

    #[test]
    fn nodes_for_different_databases_differ() {
        let url = Url::parse("http://a.example:8080").unwrap();
        let first = ServerNode::new(url.clone(), "db1".to_string());
        let second = ServerNode::new(url, "db2".to_string());

        assert_ne!(first, second);
    }

    #[test]
    fn server_node_deserializes_from_pascal_case() {
        let json = r#"{"Url":"http://b.example:8080","Database":"db","ClusterTag":"B","ServerRole":"Member"}"#;

        let node: ServerNode = serde_json::from_str(json).unwrap();

        assert_eq!(node.cluster_tag, "B");
        assert_eq!(node.server_role, ServerRole::Member);
        assert_eq!(node.base_url(), "http://b.example:8080");
    }
}
