use serde::Deserialize;

use crate::server_node::ServerNode;

/// A versioned, ordered list of the nodes serving a database.
///
/// A topology is never edited in place. Updates build a new one and swap it in whole, so
/// anyone holding an `Arc<Topology>` keeps a consistent view.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Topology {
    /// Represents the latest version of the topology
    pub etag: i64,
    pub nodes: Vec<ServerNode>,
}

impl Topology {
    /// The topology has not been received from any server yet.
    pub const UNSET_ETAG: i64 = -1;
    /// The topology was fixed at construction and is never refreshed.
    pub const NO_UPDATES_ETAG: i64 = -2;

    pub fn new(etag: i64, nodes: Vec<ServerNode>) -> Self {
        Self { etag, nodes }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            etag: Topology::UNSET_ETAG,
            nodes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Topology;

    #[test]
    fn default_topology_is_unset_and_empty() {
        let topology = Topology::default();

        assert_eq!(topology.etag, Topology::UNSET_ETAG);
        assert!(topology.is_empty());
    }

    #[test]
    fn topology_deserializes_server_response() {
        let json = r#"{
            "Nodes": [
                {"Url":"http://a.example:8080","Database":"db","ClusterTag":"A","ServerRole":"Member"},
                {"Url":"http://b.example:8080","Database":"db","ClusterTag":"B","ServerRole":"Member"}
            ],
            "Etag": 12
        }"#;

        let topology: Topology = serde_json::from_str(json).unwrap();

        assert_eq!(topology.etag, 12);
        assert_eq!(topology.len(), 2);
        assert_eq!(topology.nodes[1].cluster_tag, "B");
    }
}
