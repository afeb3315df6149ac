use std::time::Duration;

use serde::Deserialize;

use crate::commands::ClientConfiguration;

/// How read requests are spread over the nodes of a topology. Writes always go to the
/// preferred node.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
pub enum ReadBalanceBehavior {
    /// Everything goes to the preferred node.
    #[default]
    None,
    /// Each session sticks to `nodes[session_id % nodes.len()]`.
    RoundRobin,
    /// Reads go to whichever node answered a speed test first.
    FastestNode,
}

#[derive(Clone, Debug)]
pub struct DocumentConventions {
    disable_topology_updates: bool,
    read_balance_behavior: ReadBalanceBehavior,
    max_http_cache_size: usize,
    max_number_of_requests_per_session: u32,
    topology_refresh_interval: Duration,
    speed_test_interval: Duration,
    /// Values the user configured, kept while a server-side client configuration overrides them.
    original_configuration: Option<OriginalConfiguration>,
}

#[derive(Clone, Copy, Debug)]
struct OriginalConfiguration {
    read_balance_behavior: ReadBalanceBehavior,
    max_number_of_requests_per_session: u32,
}

impl Default for DocumentConventions {
    fn default() -> Self {
        Self {
            disable_topology_updates: false,
            read_balance_behavior: ReadBalanceBehavior::None,
            max_http_cache_size: 128 * 1024 * 1024,
            max_number_of_requests_per_session: 30,
            topology_refresh_interval: Duration::from_secs(5 * 60),
            speed_test_interval: Duration::from_secs(60),
            original_configuration: None,
        }
    }
}

// Mutators
impl DocumentConventions {
    pub fn set_disable_topology_updates(mut self, disable: bool) -> Self {
        self.disable_topology_updates = disable;
        self
    }

    pub fn set_read_balance_behavior(mut self, behavior: ReadBalanceBehavior) -> Self {
        self.read_balance_behavior = behavior;
        self
    }

    pub fn set_max_http_cache_size(mut self, bytes: usize) -> Self {
        self.max_http_cache_size = bytes;
        self
    }

    pub fn set_max_number_of_requests_per_session(mut self, max: u32) -> Self {
        self.max_number_of_requests_per_session = max;
        self
    }

    pub fn set_topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.topology_refresh_interval = interval;
        self
    }

    pub fn set_speed_test_interval(mut self, interval: Duration) -> Self {
        self.speed_test_interval = interval;
        self
    }

    /// Applies a client configuration pushed by the server.
    ///
    /// The first override remembers the locally configured values. A configuration marked
    /// `disabled` puts those values back.
    pub fn update_from(&mut self, configuration: &ClientConfiguration) {
        if configuration.disabled {
            if let Some(original) = self.original_configuration.take() {
                self.read_balance_behavior = original.read_balance_behavior;
                self.max_number_of_requests_per_session =
                    original.max_number_of_requests_per_session;
            }
            return;
        }

        let original = *self
            .original_configuration
            .get_or_insert(OriginalConfiguration {
                read_balance_behavior: self.read_balance_behavior,
                max_number_of_requests_per_session: self.max_number_of_requests_per_session,
            });

        self.read_balance_behavior = configuration
            .read_balance_behavior
            .unwrap_or(original.read_balance_behavior);
        self.max_number_of_requests_per_session = configuration
            .max_number_of_requests_per_session
            .unwrap_or(original.max_number_of_requests_per_session);
    }
}

// Getters
impl DocumentConventions {
    pub fn disable_topology_updates(&self) -> bool {
        self.disable_topology_updates
    }

    pub fn read_balance_behavior(&self) -> ReadBalanceBehavior {
        self.read_balance_behavior
    }

    pub fn max_http_cache_size(&self) -> usize {
        self.max_http_cache_size
    }

    pub fn max_number_of_requests_per_session(&self) -> u32 {
        self.max_number_of_requests_per_session
    }

    pub fn topology_refresh_interval(&self) -> Duration {
        self.topology_refresh_interval
    }

    pub fn speed_test_interval(&self) -> Duration {
        self.speed_test_interval
    }
}

#[cfg(test)]
mod tests {
    use crate::commands::ClientConfiguration;

    use super::{DocumentConventions, ReadBalanceBehavior};

    #[test]
    fn server_configuration_overrides_and_disabled_restores() {
        // Arrange
        let mut conventions = DocumentConventions::default()
            .set_read_balance_behavior(ReadBalanceBehavior::RoundRobin)
            .set_max_number_of_requests_per_session(10);

        // Act
        conventions.update_from(&ClientConfiguration {
            etag: 1,
            disabled: false,
            read_balance_behavior: Some(ReadBalanceBehavior::FastestNode),
            max_number_of_requests_per_session: None,
        });

        // Assert
        assert_eq!(
            conventions.read_balance_behavior(),
            ReadBalanceBehavior::FastestNode
        );
        assert_eq!(conventions.max_number_of_requests_per_session(), 10);

        // Act
        conventions.update_from(&ClientConfiguration {
            etag: 2,
            disabled: true,
            read_balance_behavior: None,
            max_number_of_requests_per_session: Some(99),
        });

        // Assert
        assert_eq!(
            conventions.read_balance_behavior(),
            ReadBalanceBehavior::RoundRobin
        );
        assert_eq!(conventions.max_number_of_requests_per_session(), 10);
    }

    #[test]
    fn disabled_configuration_without_override_changes_nothing() {
        let mut conventions = DocumentConventions::default();

        conventions.update_from(&ClientConfiguration {
            etag: 1,
            disabled: true,
            read_balance_behavior: Some(ReadBalanceBehavior::RoundRobin),
            max_number_of_requests_per_session: Some(1),
        });

        assert_eq!(conventions.read_balance_behavior(), ReadBalanceBehavior::None);
        assert_eq!(conventions.max_number_of_requests_per_session(), 30);
    }
}
