//! Cluster configuration and builder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::elect_master::ElectionFilter;
use crate::error::{ClusterError, ClusterResult};

/// Configuration for a node's participation in Zen discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name; a join or published state with a mismatched name is
    /// rejected.
    pub cluster_name: String,

    /// How long a single ping wave or RPC waits for a reply.
    pub ping_timeout: Duration,

    /// How long a join attempt waits for the master's reply. Defaults to
    /// `20 * ping_timeout`.
    pub join_timeout: Duration,

    /// Maximum join attempts before the candidate gives up and returns to
    /// pinging.
    pub join_retry_attempts: u32,

    /// Delay between join retries.
    pub join_retry_delay: Duration,

    /// Master-eligible nodes required for a valid master (dynamic).
    pub minimum_master_nodes: usize,

    /// Whether losing a master triggers an automatic rejoin, versus a
    /// best-effort local re-election (dynamic).
    pub rejoin_on_master_gone: bool,

    /// Whether to send a best-effort leave notice on shutdown.
    pub send_leave_request: bool,

    /// Consecutive another-master pings from the same peer before
    /// triggering split-brain resolution.
    pub max_pings_from_another_master: u32,

    /// Probe interval and consecutive-failure threshold shared by
    /// `MasterFaultDetection` and `NodesFaultDetection`.
    pub fault_detection: FaultDetectionConfig,

    /// Election candidate filtering.
    pub master_election: MasterElectionConfig,

    /// Unicast peer discovery.
    pub discovery: DiscoveryConfig,
}

/// Fault-detection probe cadence, shared by both detectors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FaultDetectionConfig {
    /// Probe interval.
    pub interval: Duration,
    /// Consecutive failures before firing the failure callback.
    pub retry_count: u32,
}

impl Default for FaultDetectionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            retry_count: 3,
        }
    }
}

/// Master-election candidate filtering, mirroring [`ElectionFilter`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MasterElectionConfig {
    /// Exclude client-role nodes from the candidate set.
    pub filter_client: bool,
    /// Exclude data-only nodes from the candidate set.
    pub filter_data: bool,
}

impl Default for MasterElectionConfig {
    fn default() -> Self {
        Self {
            filter_client: true,
            filter_data: false,
        }
    }
}

impl From<MasterElectionConfig> for ElectionFilter {
    fn from(cfg: MasterElectionConfig) -> Self {
        Self {
            filter_client: cfg.filter_client,
            filter_data: cfg.filter_data,
        }
    }
}

/// Unicast peer-discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Discovery method.
    pub method: DiscoveryMethod,

    /// Configured seed hosts (`host:port` strings), always consulted
    /// regardless of `method`.
    pub unicast_hosts: Vec<String>,

    /// Width of the bounded unicast connect pool.
    pub concurrent_connects: usize,

    /// DNS discovery configuration, present when `method` is [`DiscoveryMethod::Dns`].
    pub dns: Option<DnsConfig>,
}

/// DNS service-discovery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS name to resolve for peer addresses.
    pub name: String,
    /// Port used for a bare A/AAAA lookup (no SRV records).
    pub default_port: u16,
}

/// Method for discovering unicast ping targets dynamically, on top of the
/// always-consulted `unicast_hosts` seed list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DiscoveryMethod {
    /// Only the configured seed list; no dynamic provider.
    #[default]
    Static,
    /// Resolve additional hosts from `dns`.
    Dns,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            method: DiscoveryMethod::Static,
            unicast_hosts: Vec::new(),
            concurrent_connects: 10,
            dns: None,
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let ping_timeout = Duration::from_secs(3);
        Self {
            cluster_name: "zen-cluster".to_owned(),
            ping_timeout,
            join_timeout: ping_timeout * 20,
            join_retry_attempts: 3,
            join_retry_delay: Duration::from_millis(100),
            minimum_master_nodes: 1,
            rejoin_on_master_gone: true,
            send_leave_request: true,
            max_pings_from_another_master: 3,
            fault_detection: FaultDetectionConfig::default(),
            master_election: MasterElectionConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Builder for [`ClusterConfig`].
#[derive(Debug, Default)]
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfig {
    /// Start building a configuration from defaults.
    #[must_use]
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder::default()
    }

    /// Validate the configuration. Called from both `build()` and the
    /// dynamic `reload()` entry point on the discovery controller.
    pub fn validate(&self) -> ClusterResult<()> {
        if self.cluster_name.is_empty() {
            return Err(ClusterError::ConfigError("cluster_name must not be empty".into()));
        }
        if self.join_retry_attempts == 0 {
            return Err(ClusterError::ConfigError(
                "join_retry_attempts must be at least 1".into(),
            ));
        }
        if self.minimum_master_nodes == 0 {
            return Err(ClusterError::ConfigError(
                "minimum_master_nodes must be at least 1".into(),
            ));
        }
        if self.max_pings_from_another_master == 0 {
            return Err(ClusterError::ConfigError(
                "max_pings_from_another_master must be at least 1".into(),
            ));
        }
        if self.fault_detection.retry_count == 0 {
            return Err(ClusterError::ConfigError(
                "fault_detection.retry_count must be at least 1".into(),
            ));
        }
        if self.discovery.method == DiscoveryMethod::Dns && self.discovery.dns.is_none() {
            return Err(ClusterError::ConfigError(
                "discovery.method is Dns but discovery.dns is not configured".into(),
            ));
        }
        Ok(())
    }
}

impl ClusterConfigBuilder {
    /// Set the cluster name.
    #[must_use]
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.config.cluster_name = name.into();
        self
    }

    /// Set `ping_timeout`. Does not touch `join_timeout`; call
    /// `join_timeout` explicitly if the `20x` default no longer applies.
    #[must_use]
    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    /// Set `join_timeout` directly.
    #[must_use]
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout = timeout;
        self
    }

    /// Set the join retry policy.
    #[must_use]
    pub fn join_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.config.join_retry_attempts = attempts;
        self.config.join_retry_delay = delay;
        self
    }

    /// Set `minimum_master_nodes`.
    #[must_use]
    pub fn minimum_master_nodes(mut self, n: usize) -> Self {
        self.config.minimum_master_nodes = n;
        self
    }

    /// Set `rejoin_on_master_gone`.
    #[must_use]
    pub fn rejoin_on_master_gone(mut self, value: bool) -> Self {
        self.config.rejoin_on_master_gone = value;
        self
    }

    /// Set `send_leave_request`.
    #[must_use]
    pub fn send_leave_request(mut self, value: bool) -> Self {
        self.config.send_leave_request = value;
        self
    }

    /// Set the fault-detection cadence.
    #[must_use]
    pub fn fault_detection(mut self, cfg: FaultDetectionConfig) -> Self {
        self.config.fault_detection = cfg;
        self
    }

    /// Set the election candidate filter.
    #[must_use]
    pub fn master_election(mut self, cfg: MasterElectionConfig) -> Self {
        self.config.master_election = cfg;
        self
    }

    /// Set the unicast seed host list.
    #[must_use]
    pub fn unicast_hosts(mut self, hosts: Vec<String>) -> Self {
        self.config.discovery.unicast_hosts = hosts;
        self
    }

    /// Set the unicast connect pool width.
    #[must_use]
    pub fn concurrent_connects(mut self, n: usize) -> Self {
        self.config.discovery.concurrent_connects = n;
        self
    }

    /// Switch to DNS-based dynamic discovery.
    #[must_use]
    pub fn dns_discovery(mut self, name: impl Into<String>, default_port: u16) -> Self {
        self.config.discovery.method = DiscoveryMethod::Dns;
        self.config.discovery.dns = Some(DnsConfig {
            name: name.into(),
            default_port,
        });
        self
    }

    /// Build the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn build(self) -> ClusterResult<ClusterConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.join_timeout, config.ping_timeout * 20);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = ClusterConfig::builder()
            .cluster_name("prod")
            .minimum_master_nodes(2)
            .unicast_hosts(vec!["127.0.0.1:9300".into(), "127.0.0.1:9301".into()])
            .build()
            .unwrap();

        assert_eq!(config.cluster_name, "prod");
        assert_eq!(config.minimum_master_nodes, 2);
        assert_eq!(config.discovery.unicast_hosts.len(), 2);
    }

    #[test]
    fn empty_cluster_name_is_rejected() {
        let result = ClusterConfig::builder().cluster_name("").build();
        assert!(result.is_err());
    }

    #[test]
    fn dns_discovery_without_dns_config_is_rejected() {
        let mut config = ClusterConfig::default();
        config.discovery.method = DiscoveryMethod::Dns;
        assert!(matches!(config.validate(), Err(ClusterError::ConfigError(_))));
    }

    #[test]
    fn dns_discovery_builder_sets_config() {
        let config = ClusterConfig::builder()
            .dns_discovery("peers.example.internal", 9300)
            .build()
            .unwrap();
        assert_eq!(config.discovery.method, DiscoveryMethod::Dns);
        assert_eq!(config.discovery.dns.unwrap().default_port, 9300);
    }
}
