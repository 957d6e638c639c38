//! SMF Configuration
//!
//! YAML configuration for the session core: PFCP endpoint, user plane
//! topology, UE address pools, retry timers, route profiles, PFDs and
//! the UE routing groups used for uplink classification.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{SmfError, SmfResult};

/// Default PFCP port (3GPP TS 29.244)
pub const PFCP_UDP_PORT: u16 = 8805;

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SmfConfig {
    pub smf: SmfConf,
    pub user_plane: UserPlaneConf,
    pub timers: TimersConf,
    pub route_profiles: HashMap<String, RouteProfileConf>,
    pub pfds: Vec<PfdConf>,
    pub ue_routing: Vec<UeRoutingGroupConf>,
}

/// SMF node parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmfConf {
    pub name: String,
    pub pfcp: PfcpConf,
    /// Upper bound on the wait for forwarding-node responses; unset means
    /// the wait relies on retry timers only.
    pub outcome_deadline_ms: Option<u64>,
    pub pfcp_retry: PfcpRetryConf,
    /// Insert uplink classifiers for members of `ue_routing` groups
    pub ulcl: bool,
}

impl Default for SmfConf {
    fn default() -> Self {
        Self {
            name: "SMF".to_string(),
            pfcp: PfcpConf::default(),
            outcome_deadline_ms: None,
            pfcp_retry: PfcpRetryConf::default(),
            ulcl: false,
        }
    }
}

impl SmfConf {
    pub fn outcome_deadline(&self) -> Option<Duration> {
        self.outcome_deadline_ms.map(Duration::from_millis)
    }
}

/// PFCP (N4) endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PfcpConf {
    pub addr: String,
    pub port: u16,
    pub node_id: String,
    /// Unanswered requests are forgotten after this long
    pub xact_lifetime_ms: u64,
}

impl Default for PfcpConf {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1".to_string(),
            port: PFCP_UDP_PORT,
            node_id: "127.0.0.1".to_string(),
            xact_lifetime_ms: 30_000,
        }
    }
}

/// Bounded retry for association setup and session establishment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PfcpRetryConf {
    pub max_retry: u32,
    pub backoff_ms: u64,
}

impl Default for PfcpRetryConf {
    fn default() -> Self {
        Self {
            max_retry: 3,
            backoff_ms: 1000,
        }
    }
}

/// User plane topology
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserPlaneConf {
    /// Nodes in declaration order; adjacency order follows `links` order.
    pub up_nodes: Vec<UpNodeConf>,
    pub links: Vec<UpLinkConf>,
}

/// One topology node
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UpNodeConf {
    pub name: String,
    /// "AN" or "UPF"
    #[serde(rename = "type")]
    pub node_type: String,
    /// Access node address
    pub an_ip: Option<String>,
    /// UPF PFCP node id (IPv4 address)
    pub node_id: Option<String>,
    pub snssai_infos: Vec<SnssaiUpfInfoConf>,
    pub interfaces: Vec<InterfaceUpfInfoConf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnssaiConf {
    pub sst: u8,
    /// Slice differentiator as 6 hex digits
    pub sd: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnssaiUpfInfoConf {
    pub snssai: SnssaiConf,
    pub dnn_upf_info_list: Vec<DnnUpfInfoConf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DnnUpfInfoConf {
    pub dnn: String,
    pub dnai_list: Vec<String>,
    pub pools: Vec<UeIpPoolConf>,
    pub static_pools: Vec<UeIpPoolConf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UeIpPoolConf {
    pub cidr: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceUpfInfoConf {
    /// "N3" or "N9"
    pub interface_type: String,
    pub endpoints: Vec<String>,
    pub network_instances: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpLinkConf {
    pub a: String,
    pub b: String,
}

/// Retry timer parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConf {
    pub enable: bool,
    pub expire_ms: u64,
    pub max_retry: u32,
}

impl Default for TimerConf {
    fn default() -> Self {
        Self {
            enable: true,
            expire_ms: 16_000,
            max_retry: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConf {
    pub t3591: TimerConf,
    pub t3592: TimerConf,
    pub pfcp_association: TimerConf,
    pub pfcp_heartbeat: TimerConf,
}

impl Default for TimersConf {
    fn default() -> Self {
        Self {
            t3591: TimerConf::default(),
            t3592: TimerConf::default(),
            pfcp_association: TimerConf {
                enable: true,
                expire_ms: 3_000,
                max_retry: 5,
            },
            pfcp_heartbeat: TimerConf {
                enable: true,
                expire_ms: 10_000,
                max_retry: 3,
            },
        }
    }
}

/// Route profile referenced by traffic control data
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteProfileConf {
    pub forwarding_policy_id: String,
}

/// Packet flow descriptions for one application id
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PfdConf {
    pub app_id: String,
    pub flow_descriptions: Vec<String>,
}

/// UEs sharing a set of pre-configured paths
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UeRoutingGroupConf {
    pub name: String,
    /// SUPIs
    pub members: Vec<String>,
    pub specific_paths: Vec<SpecificPathConf>,
}

/// Traffic towards `dest` leaves the default path along `path`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecificPathConf {
    /// Address or prefix, "10.100.100.0/24"
    pub dest: String,
    pub dest_port: Option<String>,
    /// UPF names from the access side to the second anchor
    pub path: Vec<String>,
}

impl SmfConfig {
    /// Parse a YAML document
    pub fn from_str(yaml: &str) -> SmfResult<Self> {
        let config: SmfConfig =
            serde_yaml::from_str(yaml).map_err(|e| SmfError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> SmfResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SmfError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_str(&content)
    }

    /// Structural checks that do not need the topology
    pub fn validate(&self) -> SmfResult<()> {
        let mut names = std::collections::HashSet::new();
        for node in &self.user_plane.up_nodes {
            if node.name.is_empty() {
                return Err(SmfError::Config("up_node without name".to_string()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(SmfError::Config(format!("duplicate up_node [{}]", node.name)));
            }
        }
        for group in &self.ue_routing {
            for specific in &group.specific_paths {
                if specific.dest.is_empty() || specific.path.is_empty() {
                    return Err(SmfError::Config(format!(
                        "ue_routing [{}]: specific path needs dest and path",
                        group.name
                    )));
                }
                if let Some(name) = specific.path.iter().find(|n| !names.contains(n.as_str())) {
                    return Err(SmfError::Config(format!(
                        "ue_routing [{}]: unknown up_node [{}]",
                        group.name, name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Find the PFDs configured for an application id
    pub fn find_pfd(&self, app_id: &str) -> Option<&PfdConf> {
        self.pfds.iter().find(|p| p.app_id == app_id)
    }
}
