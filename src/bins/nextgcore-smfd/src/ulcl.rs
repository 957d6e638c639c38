//! Uplink Classifier
//!
//! UEs of a routing group get one extra data path per pre-configured
//! specific path. The branch leaves the default path at the classifier,
//! the last UPF both paths share, and ends at a second anchor (PSA2).
//! The classifier's branching rule is an uplink PDR on the default path's
//! F-TEID filtered on the specific path's destination.

use std::collections::HashSet;
use std::sync::Arc;

use crate::config::{SpecificPathConf, UeRoutingGroupConf};
use crate::datapath::DataPath;
use crate::error::{SmfError, SmfResult};
use crate::topology::{Topology, UpNode};

/// Branch insertion progress of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UlclState {
    /// Member of a routing group, branches not added yet
    #[default]
    Uninitialized,
    /// Branches are in the rule sets
    Added,
}

impl UlclState {
    pub fn name(&self) -> &'static str {
        match self {
            UlclState::Uninitialized => "UNINITIALIZED",
            UlclState::Added => "ADDED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SpecificPath {
    pub dest: String,
    pub dest_port: Option<String>,
    pub nodes: Vec<Arc<UpNode>>,
}

impl SpecificPath {
    /// SDF filter of the branching rule, in the downlink-oriented form the
    /// UPF expects
    pub fn flow_description(&self) -> String {
        match &self.dest_port {
            Some(port) => format!("permit out ip from {} {} to assigned", self.dest, port),
            None => format!("permit out ip from {} to assigned", self.dest),
        }
    }

    /// Index in `nodes` of the classifier: the last node of the common
    /// prefix with `default`. `None` when the paths do not share their
    /// first node or this path never leaves the default one.
    pub fn split_index(&self, default: &DataPath) -> Option<usize> {
        let shared = default
            .iter()
            .zip(&self.nodes)
            .take_while(|(a, b)| a.name() == b.name)
            .count();
        if shared == 0 || shared == self.nodes.len() {
            return None;
        }
        Some(shared - 1)
    }

    pub fn describe(&self) -> String {
        self.nodes.iter().map(|n| n.name.as_str()).collect::<Vec<_>>().join(" -> ")
    }
}

#[derive(Debug, Clone)]
pub struct UeRoutingGroup {
    pub name: String,
    members: HashSet<String>,
    pub paths: Vec<SpecificPath>,
}

/// Routing groups resolved against the topology
#[derive(Debug, Clone, Default)]
pub struct UeRouting {
    groups: Vec<UeRoutingGroup>,
}

impl UeRouting {
    pub fn build(conf: &[UeRoutingGroupConf], topology: &Topology) -> SmfResult<Self> {
        let mut groups = Vec::with_capacity(conf.len());
        for group in conf {
            let paths = group
                .specific_paths
                .iter()
                .map(|p| resolve_path(topology, p))
                .collect::<SmfResult<Vec<_>>>()
                .map_err(|e| SmfError::Config(format!("ue_routing [{}]: {}", group.name, e)))?;
            log::debug!(
                "UE routing group [{}]: {} member(s), {} path(s)",
                group.name,
                group.members.len(),
                paths.len()
            );
            groups.push(UeRoutingGroup {
                name: group.name.clone(),
                members: group.members.iter().cloned().collect(),
                paths,
            });
        }
        Ok(Self { groups })
    }

    /// First group listing `supi`
    pub fn group_of(&self, supi: &str) -> Option<&UeRoutingGroup> {
        self.groups.iter().find(|g| g.members.contains(supi))
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

fn resolve_path(topology: &Topology, conf: &SpecificPathConf) -> SmfResult<SpecificPath> {
    let nodes = conf
        .path
        .iter()
        .map(|name| match topology.node(name) {
            Some(node) if node.is_upf() => Ok(node),
            Some(_) => Err(SmfError::Config(format!("[{}] is not a UPF", name))),
            None => Err(SmfError::NotFound(format!("node [{}]", name))),
        })
        .collect::<SmfResult<Vec<_>>>()?;
    Ok(SpecificPath {
        dest: conf.dest.clone(),
        dest_port: conf.dest_port.clone(),
        nodes,
    })
}
