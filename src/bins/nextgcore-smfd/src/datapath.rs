//! Data Paths
//!
//! A data path is the chain of UPFs a session's traffic crosses, from the
//! access side to the DN anchor. Each path node carries an uplink and a
//! downlink tunnel endpoint; the PDR/FAR/QER records those endpoints point
//! at live in the session's per-node rule sets.
//!
//! Activation runs in two passes: ids and tunnel endpoints are allocated on
//! every node first, then FARs are wired to the neighbor endpoints.
//!
//! A branch path starts at an uplink classifier on the default path. Its
//! first node takes the uplink F-TEID the default path already receives on
//! and narrows it with an SDF filter; downlink goes back the way the
//! default path does.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::error::{SmfError, SmfResult};
use crate::n4_build::{apply_action, interface};
use crate::rule::{
    Far, ForwardingParameters, Fteid, OuterHeaderCreation, Pdr, Qer, RetiredIds, RuleSet,
    OUTER_HEADER_REMOVAL_GTPU_UDP_IPV4,
};
use crate::topology::{InterfaceType, UpNode, UpNodeType};

/// Rule sets of one session keyed by node name
pub type NodeRuleSets = BTreeMap<String, RuleSet>;

/// Default PDR precedence for the default path
pub const DEFAULT_PRECEDENCE: u32 = 255;

/// PDR precedence of uplink classifier branches
pub const ULCL_PRECEDENCE: u32 = 30;

// ============================================================================
// Path nodes
// ============================================================================

/// AN side N3 tunnel endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnTunnel {
    pub teid: u32,
    pub ipv4: Ipv4Addr,
}

/// One direction of a path node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelEndpoint {
    pub teid: Option<u32>,
    pub ipv4: Option<Ipv4Addr>,
    pub pdr_id: Option<u16>,
    pub far_id: Option<u32>,
}

/// Where a branch path hangs off the default path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchPoint {
    /// Uplink F-TEID of the classifier on the default path
    pub ul_fteid: Fteid,
    pub ul_source_interface: u8,
    /// Downlink hop towards the access side; the AN tunnel when absent
    pub dl_target: Option<OuterHeaderCreation>,
}

impl TunnelEndpoint {
    fn fteid(&self) -> Option<Fteid> {
        Some(Fteid {
            teid: self.teid?,
            ipv4: self.ipv4?,
        })
    }

    fn ohc(&self) -> Option<OuterHeaderCreation> {
        Some(OuterHeaderCreation::gtpu(self.teid?, self.ipv4?))
    }
}

#[derive(Debug, Clone)]
pub struct PathNode {
    pub upf: Arc<UpNode>,
    pub prev: Option<usize>,
    pub next: Option<usize>,
    pub ul: TunnelEndpoint,
    pub dl: TunnelEndpoint,
    pub qer_id: Option<u32>,
}

impl PathNode {
    pub fn name(&self) -> &str {
        &self.upf.name
    }

    /// Node that only terminates the radio side; it carries uplink rules only
    pub fn is_access_node(&self) -> bool {
        self.upf.node_type == UpNodeType::An
    }

    /// No further hop towards the DN
    pub fn is_anchor(&self) -> bool {
        self.next.is_none()
    }
}

/// Per-activation parameters
#[derive(Debug, Clone, Default)]
pub struct PathParams {
    pub precedence: u32,
    pub dnn: String,
    pub ue_ip: Option<Ipv4Addr>,
    pub qfi: u8,
    /// Session AMBR in kbps
    pub ambr_ul: u64,
    pub ambr_dl: u64,
    pub sdf_filter: Option<String>,
    pub application_id: Option<String>,
    pub an_tunnel: Option<AnTunnel>,
}

// ============================================================================
// Data Path
// ============================================================================

#[derive(Debug, Clone)]
pub struct DataPath {
    pub id: u32,
    pub nodes: Vec<PathNode>,
    pub activated: bool,
    pub is_default: bool,
    pub pcc_rule_id: Option<String>,
    pub branch: Option<BranchPoint>,
}

impl DataPath {
    /// Link one path node per UPF. The first node has no predecessor and
    /// the last no successor.
    pub fn generate(upfs: &[Arc<UpNode>]) -> SmfResult<Self> {
        if upfs.is_empty() {
            return Err(SmfError::NotFound("empty user plane path".to_string()));
        }
        let last = upfs.len() - 1;
        let nodes = upfs
            .iter()
            .enumerate()
            .map(|(i, upf)| PathNode {
                upf: upf.clone(),
                prev: i.checked_sub(1),
                next: (i < last).then_some(i + 1),
                ul: TunnelEndpoint::default(),
                dl: TunnelEndpoint::default(),
                qer_id: None,
            })
            .collect();
        Ok(Self {
            id: 0,
            nodes,
            activated: false,
            is_default: false,
            pcc_rule_id: None,
            branch: None,
        })
    }

    /// Attachment for a branch leaving this path at node `name`
    pub fn branch_point_at(&self, name: &str) -> Option<BranchPoint> {
        let node = self.nodes.iter().find(|n| n.name() == name)?;
        let dl_target = match node.prev {
            Some(prev) => Some(self.nodes[prev].dl.ohc()?),
            None => None,
        };
        Some(BranchPoint {
            ul_fteid: node.ul.fteid()?,
            ul_source_interface: if node.prev.is_none() {
                interface::ACCESS
            } else {
                interface::CORE
            },
            dl_target,
        })
    }

    /// The first node's uplink F-TEID belongs to the default path
    fn shares_ul_fteid(&self, i: usize) -> bool {
        self.branch.is_some() && self.nodes[i].prev.is_none()
    }

    pub fn first(&self) -> Option<&PathNode> {
        self.nodes.iter().find(|n| n.prev.is_none())
    }

    pub fn anchor(&self) -> Option<&PathNode> {
        self.nodes.iter().find(|n| n.next.is_none())
    }

    /// Walk from the first node following `next`
    pub fn iter(&self) -> PathIter<'_> {
        PathIter {
            path: self,
            cur: self.nodes.iter().position(|n| n.prev.is_none()),
        }
    }

    pub fn describe(&self) -> String {
        self.iter().map(|n| n.name().to_string()).collect::<Vec<_>>().join(" -> ")
    }

    /// Create rules on every node. A second call on an activated path is a
    /// no-op.
    pub fn activate(&mut self, rules: &mut NodeRuleSets, params: &PathParams) -> SmfResult<()> {
        if self.activated {
            return Ok(());
        }

        // Pass 1: ids and local tunnel endpoints
        for i in 0..self.nodes.len() {
            if let Err(e) = self.allocate_node(i, &params.dnn) {
                for j in 0..=i {
                    self.release_node_ids(j);
                }
                log::error!("Data path [{}] activation failed: {}", self.describe(), e);
                return Err(e);
            }
        }

        // Pass 2: rules wired to neighbor endpoints
        for i in 0..self.nodes.len() {
            self.install_node_rules(i, rules, params);
        }

        self.activated = true;
        log::debug!(
            "Data path [{}] activated (precedence {})",
            self.describe(),
            params.precedence
        );
        Ok(())
    }

    fn allocate_node(&mut self, i: usize, dnn: &str) -> SmfResult<()> {
        let node = &self.nodes[i];
        let upf = node.upf.clone();
        let has_prev = node.prev.is_some();
        let with_dl = !node.is_access_node();
        let dl_tunnel = with_dl && !node.is_anchor();

        let ul_if = if has_prev { InterfaceType::N9 } else { InterfaceType::N3 };
        let ul_ip = upf.interface_ipv4(ul_if, dnn);
        let dl_ip = upf.interface_ipv4(InterfaceType::N9, dnn);

        let mut ul = TunnelEndpoint {
            ipv4: ul_ip,
            ..Default::default()
        };
        let mut dl = TunnelEndpoint::default();
        let mut qer_id = None;
        let shared = match self.branch {
            Some(branch) if self.nodes[i].prev.is_none() => Some(branch.ul_fteid),
            _ => None,
        };

        let result = (|| -> SmfResult<()> {
            let mut ids = upf.ids();
            match shared {
                Some(fteid) => {
                    ul.teid = Some(fteid.teid);
                    ul.ipv4 = Some(fteid.ipv4);
                }
                None => ul.teid = Some(ids.alloc_teid()?),
            }
            ul.pdr_id = Some(ids.alloc_pdr_id()?);
            ul.far_id = Some(ids.alloc_far_id()?);
            if with_dl {
                dl.pdr_id = Some(ids.alloc_pdr_id()?);
                dl.far_id = Some(ids.alloc_far_id()?);
                if dl_tunnel {
                    dl.teid = Some(ids.alloc_teid()?);
                    dl.ipv4 = dl_ip;
                }
            }
            qer_id = Some(ids.alloc_qer_id()?);
            Ok(())
        })();

        let node = &mut self.nodes[i];
        node.ul = ul;
        node.dl = dl;
        node.qer_id = qer_id;
        result
    }

    fn node_ids(&self, i: usize) -> RetiredIds {
        let node = &self.nodes[i];
        let ul_teid = node.ul.teid.filter(|_| !self.shares_ul_fteid(i));
        RetiredIds {
            pdr: [node.ul.pdr_id, node.dl.pdr_id].into_iter().flatten().collect(),
            far: [node.ul.far_id, node.dl.far_id].into_iter().flatten().collect(),
            qer: node.qer_id.into_iter().collect(),
            bar: Vec::new(),
            teid: [ul_teid, node.dl.teid].into_iter().flatten().collect(),
        }
    }

    fn release_node_ids(&mut self, i: usize) {
        let ids = self.node_ids(i);
        self.nodes[i].upf.ids().release(&ids);
        let node = &mut self.nodes[i];
        node.ul = TunnelEndpoint::default();
        node.dl = TunnelEndpoint::default();
        node.qer_id = None;
    }

    fn install_node_rules(&self, i: usize, rules: &mut NodeRuleSets, params: &PathParams) {
        let node = &self.nodes[i];
        let set = rules.entry(node.name().to_string()).or_default();
        let network_instance = Some(params.dnn.clone());
        let qer_ids: Vec<u32> = node.qer_id.into_iter().collect();

        if let Some(qer_id) = node.qer_id {
            set.qers.insert(Qer {
                id: qer_id,
                qfi: params.qfi,
                mbr_ul: params.ambr_ul,
                mbr_dl: params.ambr_dl,
                state: Default::default(),
            });
        }

        // Uplink
        if let (Some(pdr_id), Some(far_id)) = (node.ul.pdr_id, node.ul.far_id) {
            let mut pdr = Pdr::new(pdr_id, far_id, params.precedence);
            pdr.pdi.source_interface = match (node.prev, self.branch) {
                (None, Some(branch)) => branch.ul_source_interface,
                (None, None) => interface::ACCESS,
                (Some(_), _) => interface::CORE,
            };
            pdr.pdi.local_fteid = node.ul.fteid();
            pdr.shared_fteid = self.shares_ul_fteid(i);
            pdr.pdi.network_instance = network_instance.clone();
            pdr.pdi.ue_ip_address = params.ue_ip;
            pdr.pdi.sdf_filter = params.sdf_filter.clone();
            pdr.pdi.application_id = params.application_id.clone();
            pdr.outer_header_removal = Some(OUTER_HEADER_REMOVAL_GTPU_UDP_IPV4);
            pdr.qer_ids = qer_ids.clone();
            set.pdrs.insert(pdr);

            let mut far = Far::new(far_id);
            far.forwarding_parameters = Some(match node.next {
                Some(next) => ForwardingParameters {
                    destination_interface: interface::CORE,
                    network_instance: network_instance.clone(),
                    outer_header_creation: self.nodes[next].ul.ohc(),
                    forwarding_policy_id: None,
                },
                None => ForwardingParameters {
                    destination_interface: interface::CORE,
                    network_instance: network_instance.clone(),
                    outer_header_creation: None,
                    forwarding_policy_id: None,
                },
            });
            set.fars.insert(far);
        }

        // Downlink
        if let (Some(pdr_id), Some(far_id)) = (node.dl.pdr_id, node.dl.far_id) {
            let mut pdr = Pdr::new(pdr_id, far_id, params.precedence);
            pdr.pdi.source_interface = interface::CORE;
            pdr.pdi.network_instance = network_instance.clone();
            pdr.pdi.sdf_filter = params.sdf_filter.clone();
            pdr.pdi.application_id = params.application_id.clone();
            if node.is_anchor() {
                pdr.pdi.ue_ip_address = params.ue_ip;
            } else {
                pdr.pdi.local_fteid = node.dl.fteid();
                pdr.outer_header_removal = Some(OUTER_HEADER_REMOVAL_GTPU_UDP_IPV4);
            }
            pdr.qer_ids = qer_ids;
            set.pdrs.insert(pdr);

            let target = match node.prev {
                Some(prev) => self.nodes[prev].dl.ohc(),
                None => self.branch.and_then(|b| b.dl_target).or_else(|| {
                    params
                        .an_tunnel
                        .map(|an| OuterHeaderCreation::gtpu(an.teid, an.ipv4))
                }),
            };
            let far = match target {
                Some(ohc) => {
                    let mut far = Far::new(far_id);
                    far.forwarding_parameters = Some(ForwardingParameters {
                        destination_interface: interface::ACCESS,
                        network_instance,
                        outer_header_creation: Some(ohc),
                        forwarding_policy_id: None,
                    });
                    far
                }
                None => Far::buffering(far_id),
            };
            set.fars.insert(far);
        }
    }

    /// Mark every rule of the path for removal. Rules never sent are
    /// dropped and their ids returned to the node at once; the others keep
    /// their ids until the node confirms the removal.
    pub fn deactivate(&mut self, rules: &mut NodeRuleSets) {
        if !self.activated {
            return;
        }
        let branch = self.branch.is_some();
        for node in &mut self.nodes {
            let mut unsent = RetiredIds::default();
            let ul_teid = node.ul.teid.filter(|_| !(branch && node.prev.is_none()));
            if let Some(set) = rules.get_mut(node.upf.name.as_str()) {
                for (ep, teid) in [(&node.ul, ul_teid), (&node.dl, node.dl.teid)] {
                    if let Some(pdr_id) = ep.pdr_id {
                        if set.pdrs.mark_remove(pdr_id).is_some() {
                            unsent.pdr.push(pdr_id);
                            unsent.teid.extend(teid);
                        }
                    }
                    if let Some(far_id) = ep.far_id {
                        if set.fars.mark_remove(far_id).is_some() {
                            unsent.far.push(far_id);
                        }
                    }
                }
                if let Some(qer_id) = node.qer_id {
                    if set.qers.mark_remove(qer_id).is_some() {
                        unsent.qer.push(qer_id);
                    }
                }
            }
            if !unsent.is_empty() {
                node.upf.ids().release(&unsent);
            }
            node.ul = TunnelEndpoint::default();
            node.dl = TunnelEndpoint::default();
            node.qer_id = None;
        }
        self.activated = false;
        log::debug!("Data path [{}] deactivated", self.describe());
    }

    /// Point the access side downlink FAR at the AN tunnel, or back to
    /// buffering when the tunnel is gone. Returns whether a FAR changed.
    pub fn set_an_tunnel(&self, rules: &mut NodeRuleSets, an: Option<AnTunnel>) -> bool {
        // A branch off a mid-path classifier sends downlink over N9
        if self.branch.is_some_and(|b| b.dl_target.is_some()) {
            return false;
        }
        let Some(first) = self.first() else {
            return false;
        };
        let Some(far_id) = first.dl.far_id else {
            return false;
        };
        let Some(far) = rules
            .get_mut(first.upf.name.as_str())
            .and_then(|set| set.fars.get_mut(far_id))
        else {
            return false;
        };

        match an {
            Some(an) => {
                far.apply_action = apply_action::FORW;
                let params = far.forwarding_parameters.get_or_insert_with(Default::default);
                params.destination_interface = interface::ACCESS;
                params.outer_header_creation = Some(OuterHeaderCreation::gtpu(an.teid, an.ipv4));
            }
            None => {
                far.apply_action = apply_action::BUFF | apply_action::NOCP;
                if let Some(params) = far.forwarding_parameters.as_mut() {
                    params.outer_header_creation = None;
                }
            }
        }
        rules
            .get_mut(first.upf.name.as_str())
            .map(|set| set.fars.mark_update(far_id))
            .unwrap_or(false)
    }

    /// The anchor's N6 side FAR
    pub fn anchor_ul_far_mut<'a>(&self, rules: &'a mut NodeRuleSets) -> Option<&'a mut Far> {
        let anchor = self.anchor()?;
        let far_id = anchor.ul.far_id?;
        rules.get_mut(anchor.upf.name.as_str())?.fars.get_mut(far_id)
    }
}

pub struct PathIter<'a> {
    path: &'a DataPath,
    cur: Option<usize>,
}

impl<'a> Iterator for PathIter<'a> {
    type Item = &'a PathNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.path.nodes[self.cur?];
        self.cur = node.next;
        Some(node)
    }
}

// ============================================================================
// UP Tunnel
// ============================================================================

/// All data paths of one session
#[derive(Debug, Clone, Default)]
pub struct UpTunnel {
    pub data_paths: BTreeMap<u32, DataPath>,
    next_path_id: u32,
    pub an_tunnel: Option<AnTunnel>,
}

impl UpTunnel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_data_path(&mut self, mut path: DataPath) -> u32 {
        self.next_path_id += 1;
        path.id = self.next_path_id;
        self.data_paths.insert(path.id, path);
        self.next_path_id
    }

    pub fn remove_data_path(&mut self, id: u32) -> Option<DataPath> {
        self.data_paths.remove(&id)
    }

    pub fn default_path(&self) -> Option<&DataPath> {
        self.data_paths.values().find(|p| p.is_default)
    }

    pub fn branches(&self) -> impl Iterator<Item = &DataPath> {
        self.data_paths.values().filter(|p| p.branch.is_some())
    }

    pub fn path_for_pcc_rule(&self, pcc_rule_id: &str) -> Option<&DataPath> {
        self.data_paths
            .values()
            .find(|p| p.pcc_rule_id.as_deref() == Some(pcc_rule_id))
    }

    pub fn activated_paths(&self) -> impl Iterator<Item = &DataPath> {
        self.data_paths.values().filter(|p| p.activated)
    }

    /// Apply an AN tunnel change to every path; returns whether any FAR changed
    pub fn set_an_tunnel(&mut self, rules: &mut NodeRuleSets, an: Option<AnTunnel>) -> bool {
        self.an_tunnel = an;
        let mut changed = false;
        for path in self.data_paths.values().filter(|p| p.activated) {
            changed |= path.set_an_tunnel(rules, an);
        }
        changed
    }

    pub fn deactivate_all(&mut self, rules: &mut NodeRuleSets) {
        for path in self.data_paths.values_mut() {
            path.deactivate(rules);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data_paths.is_empty()
    }
}
