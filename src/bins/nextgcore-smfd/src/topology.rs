//! User Plane Topology
//!
//! Static graph of access nodes and UPFs loaded once from configuration,
//! with path and anchor queries. Node identity and capabilities are
//! immutable after load; association status and UP IP resource info are
//! written by the PFCP association handlers, and each node owns its rule id
//! allocator behind its own lock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::config::{SnssaiConf, UpNodeConf, UserPlaneConf};
use crate::error::{SmfError, SmfResult};
use crate::pool::UeIpPool;
use crate::rule::RuleIdAllocator;

// ============================================================================
// Basic Types
// ============================================================================

/// S-NSSAI (Single Network Slice Selection Assistance Information)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SNssai {
    pub sst: u8,
    pub sd: Option<u32>,
}

impl SNssai {
    pub fn new(sst: u8, sd: Option<u32>) -> Self {
        Self { sst, sd }
    }

    pub fn from_conf(conf: &SnssaiConf) -> SmfResult<Self> {
        let sd = match conf.sd.as_deref() {
            None | Some("") => None,
            Some(sd) => Some(
                u32::from_str_radix(sd, 16)
                    .map_err(|_| SmfError::Config(format!("invalid sd [{sd}]")))?,
            ),
        };
        Ok(Self { sst: conf.sst, sd })
    }
}

impl fmt::Display for SNssai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sd {
            Some(sd) => write!(f, "{}:{:06x}", self.sst, sd),
            None => write!(f, "{}", self.sst),
        }
    }
}

/// UP node type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpNodeType {
    /// Access node (gNB)
    An,
    #[default]
    Upf,
}

impl UpNodeType {
    pub fn name(&self) -> &'static str {
        match self {
            UpNodeType::An => "AN",
            UpNodeType::Upf => "UPF",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "AN" => Some(UpNodeType::An),
            "UPF" => Some(UpNodeType::Upf),
            _ => None,
        }
    }
}

/// UPF interface type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterfaceType {
    #[default]
    N3,
    N9,
}

impl InterfaceType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "N3" => Some(InterfaceType::N3),
            "N9" => Some(InterfaceType::N9),
            _ => None,
        }
    }
}

/// UPF selection parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpSelection {
    pub snssai: SNssai,
    pub dnn: String,
    pub dnai: Option<String>,
    /// Address assigned by subscription data
    pub pdu_address: Option<Ipv4Addr>,
}

impl UpSelection {
    pub fn new(snssai: SNssai, dnn: &str) -> Self {
        Self {
            snssai,
            dnn: dnn.to_string(),
            dnai: None,
            pdu_address: None,
        }
    }

    /// The same selection without locality or address constraints
    pub fn without_dnai(&self) -> Self {
        Self {
            snssai: self.snssai,
            dnn: self.dnn.clone(),
            dnai: None,
            pdu_address: None,
        }
    }
}

impl fmt::Display for UpSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DNN[{}] S-NSSAI[{}]", self.dnn, self.snssai)?;
        if let Some(dnai) = &self.dnai {
            write!(f, " DNAI[{dnai}]")?;
        }
        Ok(())
    }
}

// ============================================================================
// UPF capability descriptors
// ============================================================================

#[derive(Debug)]
pub struct DnnUpfInfo {
    pub dnn: String,
    pub dnai_list: Vec<String>,
    pub pools: Vec<Arc<UeIpPool>>,
    pub static_pools: Vec<Arc<UeIpPool>>,
}

impl DnnUpfInfo {
    pub fn contains_dnai(&self, dnai: &str) -> bool {
        self.dnai_list.iter().any(|d| d == dnai)
    }
}

#[derive(Debug)]
pub struct SnssaiUpfInfo {
    pub snssai: SNssai,
    pub dnn_list: Vec<DnnUpfInfo>,
}

#[derive(Debug, Clone)]
pub struct InterfaceUpfInfo {
    pub interface_type: InterfaceType,
    pub endpoints: Vec<Ipv4Addr>,
    pub network_instances: Vec<String>,
}

/// UP IP resource information reported in association setup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpIpResourceInfo {
    pub ipv4: Option<Ipv4Addr>,
    pub network_instance: Option<String>,
    pub teid_range: Option<(u8, u8)>,
}

/// PFCP association state of a UPF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpfAssociation {
    #[default]
    NotAssociated,
    Associated,
}

/// Mutable part of a node, written by the association handlers
#[derive(Debug, Clone, Default)]
pub struct UpNodeStatus {
    pub association: UpfAssociation,
    pub up_ip_resource: Option<UpIpResourceInfo>,
    pub recovery_time_stamp: Option<u32>,
}

// ============================================================================
// UP Node
// ============================================================================

#[derive(Debug)]
pub struct UpNode {
    pub name: String,
    pub node_type: UpNodeType,
    /// PFCP node id (UPF only)
    pub node_id: Option<Ipv4Addr>,
    /// Radio side address (AN only)
    pub an_ip: Option<Ipv4Addr>,
    pub snssai_infos: Vec<SnssaiUpfInfo>,
    pub interfaces: Vec<InterfaceUpfInfo>,
    status: RwLock<UpNodeStatus>,
    ids: Mutex<RuleIdAllocator>,
}

impl UpNode {
    fn from_conf(conf: &UpNodeConf) -> SmfResult<Self> {
        let node_type = UpNodeType::parse(&conf.node_type).ok_or_else(|| {
            SmfError::Config(format!("[{}] invalid node type [{}]", conf.name, conf.node_type))
        })?;

        let parse_ip = |field: &str, value: &Option<String>| -> SmfResult<Option<Ipv4Addr>> {
            value
                .as_deref()
                .map(|v| {
                    v.parse().map_err(|_| {
                        SmfError::Config(format!("[{}] invalid {} [{}]", conf.name, field, v))
                    })
                })
                .transpose()
        };
        let node_id = parse_ip("node_id", &conf.node_id)?;
        let an_ip = parse_ip("an_ip", &conf.an_ip)?;
        if node_type == UpNodeType::Upf && node_id.is_none() {
            return Err(SmfError::Config(format!("[{}] UPF without node_id", conf.name)));
        }

        let mut snssai_infos = Vec::new();
        for info in &conf.snssai_infos {
            let mut dnn_list = Vec::new();
            for dnn in &info.dnn_upf_info_list {
                let pools = dnn
                    .pools
                    .iter()
                    .map(|p| UeIpPool::new(&p.cidr).map(Arc::new))
                    .collect::<SmfResult<Vec<_>>>()?;
                let static_pools = dnn
                    .static_pools
                    .iter()
                    .map(|p| UeIpPool::new(&p.cidr).map(Arc::new))
                    .collect::<SmfResult<Vec<_>>>()?;
                for fixed in &static_pools {
                    for pool in pools.iter().filter(|p| p.overlaps(fixed)) {
                        pool.exclude(fixed);
                        log::debug!(
                            "[{}] static pool [{}] carved out of [{}]",
                            conf.name,
                            fixed.cidr(),
                            pool.cidr()
                        );
                    }
                }
                dnn_list.push(DnnUpfInfo {
                    dnn: dnn.dnn.clone(),
                    dnai_list: dnn.dnai_list.clone(),
                    pools,
                    static_pools,
                });
            }
            snssai_infos.push(SnssaiUpfInfo {
                snssai: SNssai::from_conf(&info.snssai)?,
                dnn_list,
            });
        }

        let mut interfaces = Vec::new();
        for iface in &conf.interfaces {
            let interface_type = InterfaceType::parse(&iface.interface_type).ok_or_else(|| {
                SmfError::Config(format!(
                    "[{}] invalid interface type [{}]",
                    conf.name, iface.interface_type
                ))
            })?;
            let endpoints = iface
                .endpoints
                .iter()
                .map(|e| {
                    e.parse()
                        .map_err(|_| SmfError::Config(format!("[{}] invalid endpoint [{}]", conf.name, e)))
                })
                .collect::<SmfResult<Vec<_>>>()?;
            interfaces.push(InterfaceUpfInfo {
                interface_type,
                endpoints,
                network_instances: iface.network_instances.clone(),
            });
        }

        Ok(Self {
            name: conf.name.clone(),
            node_type,
            node_id,
            an_ip,
            snssai_infos,
            interfaces,
            status: RwLock::new(UpNodeStatus::default()),
            ids: Mutex::new(RuleIdAllocator::new()),
        })
    }

    pub fn is_upf(&self) -> bool {
        self.node_type == UpNodeType::Upf
    }

    pub fn supports_snssai(&self, snssai: &SNssai) -> bool {
        self.is_upf() && self.snssai_infos.iter().any(|i| i.snssai == *snssai)
    }

    /// Slice and DNN match, plus DNAI when the selection carries one
    pub fn matches_selection(&self, selection: &UpSelection) -> bool {
        self.snssai_infos
            .iter()
            .filter(|i| i.snssai == selection.snssai)
            .flat_map(|i| i.dnn_list.iter())
            .filter(|d| d.dnn == selection.dnn)
            .any(|d| match &selection.dnai {
                Some(dnai) => d.contains_dnai(dnai),
                None => true,
            })
    }

    /// Endpoint for tunnels on an interface type, falling back to the UP
    /// IP resource info and then to the node id.
    pub fn interface_ipv4(&self, interface_type: InterfaceType, dnn: &str) -> Option<Ipv4Addr> {
        let by_type: Vec<&InterfaceUpfInfo> = self
            .interfaces
            .iter()
            .filter(|i| i.interface_type == interface_type)
            .collect();
        by_type
            .iter()
            .find(|i| i.network_instances.iter().any(|n| n == dnn))
            .or_else(|| by_type.first())
            .and_then(|i| i.endpoints.first().copied())
            .or_else(|| self.status().up_ip_resource.and_then(|r| r.ipv4))
            .or(self.node_id)
            .or(self.an_ip)
    }

    pub fn status(&self) -> UpNodeStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn is_associated(&self) -> bool {
        self.status().association == UpfAssociation::Associated
    }

    pub fn set_associated(&self, up_ip_resource: Option<UpIpResourceInfo>, recovery_time_stamp: Option<u32>) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.association = UpfAssociation::Associated;
        if up_ip_resource.is_some() {
            status.up_ip_resource = up_ip_resource;
        }
        if recovery_time_stamp.is_some() {
            status.recovery_time_stamp = recovery_time_stamp;
        }
    }

    pub fn set_not_associated(&self) {
        let mut status = self.status.write().unwrap_or_else(PoisonError::into_inner);
        status.association = UpfAssociation::NotAssociated;
    }

    /// Exclusive access to the node's rule and TEID id spaces
    pub fn ids(&self) -> MutexGuard<'_, RuleIdAllocator> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Topology
// ============================================================================

#[derive(Debug, Default)]
pub struct Topology {
    /// Nodes in declaration order
    nodes: Vec<Arc<UpNode>>,
    by_name: HashMap<String, usize>,
    by_node_id: HashMap<Ipv4Addr, usize>,
    /// Adjacency in link declaration order
    adjacency: Vec<Vec<usize>>,
}

impl Topology {
    /// Build the graph. A link to an undefined node or dynamic pools that
    /// overlap between UPFs are configuration errors.
    pub fn build(conf: &UserPlaneConf) -> SmfResult<Self> {
        let mut topology = Topology::default();

        for node_conf in &conf.up_nodes {
            if topology.by_name.contains_key(&node_conf.name) {
                return Err(SmfError::Config(format!("duplicate up_node [{}]", node_conf.name)));
            }
            let node = UpNode::from_conf(node_conf)?;
            let idx = topology.nodes.len();
            topology.by_name.insert(node.name.clone(), idx);
            if let Some(node_id) = node.node_id {
                topology.by_node_id.insert(node_id, idx);
            }
            topology.nodes.push(Arc::new(node));
            topology.adjacency.push(Vec::new());
        }

        let all_pools: Vec<&Arc<UeIpPool>> = topology
            .nodes
            .iter()
            .flat_map(|n| n.snssai_infos.iter())
            .flat_map(|i| i.dnn_list.iter())
            .flat_map(|d| d.pools.iter())
            .collect();
        for (i, a) in all_pools.iter().enumerate() {
            for b in &all_pools[i + 1..] {
                if a.overlaps(b) {
                    return Err(SmfError::Config(format!(
                        "overlapping pools [{}] and [{}]",
                        a.cidr(),
                        b.cidr()
                    )));
                }
            }
        }

        for link in &conf.links {
            let a = topology.index_of(&link.a)?;
            let b = topology.index_of(&link.b)?;
            topology.adjacency[a].push(b);
            topology.adjacency[b].push(a);
        }

        log::info!(
            "User plane topology: {} nodes, {} links",
            topology.nodes.len(),
            conf.links.len()
        );
        Ok(topology)
    }

    fn index_of(&self, name: &str) -> SmfResult<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| SmfError::Config(format!("link references undefined node [{name}]")))
    }

    pub fn node(&self, name: &str) -> Option<Arc<UpNode>> {
        self.by_name.get(name).map(|&i| self.nodes[i].clone())
    }

    pub fn node_by_id(&self, node_id: Ipv4Addr) -> Option<Arc<UpNode>> {
        self.by_node_id.get(&node_id).map(|&i| self.nodes[i].clone())
    }

    pub fn nodes(&self) -> &[Arc<UpNode>] {
        &self.nodes
    }

    pub fn upfs(&self) -> impl Iterator<Item = &Arc<UpNode>> {
        self.nodes.iter().filter(|n| n.is_upf())
    }

    /// First access node in declaration order
    pub fn source(&self) -> SmfResult<Arc<UpNode>> {
        self.nodes
            .iter()
            .find(|n| n.node_type == UpNodeType::An)
            .cloned()
            .ok_or_else(|| SmfError::NotFound("no AN node in topology".to_string()))
    }

    /// Depth-first search from `source` to the first UPF matching the
    /// selection. Neighbors that do not support the slice are pruned. The
    /// returned path starts with `source`.
    pub fn find_path(&self, source: &str, selection: &UpSelection) -> SmfResult<Vec<Arc<UpNode>>> {
        let start = self.index_of_node(source)?;
        self.dfs(start, selection, &|idx| {
            self.nodes[idx].is_upf() && self.nodes[idx].matches_selection(selection)
        })
        .ok_or_else(|| SmfError::NotFound(format!("path from [{source}] for {selection}")))
    }

    /// Depth-first search from `source` to a specific UPF
    pub fn find_path_to(
        &self,
        source: &str,
        destination: &str,
        selection: &UpSelection,
    ) -> SmfResult<Vec<Arc<UpNode>>> {
        let start = self.index_of_node(source)?;
        let dest = self.index_of_node(destination)?;
        self.dfs(start, selection, &|idx| idx == dest)
            .ok_or_else(|| SmfError::NotFound(format!("path [{source}] => [{destination}]")))
    }

    fn index_of_node(&self, name: &str) -> SmfResult<usize> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| SmfError::NotFound(format!("node [{name}]")))
    }

    fn dfs(
        &self,
        start: usize,
        selection: &UpSelection,
        is_target: &dyn Fn(usize) -> bool,
    ) -> Option<Vec<Arc<UpNode>>> {
        let mut visited = vec![false; self.nodes.len()];
        let mut path = Vec::new();
        if self.dfs_visit(start, selection, is_target, &mut visited, &mut path) {
            Some(path.into_iter().map(|i| self.nodes[i].clone()).collect())
        } else {
            None
        }
    }

    fn dfs_visit(
        &self,
        cur: usize,
        selection: &UpSelection,
        is_target: &dyn Fn(usize) -> bool,
        visited: &mut [bool],
        path: &mut Vec<usize>,
    ) -> bool {
        visited[cur] = true;
        path.push(cur);
        if is_target(cur) {
            return true;
        }

        for &next in &self.adjacency[cur] {
            if visited[next] {
                continue;
            }
            if !self.nodes[next].supports_snssai(&selection.snssai) {
                visited[next] = true;
                continue;
            }
            if self.dfs_visit(next, selection, is_target, visited, path) {
                return true;
            }
        }

        path.pop();
        false
    }

    /// Walk from `source` following, per node, only the first unvisited
    /// link that matches slice and DNN. Nodes with no such link that match
    /// the full selection are anchors. Result is sorted by name.
    ///
    /// This is a single-branch walk, not a full breadth-first search: the
    /// queue never holds more than one node, so at most one anchor is found
    /// per source and the random rotation in [`crate::pool::allocate_ue_ip`]
    /// only has a choice once several pools share that anchor.
    pub fn find_anchors(&self, source: &str, selection: &UpSelection) -> SmfResult<Vec<Arc<UpNode>>> {
        let start = self.index_of_node(source)?;
        let hop_selection = selection.without_dnai();
        let mut visited = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([start]);
        let mut anchors = HashSet::new();

        while let Some(cur) = queue.pop_front() {
            visited[cur] = true;
            let next = self.adjacency[cur].iter().copied().find(|&n| {
                !visited[n] && self.nodes[n].is_upf() && self.nodes[n].matches_selection(&hop_selection)
            });
            match next {
                Some(n) => queue.push_back(n),
                None => {
                    let node = &self.nodes[cur];
                    if node.is_upf() && node.matches_selection(selection) {
                        anchors.insert(cur);
                    }
                }
            }
        }

        let mut anchors: Vec<Arc<UpNode>> = anchors.into_iter().map(|i| self.nodes[i].clone()).collect();
        anchors.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(anchors)
    }
}
