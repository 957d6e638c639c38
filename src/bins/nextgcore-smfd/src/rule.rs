//! PFCP Rules
//!
//! PDR/FAR/QER/BAR records installed on a UPF for one session, their
//! lifecycle state, and the per-node id spaces they are numbered from.
//!
//! A rule's state is consumed by the next synchronization: `Initial` and
//! `Update` become `Synced`, `Remove` drops the rule from its owner. Ids of
//! removed rules stay out of circulation until the UPF confirms the removal.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::Ipv4Addr;

use crate::error::{SmfError, SmfResult};
use crate::n4_build::{apply_action, interface};

// ============================================================================
// Rule State
// ============================================================================

/// Rule lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RuleState {
    /// Created locally, not yet sent
    #[default]
    Initial,
    /// Installed, changed locally since the last sync
    Update,
    /// Installed, to be removed at the next sync
    Remove,
    /// Installed, no pending change
    Synced,
}

impl RuleState {
    pub fn name(&self) -> &'static str {
        match self {
            RuleState::Initial => "INITIAL",
            RuleState::Update => "UPDATE",
            RuleState::Remove => "REMOVE",
            RuleState::Synced => "SYNCED",
        }
    }
}

// ============================================================================
// Rule records
// ============================================================================

/// F-TEID allocated by the SMF
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fteid {
    pub teid: u32,
    pub ipv4: Ipv4Addr,
}

/// Outer header creation description: GTP-U/UDP/IPv4
pub const OUTER_HEADER_CREATION_GTPU_UDP_IPV4: u16 = 0x0100;
/// Outer header creation description: UDP/IPv4
pub const OUTER_HEADER_CREATION_UDP_IPV4: u16 = 0x0400;
/// Outer header removal description: GTP-U/UDP/IPv4
pub const OUTER_HEADER_REMOVAL_GTPU_UDP_IPV4: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OuterHeaderCreation {
    pub description: u16,
    pub teid: u32,
    pub ipv4: Ipv4Addr,
    pub port: Option<u16>,
}

impl OuterHeaderCreation {
    pub fn gtpu(teid: u32, ipv4: Ipv4Addr) -> Self {
        Self {
            description: OUTER_HEADER_CREATION_GTPU_UDP_IPV4,
            teid,
            ipv4,
            port: None,
        }
    }

    pub fn udp(ipv4: Ipv4Addr, port: u16) -> Self {
        Self {
            description: OUTER_HEADER_CREATION_UDP_IPV4,
            teid: 0,
            ipv4,
            port: Some(port),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardingParameters {
    pub destination_interface: u8,
    pub network_instance: Option<String>,
    pub outer_header_creation: Option<OuterHeaderCreation>,
    pub forwarding_policy_id: Option<String>,
}

/// Packet Detection Information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pdi {
    pub source_interface: u8,
    pub local_fteid: Option<Fteid>,
    pub network_instance: Option<String>,
    pub ue_ip_address: Option<Ipv4Addr>,
    pub sdf_filter: Option<String>,
    pub application_id: Option<String>,
}

/// Packet Detection Rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdr {
    pub id: u16,
    pub precedence: u32,
    pub pdi: Pdi,
    pub outer_header_removal: Option<u8>,
    pub far_id: u32,
    pub qer_ids: Vec<u32>,
    /// The F-TEID belongs to another PDR on the same node; removing this
    /// one leaves the TEID allocated.
    pub shared_fteid: bool,
    pub state: RuleState,
}

/// Forwarding Action Rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Far {
    pub id: u32,
    pub apply_action: u16,
    pub forwarding_parameters: Option<ForwardingParameters>,
    pub bar_id: Option<u8>,
    pub state: RuleState,
}

impl Far {
    pub fn is_forwarding(&self) -> bool {
        self.apply_action & apply_action::FORW != 0
    }
}

/// QoS Enforcement Rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qer {
    pub id: u32,
    pub qfi: u8,
    /// Session AMBR in kbps
    pub mbr_ul: u64,
    pub mbr_dl: u64,
    pub state: RuleState,
}

/// Buffering Action Rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bar {
    pub id: u8,
    pub suggested_buffering_packets_count: u8,
    pub state: RuleState,
}

/// Common view of the four rule kinds
pub trait Rule: Clone {
    type Id: Copy + Ord + std::fmt::Debug;

    fn id(&self) -> Self::Id;
    fn state(&self) -> RuleState;
    fn set_state(&mut self, state: RuleState);
}

macro_rules! impl_rule {
    ($ty:ty, $id:ty) => {
        impl Rule for $ty {
            type Id = $id;

            fn id(&self) -> $id {
                self.id
            }

            fn state(&self) -> RuleState {
                self.state
            }

            fn set_state(&mut self, state: RuleState) {
                self.state = state;
            }
        }
    };
}

impl_rule!(Pdr, u16);
impl_rule!(Far, u32);
impl_rule!(Qer, u32);
impl_rule!(Bar, u8);

// ============================================================================
// Rule Table
// ============================================================================

/// Rules of one kind owned by one (session, node) pair
#[derive(Debug, Clone)]
pub struct RuleTable<R: Rule> {
    rules: BTreeMap<R::Id, R>,
}

impl<R: Rule> Default for RuleTable<R> {
    fn default() -> Self {
        Self {
            rules: BTreeMap::new(),
        }
    }
}

/// One rule kind split by lifecycle state
#[derive(Debug, Clone)]
pub struct Sections<R: Rule> {
    pub create: Vec<R>,
    pub update: Vec<R>,
    pub remove: Vec<R::Id>,
}

impl<R: Rule> Default for Sections<R> {
    fn default() -> Self {
        Self {
            create: Vec::new(),
            update: Vec::new(),
            remove: Vec::new(),
        }
    }
}

impl<R: Rule> Sections<R> {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.update.is_empty() && self.remove.is_empty()
    }
}

impl<R: Rule> RuleTable<R> {
    /// Insert a new rule in state `Initial`
    pub fn insert(&mut self, mut rule: R) {
        rule.set_state(RuleState::Initial);
        self.rules.insert(rule.id(), rule);
    }

    pub fn get(&self, id: R::Id) -> Option<&R> {
        self.rules.get(&id)
    }

    /// Mutable access that leaves the state untouched
    pub fn get_mut(&mut self, id: R::Id) -> Option<&mut R> {
        self.rules.get_mut(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Flag an installed rule as changed. A rule not yet sent stays `Initial`.
    pub fn mark_update(&mut self, id: R::Id) -> bool {
        match self.rules.get_mut(&id) {
            Some(rule) => {
                if rule.state() == RuleState::Synced {
                    rule.set_state(RuleState::Update);
                }
                true
            }
            None => false,
        }
    }

    /// Flag a rule for removal. A rule never sent is dropped at once and its
    /// id returned so it can go straight back to the id space.
    pub fn mark_remove(&mut self, id: R::Id) -> Option<R::Id> {
        let state = self.rules.get(&id)?.state();
        if state == RuleState::Initial {
            self.rules.remove(&id);
            return Some(id);
        }
        if let Some(rule) = self.rules.get_mut(&id) {
            rule.set_state(RuleState::Remove);
        }
        None
    }

    /// Split by state. `Initial` goes only to create, `Update` only to
    /// update, `Remove` only to remove; `Synced` is left out.
    pub fn partition(&self) -> Sections<R> {
        let mut sections = Sections::default();
        for rule in self.rules.values() {
            match rule.state() {
                RuleState::Initial => sections.create.push(rule.clone()),
                RuleState::Update => sections.update.push(rule.clone()),
                RuleState::Remove => sections.remove.push(rule.id()),
                RuleState::Synced => {}
            }
        }
        sections
    }

    /// Consume every pending state; returns the removed rules.
    pub fn commit(&mut self) -> Vec<R> {
        let removed: Vec<R::Id> = self
            .rules
            .values()
            .filter(|r| r.state() == RuleState::Remove)
            .map(|r| r.id())
            .collect();
        let removed = removed.into_iter().filter_map(|id| self.rules.remove(&id)).collect();
        for rule in self.rules.values_mut() {
            rule.set_state(RuleState::Synced);
        }
        removed
    }

    /// Remove everything, as for a session deletion
    pub fn drain(&mut self) -> Vec<R> {
        std::mem::take(&mut self.rules).into_values().collect()
    }
}

// ============================================================================
// Rule Set
// ============================================================================

/// Create/update/remove sections of one synchronization request
#[derive(Debug, Clone, Default)]
pub struct SyncSections {
    pub pdrs: Sections<Pdr>,
    pub fars: Sections<Far>,
    pub qers: Sections<Qer>,
    pub bars: Sections<Bar>,
}

impl SyncSections {
    pub fn is_empty(&self) -> bool {
        self.pdrs.is_empty() && self.fars.is_empty() && self.qers.is_empty() && self.bars.is_empty()
    }
}

/// All rules of one session on one node
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub pdrs: RuleTable<Pdr>,
    pub fars: RuleTable<Far>,
    pub qers: RuleTable<Qer>,
    pub bars: RuleTable<Bar>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.pdrs.is_empty() && self.fars.is_empty() && self.qers.is_empty() && self.bars.is_empty()
    }

    pub fn partition(&self) -> SyncSections {
        SyncSections {
            pdrs: self.pdrs.partition(),
            fars: self.fars.partition(),
            qers: self.qers.partition(),
            bars: self.bars.partition(),
        }
    }

    /// Reset states after a dispatched sync; returns ids of removed rules
    pub fn commit_sync(&mut self) -> RetiredIds {
        RetiredIds::from_rules(
            self.pdrs.commit(),
            self.fars.commit(),
            self.qers.commit(),
            self.bars.commit(),
        )
    }

    /// Drop every rule, as after a session deletion
    pub fn drain(&mut self) -> RetiredIds {
        RetiredIds::from_rules(
            self.pdrs.drain(),
            self.fars.drain(),
            self.qers.drain(),
            self.bars.drain(),
        )
    }
}

/// Ids taken out of circulation by removed rules
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetiredIds {
    pub pdr: Vec<u16>,
    pub far: Vec<u32>,
    pub qer: Vec<u32>,
    pub bar: Vec<u8>,
    pub teid: Vec<u32>,
}

impl RetiredIds {
    fn from_rules(pdrs: Vec<Pdr>, fars: Vec<Far>, qers: Vec<Qer>, bars: Vec<Bar>) -> Self {
        Self {
            teid: pdrs
                .iter()
                .filter(|p| !p.shared_fteid)
                .filter_map(|p| p.pdi.local_fteid.map(|f| f.teid))
                .collect(),
            pdr: pdrs.iter().map(|p| p.id).collect(),
            far: fars.iter().map(|f| f.id).collect(),
            qer: qers.iter().map(|q| q.id).collect(),
            bar: bars.iter().map(|b| b.id).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.pdr.is_empty()
            && self.far.is_empty()
            && self.qer.is_empty()
            && self.bar.is_empty()
            && self.teid.is_empty()
    }

    pub fn extend(&mut self, other: RetiredIds) {
        self.pdr.extend(other.pdr);
        self.far.extend(other.far);
        self.qer.extend(other.qer);
        self.bar.extend(other.bar);
        self.teid.extend(other.teid);
    }
}

// ============================================================================
// Id spaces
// ============================================================================

/// One numeric id space. Ids move `free -> in use -> awaiting removal ->
/// free`; an id awaiting removal is never handed out.
#[derive(Debug, Clone)]
pub struct IdSpace {
    next: u32,
    max: u32,
    free: VecDeque<u32>,
    in_use: HashSet<u32>,
    awaiting_removal: HashSet<u32>,
}

impl IdSpace {
    pub fn new(max: u32) -> Self {
        Self {
            next: 1,
            max,
            free: VecDeque::new(),
            in_use: HashSet::new(),
            awaiting_removal: HashSet::new(),
        }
    }

    pub fn allocate(&mut self) -> Option<u32> {
        let id = match self.free.pop_front() {
            Some(id) => id,
            None if self.next <= self.max && self.next != 0 => {
                let id = self.next;
                self.next = self.next.wrapping_add(1);
                id
            }
            None => return None,
        };
        self.in_use.insert(id);
        Some(id)
    }

    /// Return an id that never reached the node
    pub fn release(&mut self, id: u32) {
        if self.in_use.remove(&id) {
            self.free.push_back(id);
        }
    }

    /// Park an id whose removal was sent but not yet confirmed
    pub fn retire(&mut self, id: u32) {
        if self.in_use.remove(&id) {
            self.awaiting_removal.insert(id);
        }
    }

    /// The node confirmed the removal
    pub fn confirm(&mut self, id: u32) {
        if self.awaiting_removal.remove(&id) {
            self.free.push_back(id);
        }
    }

    pub fn is_in_use(&self, id: u32) -> bool {
        self.in_use.contains(&id)
    }

    pub fn is_awaiting_removal(&self, id: u32) -> bool {
        self.awaiting_removal.contains(&id)
    }
}

/// Per-node id spaces for rules and local TEIDs
#[derive(Debug, Clone)]
pub struct RuleIdAllocator {
    pub pdr: IdSpace,
    pub far: IdSpace,
    pub qer: IdSpace,
    pub bar: IdSpace,
    pub teid: IdSpace,
}

impl Default for RuleIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleIdAllocator {
    pub fn new() -> Self {
        Self {
            pdr: IdSpace::new(u16::MAX as u32),
            far: IdSpace::new(u32::MAX),
            qer: IdSpace::new(u32::MAX),
            bar: IdSpace::new(u8::MAX as u32),
            teid: IdSpace::new(u32::MAX),
        }
    }

    pub fn alloc_pdr_id(&mut self) -> SmfResult<u16> {
        self.pdr
            .allocate()
            .map(|id| id as u16)
            .ok_or_else(|| SmfError::Exhausted("PDR id".to_string()))
    }

    pub fn alloc_far_id(&mut self) -> SmfResult<u32> {
        self.far
            .allocate()
            .ok_or_else(|| SmfError::Exhausted("FAR id".to_string()))
    }

    pub fn alloc_qer_id(&mut self) -> SmfResult<u32> {
        self.qer
            .allocate()
            .ok_or_else(|| SmfError::Exhausted("QER id".to_string()))
    }

    pub fn alloc_bar_id(&mut self) -> SmfResult<u8> {
        self.bar
            .allocate()
            .map(|id| id as u8)
            .ok_or_else(|| SmfError::Exhausted("BAR id".to_string()))
    }

    pub fn alloc_teid(&mut self) -> SmfResult<u32> {
        self.teid
            .allocate()
            .ok_or_else(|| SmfError::Exhausted("TEID".to_string()))
    }

    fn each(&mut self, ids: &RetiredIds, f: fn(&mut IdSpace, u32)) {
        ids.pdr.iter().for_each(|&id| f(&mut self.pdr, id as u32));
        ids.far.iter().for_each(|&id| f(&mut self.far, id));
        ids.qer.iter().for_each(|&id| f(&mut self.qer, id));
        ids.bar.iter().for_each(|&id| f(&mut self.bar, id as u32));
        ids.teid.iter().for_each(|&id| f(&mut self.teid, id));
    }

    pub fn release(&mut self, ids: &RetiredIds) {
        self.each(ids, IdSpace::release);
    }

    pub fn retire(&mut self, ids: &RetiredIds) {
        self.each(ids, IdSpace::retire);
    }

    pub fn confirm(&mut self, ids: &RetiredIds) {
        self.each(ids, IdSpace::confirm);
    }
}

// ============================================================================
// Constructors
// ============================================================================

impl Pdr {
    pub fn new(id: u16, far_id: u32, precedence: u32) -> Self {
        Self {
            id,
            precedence,
            pdi: Pdi::default(),
            outer_header_removal: None,
            far_id,
            qer_ids: Vec::new(),
            shared_fteid: false,
            state: RuleState::Initial,
        }
    }
}

impl Far {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            apply_action: apply_action::FORW,
            forwarding_parameters: None,
            bar_id: None,
            state: RuleState::Initial,
        }
    }

    /// Downlink FAR towards a not yet known access tunnel
    pub fn buffering(id: u32) -> Self {
        Self {
            id,
            apply_action: apply_action::BUFF | apply_action::NOCP,
            forwarding_parameters: Some(ForwardingParameters {
                destination_interface: interface::ACCESS,
                ..Default::default()
            }),
            bar_id: None,
            state: RuleState::Initial,
        }
    }
}
