//! UE IP Address Pools
//!
//! Per UPF, per S-NSSAI, per DNN address pools. Each pool keeps its own
//! allocation bitmap behind its own lock. Static pools (addresses assigned
//! by subscription data) are carved out of overlapping dynamic pools when
//! the topology is loaded, so an address is never free in both kinds.

use rand::Rng;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{SmfError, SmfResult};
use crate::topology::{Topology, UpNode, UpSelection};

// ============================================================================
// Pool Kind
// ============================================================================

/// Which kind of pool satisfied an allocation; release needs the same kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    #[default]
    Dynamic,
    Static,
}

impl PoolKind {
    pub fn name(&self) -> &'static str {
        match self {
            PoolKind::Dynamic => "DYNAMIC",
            PoolKind::Static => "STATIC",
        }
    }
}

// ============================================================================
// UE IP Pool
// ============================================================================

#[derive(Debug)]
struct PoolBitmap {
    /// Allocated or reserved slots
    used: Vec<u64>,
    /// Slots carved out for a static pool
    reserved: Vec<u64>,
    free: u32,
}

impl PoolBitmap {
    fn new(size: u32) -> Self {
        let words = (size as usize).div_ceil(64);
        let mut used = vec![0u64; words];
        // Pad bits past the end so word scans never return them
        let tail = size as usize % 64;
        if tail != 0 {
            if let Some(last) = used.last_mut() {
                *last = !0u64 << tail;
            }
        }
        Self {
            used,
            reserved: vec![0u64; words],
            free: size,
        }
    }

    fn is_set(bits: &[u64], idx: u32) -> bool {
        bits[(idx / 64) as usize] & (1u64 << (idx % 64)) != 0
    }

    fn set(bits: &mut [u64], idx: u32) {
        bits[(idx / 64) as usize] |= 1u64 << (idx % 64);
    }

    fn clear(bits: &mut [u64], idx: u32) {
        bits[(idx / 64) as usize] &= !(1u64 << (idx % 64));
    }

    fn take(&mut self, idx: u32) -> bool {
        if Self::is_set(&self.used, idx) {
            return false;
        }
        Self::set(&mut self.used, idx);
        self.free -= 1;
        true
    }

    /// First free slot at or after `start`, wrapping once
    fn first_free_from(&self, start: u32) -> Option<u32> {
        let words = self.used.len();
        if words == 0 || self.free == 0 {
            return None;
        }
        let start_word = (start / 64) as usize;
        // The start word is visited twice: its high part first, its low part last
        for step in 0..=words {
            let w = (start_word + step) % words;
            let mut word = self.used[w];
            if step == 0 {
                word |= (1u64 << (start % 64)) - 1;
            } else if step == words {
                word |= !((1u64 << (start % 64)) - 1);
            }
            if word != u64::MAX {
                let bit = (!word).trailing_zeros();
                return Some(w as u32 * 64 + bit);
            }
        }
        None
    }
}

/// One IPv4 subnet with an allocation bitmap
#[derive(Debug)]
pub struct UeIpPool {
    cidr: String,
    network: u32,
    prefix_len: u8,
    /// Address of slot 0
    first: u32,
    size: u32,
    bitmap: Mutex<PoolBitmap>,
}

impl UeIpPool {
    /// Parse `a.b.c.d/len`. The network address itself is never handed out
    /// unless the prefix is a single host.
    pub fn new(cidr: &str) -> SmfResult<Self> {
        let (addr, len) = cidr
            .split_once('/')
            .ok_or_else(|| SmfError::Config(format!("invalid pool [{cidr}]: missing prefix")))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| SmfError::Config(format!("invalid pool [{cidr}]: bad address")))?;
        let prefix_len: u8 = len
            .trim()
            .parse()
            .map_err(|_| SmfError::Config(format!("invalid pool [{cidr}]: bad prefix")))?;
        if !(8..=32).contains(&prefix_len) {
            return Err(SmfError::Config(format!(
                "invalid pool [{cidr}]: prefix /{prefix_len} out of range"
            )));
        }

        let mask = Self::mask(prefix_len);
        let network = u32::from(addr) & mask;
        let (first, size) = if prefix_len == 32 {
            (network, 1)
        } else {
            (network + 1, (1u32 << (32 - prefix_len)) - 1)
        };

        Ok(Self {
            cidr: cidr.to_string(),
            network,
            prefix_len,
            first,
            size,
            bitmap: Mutex::new(PoolBitmap::new(size)),
        })
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    pub fn cidr(&self) -> &str {
        &self.cidr
    }

    pub fn capacity(&self) -> u32 {
        self.size
    }

    pub fn free_count(&self) -> u32 {
        self.bitmap.lock().unwrap_or_else(PoisonError::into_inner).free
    }

    /// Whether `addr` lies inside the subnet
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        u32::from(addr) & Self::mask(self.prefix_len) == self.network
    }

    /// Whether two subnets share any address
    pub fn overlaps(&self, other: &UeIpPool) -> bool {
        let shorter = self.prefix_len.min(other.prefix_len);
        let mask = Self::mask(shorter);
        self.network & mask == other.network & mask
    }

    fn slot_of(&self, addr: Ipv4Addr) -> Option<u32> {
        let value = u32::from(addr);
        if !self.contains(addr) || value < self.first {
            return None;
        }
        let idx = value - self.first;
        (idx < self.size).then_some(idx)
    }

    fn addr_of(&self, idx: u32) -> Ipv4Addr {
        Ipv4Addr::from(self.first + idx)
    }

    /// Carve the addresses of `other` out of this pool
    pub fn exclude(&self, other: &UeIpPool) {
        let mut bitmap = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);
        for idx in 0..other.size {
            if let Some(slot) = self.slot_of(other.addr_of(idx)) {
                if bitmap.take(slot) {
                    PoolBitmap::set(&mut bitmap.reserved, slot);
                }
            }
        }
        // The static subnet's own network address is also off limits
        if let Some(slot) = self.slot_of(Ipv4Addr::from(other.network)) {
            if bitmap.take(slot) {
                PoolBitmap::set(&mut bitmap.reserved, slot);
            }
        }
    }

    /// Whether `addr` is currently free in this pool
    pub fn is_free(&self, addr: Ipv4Addr) -> bool {
        match self.slot_of(addr) {
            Some(slot) => {
                let bitmap = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);
                !PoolBitmap::is_set(&bitmap.used, slot)
            }
            None => false,
        }
    }

    /// Allocate the preferred address when it is free, otherwise a free
    /// address scanned first-fit from a random offset. `None` when exhausted.
    pub fn allocate(&self, preferred: Option<Ipv4Addr>) -> Option<Ipv4Addr> {
        let mut bitmap = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(addr) = preferred {
            match self.slot_of(addr) {
                Some(slot) if bitmap.take(slot) => return Some(addr),
                _ => log::warn!("UE IP [{}] is not available in pool [{}]", addr, self.cidr),
            }
        }

        if bitmap.free == 0 {
            return None;
        }
        let start = rand::rng().random_range(0..self.size);
        let slot = bitmap.first_free_from(start)?;
        bitmap.take(slot);
        Some(self.addr_of(slot))
    }

    /// Return an address to the pool. Releasing a free, reserved or foreign
    /// address is a no-op.
    pub fn release(&self, addr: Ipv4Addr) -> bool {
        let Some(slot) = self.slot_of(addr) else {
            return false;
        };
        let mut bitmap = self.bitmap.lock().unwrap_or_else(PoisonError::into_inner);
        if PoolBitmap::is_set(&bitmap.reserved, slot) || !PoolBitmap::is_set(&bitmap.used, slot) {
            return false;
        }
        PoolBitmap::clear(&mut bitmap.used, slot);
        bitmap.free += 1;
        true
    }
}

// ============================================================================
// Allocation across the topology
// ============================================================================

/// Result of a UE address allocation
#[derive(Debug, Clone)]
pub struct UeIpAllocation {
    pub upf: Arc<UpNode>,
    pub addr: Ipv4Addr,
    pub kind: PoolKind,
}

/// Candidate pools of one UPF for a selection.
///
/// With a preferred address, a static pool containing it wins, then a
/// dynamic pool containing it; no containing pool means no candidate.
/// Without one, every dynamic pool of the matching DNN is a candidate.
pub fn candidate_pools(upf: &UpNode, selection: &UpSelection) -> (Vec<Arc<UeIpPool>>, PoolKind) {
    for info in upf.snssai_infos.iter().filter(|i| i.snssai == selection.snssai) {
        for dnn_info in info.dnn_list.iter().filter(|d| d.dnn == selection.dnn) {
            if let Some(dnai) = &selection.dnai {
                if !dnn_info.contains_dnai(dnai) {
                    continue;
                }
            }
            if let Some(addr) = selection.pdu_address {
                if let Some(pool) = dnn_info.static_pools.iter().find(|p| p.contains(addr)) {
                    return (vec![pool.clone()], PoolKind::Static);
                }
                if let Some(pool) = dnn_info.pools.iter().find(|p| p.contains(addr)) {
                    log::info!(
                        "[{}] {} not in a static pool, using dynamic pool [{}]",
                        upf.name,
                        addr,
                        pool.cidr()
                    );
                    return (vec![pool.clone()], PoolKind::Dynamic);
                }
                return (Vec::new(), PoolKind::Dynamic);
            }
            return (dnn_info.pools.clone(), PoolKind::Dynamic);
        }
    }
    (Vec::new(), PoolKind::Dynamic)
}

/// Rotate a candidate list by a random offset
pub fn rotate_random<T: Clone>(list: &[T]) -> Vec<T> {
    if list.is_empty() {
        return Vec::new();
    }
    let offset = rand::rng().random_range(0..list.len());
    list[offset..].iter().chain(list[..offset].iter()).cloned().collect()
}

/// Select an anchor UPF and allocate a UE address from it.
///
/// Anchors come from [`Topology::find_anchors`], which follows one branch
/// from the access node; both the anchor list and each anchor's pool list
/// are scanned from a random offset.
pub fn allocate_ue_ip(topology: &Topology, selection: &UpSelection) -> SmfResult<UeIpAllocation> {
    let source = topology.source()?;
    let anchors = topology.find_anchors(&source.name, selection)?;
    if anchors.is_empty() {
        log::warn!("No anchor UPF for {}", selection);
        return Err(SmfError::NotFound(selection.to_string()));
    }

    for upf in rotate_random(&anchors) {
        let (pools, kind) = candidate_pools(&upf, selection);
        for pool in rotate_random(&pools) {
            if let Some(addr) = pool.allocate(selection.pdu_address) {
                log::info!("Selected UPF [{}] UE IP [{}] ({})", upf.name, addr, kind.name());
                return Ok(UeIpAllocation { upf, addr, kind });
            }
            log::debug!("[{}] pool [{}] exhausted", upf.name, pool.cidr());
        }
    }

    log::warn!("UE IP pool exhausted for {}", selection);
    Err(SmfError::Exhausted(selection.to_string()))
}

/// Release a UE address to the pool of the kind it was allocated from
pub fn release_ue_ip(upf: &UpNode, addr: Ipv4Addr, kind: PoolKind) {
    let pool = upf.snssai_infos.iter().flat_map(|i| i.dnn_list.iter()).find_map(|d| {
        let pools = match kind {
            PoolKind::Static => &d.static_pools,
            PoolKind::Dynamic => &d.pools,
        };
        pools.iter().find(|p| p.contains(addr)).cloned()
    });

    match pool {
        Some(pool) => {
            pool.release(addr);
        }
        None => log::warn!("[{}] no {} pool holds UE IP [{}]", upf.name, kind.name(), addr),
    }
}
