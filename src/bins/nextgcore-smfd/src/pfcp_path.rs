//! PFCP Path Management
//!
//! Header codec, the UDP transport seam and the request side of the N4
//! exchange: every request gets a fresh sequence number and is recorded as a
//! transaction until its response comes back.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::error::{SmfError, SmfResult};
use crate::n4_build::{self, pfcp_type};
use crate::rule::SyncSections;
use crate::topology::{SNssai, UpNode};

/// PFCP version carried in every header
pub const PFCP_VERSION: u8 = 1;
/// Sequence numbers are 24 bits wide
const SEQUENCE_MASK: u32 = 0x00ff_ffff;
/// How long an unanswered request is remembered
pub const DEFAULT_XACT_LIFETIME: Duration = Duration::from_secs(30);

// ============================================================================
// Codec errors
// ============================================================================

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PfcpCodecError {
    #[error("message too short ({0} bytes)")]
    TooShort(usize),
    #[error("unsupported PFCP version {0}")]
    Version(u8),
    #[error("length field {declared} does not match {actual} bytes")]
    Length { declared: usize, actual: usize },
    #[error("truncated IE type {0}")]
    TruncatedIe(u16),
    #[error("malformed IE type {0}")]
    MalformedIe(u16),
}

impl From<PfcpCodecError> for SmfError {
    fn from(e: PfcpCodecError) -> Self {
        SmfError::Codec(e.to_string())
    }
}

// ============================================================================
// PFCP Header
// ============================================================================

/// PFCP Header structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfcpHeader {
    pub version: u8,
    pub message_type: u8,
    /// Present on session messages
    pub seid: Option<u64>,
    pub sequence_number: u32,
}

impl PfcpHeader {
    pub fn new(message_type: u8, seid: Option<u64>, sequence_number: u32) -> Self {
        Self {
            version: PFCP_VERSION,
            message_type,
            seid,
            sequence_number: sequence_number & SEQUENCE_MASK,
        }
    }

    /// Header plus body as one datagram
    pub fn encode(&self, body: &[u8]) -> Bytes {
        let seid_len = if self.seid.is_some() { 8 } else { 0 };
        let mut buf = BytesMut::with_capacity(8 + seid_len + body.len());

        let mut flags = self.version << 5;
        if self.seid.is_some() {
            flags |= 0x01;
        }
        buf.put_u8(flags);
        buf.put_u8(self.message_type);
        buf.put_u16((seid_len + 4 + body.len()) as u16);
        if let Some(seid) = self.seid {
            buf.put_u64(seid);
        }
        buf.put_slice(&self.sequence_number.to_be_bytes()[1..]);
        buf.put_u8(0);
        buf.put_slice(body);
        buf.freeze()
    }

    /// Split a datagram into header and body
    pub fn decode(data: &[u8]) -> Result<(Self, Bytes), PfcpCodecError> {
        if data.len() < 8 {
            return Err(PfcpCodecError::TooShort(data.len()));
        }
        let version = data[0] >> 5;
        if version != PFCP_VERSION {
            return Err(PfcpCodecError::Version(version));
        }
        let has_seid = data[0] & 0x01 != 0;
        let message_type = data[1];
        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        if declared + 4 != data.len() {
            return Err(PfcpCodecError::Length {
                declared,
                actual: data.len() - 4,
            });
        }

        let mut offset = 4;
        let seid = if has_seid {
            if data.len() < 16 {
                return Err(PfcpCodecError::TooShort(data.len()));
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[4..12]);
            offset += 8;
            Some(u64::from_be_bytes(raw))
        } else {
            None
        };
        let sequence_number =
            u32::from_be_bytes([0, data[offset], data[offset + 1], data[offset + 2]]);
        offset += 4;

        let header = PfcpHeader {
            version,
            message_type,
            seid,
            sequence_number,
        };
        Ok((header, Bytes::copy_from_slice(&data[offset..])))
    }
}

// ============================================================================
// Information elements
// ============================================================================

/// One top level IE of a received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfcpIe {
    pub ie_type: u16,
    pub value: Bytes,
}

pub fn parse_ies(body: &Bytes) -> Result<Vec<PfcpIe>, PfcpCodecError> {
    let mut ies = Vec::new();
    let mut offset = 0;
    while offset < body.len() {
        if body.len() - offset < 4 {
            return Err(PfcpCodecError::TooShort(body.len() - offset));
        }
        let ie_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        offset += 4;
        if body.len() - offset < len {
            return Err(PfcpCodecError::TruncatedIe(ie_type));
        }
        ies.push(PfcpIe {
            ie_type,
            value: body.slice(offset..offset + len),
        });
        offset += len;
    }
    Ok(ies)
}

pub fn find_ie(ies: &[PfcpIe], ie_type: u16) -> Option<&PfcpIe> {
    ies.iter().find(|ie| ie.ie_type == ie_type)
}

// ============================================================================
// Transport
// ============================================================================

/// Datagram sink towards the UPFs
pub trait PfcpTransport: Send + Sync {
    fn send(&self, peer: SocketAddr, datagram: Bytes) -> SmfResult<()>;
}

/// Non-blocking send on the N4 UDP socket
pub struct UdpTransport {
    socket: Arc<tokio::net::UdpSocket>,
}

impl UdpTransport {
    pub fn new(socket: Arc<tokio::net::UdpSocket>) -> Self {
        Self { socket }
    }
}

impl PfcpTransport for UdpTransport {
    fn send(&self, peer: SocketAddr, datagram: Bytes) -> SmfResult<()> {
        let sent = self.socket.try_send_to(&datagram, peer)?;
        if sent != datagram.len() {
            return Err(SmfError::Transport(format!(
                "short send to {} ({}/{} bytes)",
                peer,
                sent,
                datagram.len()
            )));
        }
        Ok(())
    }
}

// ============================================================================
// PFCP Transaction
// ============================================================================

/// Outstanding request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfcpXact {
    pub sequence_number: u32,
    pub message_type: u8,
    /// Node name
    pub node: String,
    pub local_seid: Option<u64>,
    /// Dropped unanswered after this instant
    pub expires_at: Instant,
}

impl PfcpXact {
    /// Whether `response_type` from `node` for `local_seid` answers this request
    pub fn answers(&self, response_type: u8, node: &str, local_seid: u64) -> bool {
        self.message_type.wrapping_add(1) == response_type
            && self.node == node
            && self.local_seid == Some(local_seid)
    }
}

// ============================================================================
// PFCP Exchange
// ============================================================================

/// Request side of the N4 interface
pub struct PfcpExchange {
    transport: Arc<dyn PfcpTransport>,
    node_id: Ipv4Addr,
    peer_port: u16,
    next_sequence: AtomicU32,
    xact_lifetime: Duration,
    xacts: Mutex<HashMap<u32, PfcpXact>>,
}

impl PfcpExchange {
    pub fn new(transport: Arc<dyn PfcpTransport>, node_id: Ipv4Addr, peer_port: u16) -> Self {
        Self {
            transport,
            node_id,
            peer_port,
            next_sequence: AtomicU32::new(1),
            xact_lifetime: DEFAULT_XACT_LIFETIME,
            xacts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_xact_lifetime(mut self, lifetime: Duration) -> Self {
        self.xact_lifetime = lifetime;
        self
    }

    pub fn node_id(&self) -> Ipv4Addr {
        self.node_id
    }

    fn xacts(&self) -> MutexGuard<'_, HashMap<u32, PfcpXact>> {
        self.xacts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next 24-bit sequence number; zero is skipped
    pub fn next_sequence(&self) -> u32 {
        loop {
            let seq = self.next_sequence.fetch_add(1, Ordering::SeqCst) & SEQUENCE_MASK;
            if seq != 0 {
                return seq;
            }
        }
    }

    pub fn peer_addr(&self, node: &UpNode) -> SmfResult<SocketAddr> {
        node.node_id
            .map(|ip| SocketAddr::new(ip.into(), self.peer_port))
            .ok_or_else(|| SmfError::Config(format!("UP node [{}] has no PFCP node id", node.name)))
    }

    fn send_request(
        &self,
        node: &UpNode,
        message_type: u8,
        header_seid: Option<u64>,
        local_seid: Option<u64>,
        body: Bytes,
    ) -> SmfResult<u32> {
        let peer = self.peer_addr(node)?;
        let seq = self.next_sequence();
        let datagram = PfcpHeader::new(message_type, header_seid, seq).encode(&body);

        let now = Instant::now();
        self.expire(now);
        self.xacts().insert(
            seq,
            PfcpXact {
                sequence_number: seq,
                message_type,
                node: node.name.clone(),
                local_seid,
                expires_at: now + self.xact_lifetime,
            },
        );
        if let Err(e) = self.transport.send(peer, datagram) {
            self.xacts().remove(&seq);
            return Err(e);
        }
        log::debug!(
            "[{}] {} sent (seq={}, seid={:?})",
            node.name,
            pfcp_type::name(message_type),
            seq,
            header_seid
        );
        Ok(seq)
    }

    pub fn send_establishment_request(
        &self,
        node: &UpNode,
        local_seid: u64,
        sections: &SyncSections,
        dnn: &str,
        snssai: &SNssai,
    ) -> SmfResult<u32> {
        let body = n4_build::build_session_establishment_request(
            self.node_id,
            local_seid,
            sections,
            dnn,
            snssai,
        );
        // The UPF SEID is not known yet
        self.send_request(
            node,
            pfcp_type::SESSION_ESTABLISHMENT_REQUEST,
            Some(0),
            Some(local_seid),
            body,
        )
    }

    pub fn send_modification_request(
        &self,
        node: &UpNode,
        local_seid: u64,
        remote_seid: u64,
        sections: &SyncSections,
    ) -> SmfResult<u32> {
        let body = n4_build::build_session_modification_request(sections);
        self.send_request(
            node,
            pfcp_type::SESSION_MODIFICATION_REQUEST,
            Some(remote_seid),
            Some(local_seid),
            body,
        )
    }

    pub fn send_deletion_request(
        &self,
        node: &UpNode,
        local_seid: u64,
        remote_seid: u64,
    ) -> SmfResult<u32> {
        self.send_request(
            node,
            pfcp_type::SESSION_DELETION_REQUEST,
            Some(remote_seid),
            Some(local_seid),
            n4_build::build_session_deletion_request(),
        )
    }

    pub fn send_association_setup_request(&self, node: &UpNode, recovery_time_stamp: u32) -> SmfResult<u32> {
        let body = n4_build::build_association_setup_request(self.node_id, recovery_time_stamp);
        self.send_request(node, pfcp_type::ASSOCIATION_SETUP_REQUEST, None, None, body)
    }

    pub fn send_heartbeat_request(&self, node: &UpNode, recovery_time_stamp: u32) -> SmfResult<u32> {
        let body = n4_build::build_heartbeat_request(recovery_time_stamp);
        self.send_request(node, pfcp_type::HEARTBEAT_REQUEST, None, None, body)
    }

    /// Answer a request from a UPF with its own sequence number
    pub fn send_response(
        &self,
        peer: SocketAddr,
        message_type: u8,
        seid: Option<u64>,
        sequence_number: u32,
        body: Bytes,
    ) -> SmfResult<()> {
        let datagram = PfcpHeader::new(message_type, seid, sequence_number).encode(&body);
        self.transport.send(peer, datagram)
    }

    /// Close the transaction a node message answers
    pub fn complete(&self, sequence_number: u32) -> Option<PfcpXact> {
        self.xacts().remove(&sequence_number)
    }

    /// Close the session transaction `sequence_number` when the response
    /// really answers it. Anything else leaves the table untouched.
    pub fn complete_session(
        &self,
        sequence_number: u32,
        response_type: u8,
        node: &str,
        local_seid: u64,
    ) -> Option<PfcpXact> {
        let mut xacts = self.xacts();
        let matched = xacts
            .get(&sequence_number)
            .is_some_and(|x| x.answers(response_type, node, local_seid));
        if matched {
            xacts.remove(&sequence_number)
        } else {
            None
        }
    }

    /// Drop requests whose lifetime ended; returns how many
    pub fn expire(&self, now: Instant) -> usize {
        let mut xacts = self.xacts();
        let before = xacts.len();
        xacts.retain(|seq, x| {
            let alive = x.expires_at > now;
            if !alive {
                log::debug!(
                    "[{}] {} unanswered, dropped (seq={})",
                    x.node,
                    pfcp_type::name(x.message_type),
                    seq
                );
            }
            alive
        });
        before - xacts.len()
    }

    /// Forget every request of a PFCP session that is gone
    pub fn forget_session(&self, local_seid: u64) {
        self.xacts().retain(|_, x| x.local_seid != Some(local_seid));
    }

    /// Forget every request towards a node that stopped answering
    pub fn forget_node(&self, node: &str) {
        self.xacts().retain(|_, x| x.node != node);
    }

    pub fn outstanding(&self) -> usize {
        self.xacts().len()
    }
}
