//! 5GSM Message Codec
//!
//! Header level encoding of the 5G session management messages the
//! session core exchanges with the UE: protocol discriminator, PSI, PTI,
//! message type, the 5GSM cause where the message carries one and the PDU
//! address of an establishment accept. The remaining IEs are left to the
//! signaling layer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::Ipv4Addr;

use crate::consumer::NasCodec;
use crate::error::{SmfError, SmfResult};

/// Extended protocol discriminator for 5GSM
pub const EXTENDED_PROTOCOL_DISCRIMINATOR_5GSM: u8 = 0x2e;

/// 5GSM message types
pub mod message_type {
    pub const PDU_SESSION_ESTABLISHMENT_REQUEST: u8 = 0xc1;
    pub const PDU_SESSION_ESTABLISHMENT_ACCEPT: u8 = 0xc2;
    pub const PDU_SESSION_ESTABLISHMENT_REJECT: u8 = 0xc3;
    pub const PDU_SESSION_MODIFICATION_REQUEST: u8 = 0xc9;
    pub const PDU_SESSION_MODIFICATION_REJECT: u8 = 0xca;
    pub const PDU_SESSION_MODIFICATION_COMMAND: u8 = 0xcb;
    pub const PDU_SESSION_MODIFICATION_COMPLETE: u8 = 0xcc;
    pub const PDU_SESSION_MODIFICATION_COMMAND_REJECT: u8 = 0xcd;
    pub const PDU_SESSION_RELEASE_REQUEST: u8 = 0xd1;
    pub const PDU_SESSION_RELEASE_REJECT: u8 = 0xd2;
    pub const PDU_SESSION_RELEASE_COMMAND: u8 = 0xd3;
    pub const PDU_SESSION_RELEASE_COMPLETE: u8 = 0xd4;
}

/// Optional 5GSM cause IEI (release request, modification complete)
const IEI_5GSM_CAUSE: u8 = 0x59;
/// PDU address IEI
const IEI_PDU_ADDRESS: u8 = 0x29;
const PDU_SESSION_TYPE_IPV4: u8 = 1;

/// 5GSM cause codes used by the session core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GsmCause {
    InsufficientResources = 26,
    MissingOrUnknownDnn = 27,
    RequestRejectedUnspecified = 31,
    RegularDeactivation = 36,
    NetworkFailure = 38,
    PduSessionDoesNotExist = 54,
    InsufficientResourcesForSpecificSliceAndDnn = 67,
    ProtocolErrorUnspecified = 111,
}

impl From<u8> for GsmCause {
    fn from(value: u8) -> Self {
        match value {
            26 => GsmCause::InsufficientResources,
            27 => GsmCause::MissingOrUnknownDnn,
            31 => GsmCause::RequestRejectedUnspecified,
            36 => GsmCause::RegularDeactivation,
            38 => GsmCause::NetworkFailure,
            54 => GsmCause::PduSessionDoesNotExist,
            67 => GsmCause::InsufficientResourcesForSpecificSliceAndDnn,
            _ => GsmCause::ProtocolErrorUnspecified,
        }
    }
}

/// Where a message type carries its cause
fn cause_layout(message_type: u8) -> Option<bool> {
    use message_type::*;
    match message_type {
        // Mandatory, value only
        PDU_SESSION_ESTABLISHMENT_REJECT
        | PDU_SESSION_MODIFICATION_REJECT
        | PDU_SESSION_MODIFICATION_COMMAND_REJECT
        | PDU_SESSION_RELEASE_REJECT
        | PDU_SESSION_RELEASE_COMMAND => Some(true),
        // Optional, type + value
        PDU_SESSION_RELEASE_REQUEST | PDU_SESSION_MODIFICATION_REQUEST => Some(false),
        _ => None,
    }
}

/// A decoded 5GSM message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GsmMessage {
    pub psi: u8,
    pub pti: u8,
    pub message_type: u8,
    pub cause: Option<GsmCause>,
    pub pdu_address: Option<Ipv4Addr>,
}

impl GsmMessage {
    pub fn new(psi: u8, pti: u8, message_type: u8) -> Self {
        Self {
            psi,
            pti,
            message_type,
            cause: None,
            pdu_address: None,
        }
    }

    pub fn with_cause(mut self, cause: GsmCause) -> Self {
        self.cause = Some(cause);
        self
    }

    pub fn establishment_accept(psi: u8, pti: u8, ue_ip: Option<Ipv4Addr>) -> Self {
        let mut msg = Self::new(psi, pti, message_type::PDU_SESSION_ESTABLISHMENT_ACCEPT);
        msg.pdu_address = ue_ip;
        msg
    }

    pub fn establishment_reject(psi: u8, pti: u8, cause: GsmCause) -> Self {
        Self::new(psi, pti, message_type::PDU_SESSION_ESTABLISHMENT_REJECT).with_cause(cause)
    }

    pub fn release_command(psi: u8, pti: u8, cause: GsmCause) -> Self {
        Self::new(psi, pti, message_type::PDU_SESSION_RELEASE_COMMAND).with_cause(cause)
    }

    pub fn modification_command(psi: u8, pti: u8) -> Self {
        Self::new(psi, pti, message_type::PDU_SESSION_MODIFICATION_COMMAND)
    }
}

// ============================================================================
// NAS Message Builder
// ============================================================================

#[derive(Debug)]
pub struct GsmMessageBuilder {
    buffer: BytesMut,
}

impl GsmMessageBuilder {
    pub fn with_header(psi: u8, pti: u8, message_type: u8) -> Self {
        let mut buffer = BytesMut::with_capacity(64);
        buffer.put_u8(EXTENDED_PROTOCOL_DISCRIMINATOR_5GSM);
        buffer.put_u8(psi);
        buffer.put_u8(pti);
        buffer.put_u8(message_type);
        Self { buffer }
    }

    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.buffer.put_u8(value);
        self
    }

    /// Type-length-value with a one byte length
    pub fn write_tlv(&mut self, iei: u8, data: &[u8]) -> &mut Self {
        self.buffer.put_u8(iei);
        self.buffer.put_u8(data.len() as u8);
        self.buffer.put_slice(data);
        self
    }

    pub fn build(self) -> Bytes {
        self.buffer.freeze()
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Header level 5GSM codec
#[derive(Debug, Clone, Copy, Default)]
pub struct GsmCodec;

impl NasCodec for GsmCodec {
    fn decode(&self, data: &[u8]) -> SmfResult<GsmMessage> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(SmfError::Codec(format!("5GSM message too short ({} bytes)", data.len())));
        }
        let epd = buf.get_u8();
        if epd != EXTENDED_PROTOCOL_DISCRIMINATOR_5GSM {
            return Err(SmfError::Codec(format!("not a 5GSM message (EPD 0x{:02x})", epd)));
        }
        let mut msg = GsmMessage::new(buf.get_u8(), buf.get_u8(), buf.get_u8());

        match cause_layout(msg.message_type) {
            Some(true) => {
                if !buf.has_remaining() {
                    return Err(SmfError::Codec("missing mandatory 5GSM cause".to_string()));
                }
                msg.cause = Some(GsmCause::from(buf.get_u8()));
            }
            Some(false) => {
                if buf.remaining() >= 2 && buf[0] == IEI_5GSM_CAUSE {
                    buf.advance(1);
                    msg.cause = Some(GsmCause::from(buf.get_u8()));
                }
            }
            None => {}
        }
        if msg.message_type == message_type::PDU_SESSION_ESTABLISHMENT_ACCEPT {
            msg.pdu_address = find_pdu_address(buf);
        }
        Ok(msg)
    }

    fn encode(&self, msg: &GsmMessage) -> Bytes {
        let mut builder = GsmMessageBuilder::with_header(msg.psi, msg.pti, msg.message_type);
        if let Some(cause) = msg.cause {
            match cause_layout(msg.message_type) {
                Some(true) => {
                    builder.write_u8(cause as u8);
                }
                Some(false) => {
                    builder.write_u8(IEI_5GSM_CAUSE).write_u8(cause as u8);
                }
                None => {}
            }
        }
        if let Some(addr) = msg.pdu_address {
            let mut value = vec![PDU_SESSION_TYPE_IPV4];
            value.extend_from_slice(&addr.octets());
            builder.write_tlv(IEI_PDU_ADDRESS, &value);
        }
        builder.build()
    }
}

fn find_pdu_address(mut buf: &[u8]) -> Option<Ipv4Addr> {
    while buf.remaining() >= 2 {
        let iei = buf.get_u8();
        let len = buf.get_u8() as usize;
        if buf.remaining() < len {
            return None;
        }
        if iei == IEI_PDU_ADDRESS && len == 5 && buf[0] == PDU_SESSION_TYPE_IPV4 {
            return Some(Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]));
        }
        buf.advance(len);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_establishment_request() {
        let data = [0x2e, 0x05, 0x01, 0xc1, 0xff, 0xff];
        let msg = GsmCodec.decode(&data).unwrap();
        assert_eq!(msg.psi, 5);
        assert_eq!(msg.pti, 1);
        assert_eq!(msg.message_type, message_type::PDU_SESSION_ESTABLISHMENT_REQUEST);
        assert!(msg.cause.is_none());
    }

    #[test]
    fn test_release_command_carries_cause() {
        let msg = GsmMessage::release_command(5, 2, GsmCause::RegularDeactivation);
        let bytes = GsmCodec.encode(&msg);
        assert_eq!(&bytes[..], &[0x2e, 0x05, 0x02, 0xd3, 36]);
        assert_eq!(GsmCodec.decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_release_request_optional_cause() {
        let msg = GsmCodec.decode(&[0x2e, 0x01, 0x03, 0xd1]).unwrap();
        assert!(msg.cause.is_none());
        let msg = GsmCodec.decode(&[0x2e, 0x01, 0x03, 0xd1, 0x59, 36]).unwrap();
        assert_eq!(msg.cause, Some(GsmCause::RegularDeactivation));
    }

    #[test]
    fn test_accept_pdu_address() {
        let msg = GsmMessage::establishment_accept(1, 1, Some(Ipv4Addr::new(10, 60, 0, 7)));
        let decoded = GsmCodec.decode(&GsmCodec.encode(&msg)).unwrap();
        assert_eq!(decoded.pdu_address, Some(Ipv4Addr::new(10, 60, 0, 7)));
    }

    #[test]
    fn test_decode_errors() {
        assert!(GsmCodec.decode(&[0x2e, 0x01]).is_err());
        assert!(GsmCodec.decode(&[0x7e, 0x01, 0x01, 0xc1]).is_err());
        // Reject without its mandatory cause
        assert!(GsmCodec.decode(&[0x2e, 0x01, 0x01, 0xc3]).is_err());
    }
}
