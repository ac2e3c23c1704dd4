//! Minimal STUN binding client messages (RFC 5389).
//!
//! Only what is needed to learn the public address of the endpoint socket:
//! a Binding Request without attributes and the (XOR-)MAPPED-ADDRESS of the
//! success response.

use std::net::{Ipv4Addr, SocketAddrV4};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0x2112_a442;
pub const HEADER_LEN: usize = 20;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

pub type TransactionId = [u8; 12];

/// Reasons a datagram is not the response we are waiting for.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunError {
    #[error("Message too short")]
    Truncated,

    #[error("Not a STUN message")]
    NotStun,

    #[error("Unexpected message type {0:#06x}")]
    UnexpectedType(u16),

    #[error("Transaction ID mismatch")]
    TransactionMismatch,

    #[error("No IPv4 mapped address in response")]
    NoMappedAddress,
}

/// Encode a Binding Request.
pub fn binding_request(txid: &TransactionId) -> [u8; HEADER_LEN] {
    let mut msg = [0u8; HEADER_LEN];
    msg[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // Message length stays 0: no attributes.
    msg[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg[8..20].copy_from_slice(txid);
    msg
}

/// Extract the mapped address from a Binding Success Response.
///
/// XOR-MAPPED-ADDRESS is preferred; MAPPED-ADDRESS is accepted from servers
/// that only send the classic attribute.
pub fn parse_binding_response(buf: &[u8], txid: &TransactionId) -> Result<SocketAddrV4, StunError> {
    if buf.len() < HEADER_LEN {
        return Err(StunError::Truncated);
    }
    if buf[0] & 0xc0 != 0 || buf[4..8] != MAGIC_COOKIE.to_be_bytes() {
        return Err(StunError::NotStun);
    }
    let msg_type = u16::from_be_bytes([buf[0], buf[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(StunError::UnexpectedType(msg_type));
    }
    if buf[8..20] != txid[..] {
        return Err(StunError::TransactionMismatch);
    }

    let body_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let body = buf
        .get(HEADER_LEN..HEADER_LEN + body_len)
        .ok_or(StunError::Truncated)?;

    let mut mapped = None;
    let mut offset = 0;
    while offset + 4 <= body.len() {
        let attr_type = u16::from_be_bytes([body[offset], body[offset + 1]]);
        let attr_len = u16::from_be_bytes([body[offset + 2], body[offset + 3]]) as usize;
        let value = body
            .get(offset + 4..offset + 4 + attr_len)
            .ok_or(StunError::Truncated)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = decode_address(value, true) {
                    return Ok(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = mapped.or(decode_address(value, false)),
            _ => {}
        }

        // Attributes are padded to 4 bytes.
        offset += 4 + attr_len.div_ceil(4) * 4;
    }

    mapped.ok_or(StunError::NoMappedAddress)
}

fn decode_address(value: &[u8], xor: bool) -> Option<SocketAddrV4> {
    if value.len() < 8 || value[1] != FAMILY_IPV4 {
        return None;
    }
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let mut ip = u32::from_be_bytes([value[4], value[5], value[6], value[7]]);
    if xor {
        port ^= (MAGIC_COOKIE >> 16) as u16;
        ip ^= MAGIC_COOKIE;
    }
    Some(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

/// Encode a Binding Success Response carrying XOR-MAPPED-ADDRESS.
#[cfg(any(test, feature = "test-util"))]
pub fn binding_success(txid: &TransactionId, mapped: SocketAddrV4) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HEADER_LEN + 12);
    msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
    msg.extend_from_slice(&12u16.to_be_bytes());
    msg.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    msg.extend_from_slice(txid);
    msg.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
    msg.extend_from_slice(&8u16.to_be_bytes());
    msg.extend_from_slice(&[0, FAMILY_IPV4]);
    msg.extend_from_slice(&(mapped.port() ^ (MAGIC_COOKIE >> 16) as u16).to_be_bytes());
    msg.extend_from_slice(&(u32::from(*mapped.ip()) ^ MAGIC_COOKIE).to_be_bytes());
    msg
}
