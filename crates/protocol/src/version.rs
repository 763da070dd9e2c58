//! The version message exchanged during the handshake.

use std::net::IpAddr;

use rand::Rng;

use crate::address::NetAddress;
use crate::encoding::{write_varstring, SliceReader};
use crate::error::ProtocolError;
use crate::message::{PROTOCOL_VERSION, SERVICES_NODE_NETWORK, SERVICES_NONE};

/// User agent advertised to peers.
pub const USER_AGENT: &str = concat!("/chainwatch:", env!("CARGO_PKG_VERSION"), "/");

/// Protocol version from which the trailing relay flag exists.
const RELAY_FROM_VERSION: i32 = 70001;

/// Handshake version payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    /// Builds the observer's own version message for a remote peer.
    ///
    /// Start-height 0 and services 0: we hold no chain and serve nothing.
    pub fn for_peer(remote_ip: IpAddr, remote_port: u16, unix_now: i64) -> Self {
        VersionMessage {
            version: PROTOCOL_VERSION,
            services: SERVICES_NONE,
            timestamp: unix_now,
            addr_recv: NetAddress::new(remote_ip, remote_port, SERVICES_NODE_NETWORK),
            addr_from: NetAddress::unspecified(SERVICES_NONE),
            nonce: rand::thread_rng().gen(),
            user_agent: USER_AGENT.to_string(),
            start_height: 0,
            relay: true,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(96 + self.user_agent.len());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        self.addr_recv.write(&mut out);
        self.addr_from.write(&mut out);
        out.extend_from_slice(&self.nonce.to_le_bytes());
        write_varstring(&mut out, &self.user_agent);
        out.extend_from_slice(&self.start_height.to_le_bytes());
        if self.version >= RELAY_FROM_VERSION {
            out.push(u8::from(self.relay));
        }
        out
    }

    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 80 {
            return Err(ProtocolError::Malformed {
                context: "version payload too short",
            });
        }

        let mut reader = SliceReader::new(payload);
        let version = reader.read_i32_le()?;
        let services = reader.read_u64_le()?;
        let timestamp = reader.read_i64_le()?;
        let addr_recv = NetAddress::read(&mut reader)?;
        let addr_from = NetAddress::read(&mut reader)?;
        let nonce = reader.read_u64_le()?;
        let user_agent = reader.read_varstring()?;
        let start_height = reader.read_i32_le()?;

        // Relay is optional; peers older than 70001 simply end here.
        let relay = if version >= RELAY_FROM_VERSION && !reader.is_empty() {
            reader.read_u8()? != 0
        } else {
            false
        };

        Ok(VersionMessage {
            version,
            services,
            timestamp,
            addr_recv,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let msg = VersionMessage::for_peer("198.51.100.7".parse().unwrap(), 8333, 1_700_000_000);
        let parsed = VersionMessage::parse(&msg.encode()).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.start_height, 0);
        assert_eq!(parsed.services, SERVICES_NONE);
        assert!(parsed.relay);
        assert!(parsed.user_agent.starts_with("/chainwatch:"));
    }

    #[test]
    fn pre_relay_version_has_no_trailing_byte() {
        let mut msg = VersionMessage::for_peer("198.51.100.7".parse().unwrap(), 8333, 0);
        msg.version = 70000;
        let encoded = msg.encode();

        let parsed = VersionMessage::parse(&encoded).unwrap();
        assert!(!parsed.relay);
        // Re-encoding an old version must not grow the payload.
        assert_eq!(parsed.encode().len(), encoded.len());
    }

    #[test]
    fn short_payload_rejected() {
        assert!(matches!(
            VersionMessage::parse(&[0u8; 79]),
            Err(ProtocolError::Malformed { .. })
        ));
    }
}
