//! Network addresses as carried by version and addr payloads.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::encoding::SliceReader;
use crate::error::ProtocolError;

/// Cap on addr-list entries; anything past it in a single message is noise.
const MAX_ADDR_ENTRIES: u64 = 1000;

/// A 26-byte wire address: services, 16-byte IP, big-endian port.
///
/// IPv4 addresses ride in the IPv6 space as `::ffff:a.b.c.d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetAddress {
    pub fn new(ip: IpAddr, port: u16, services: u64) -> Self {
        let bytes = match ip {
            IpAddr::V4(v4) => {
                let mut mapped = [0u8; 16];
                mapped[10] = 0xff;
                mapped[11] = 0xff;
                mapped[12..].copy_from_slice(&v4.octets());
                mapped
            }
            IpAddr::V6(v6) => v6.octets(),
        };
        NetAddress {
            services,
            ip: bytes,
            port,
        }
    }

    /// The unroutable all-zero address used as our own `addr_from`.
    pub fn unspecified(services: u64) -> Self {
        NetAddress::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, services)
    }

    /// Extracts the IPv4 address if this is an IPv4-mapped entry.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        let mapped = self.ip[..10].iter().all(|&b| b == 0)
            && self.ip[10] == 0xff
            && self.ip[11] == 0xff;
        if mapped {
            Some(Ipv4Addr::new(
                self.ip[12],
                self.ip[13],
                self.ip[14],
                self.ip[15],
            ))
        } else {
            None
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ipv4()
            .map(|ip| SocketAddr::new(IpAddr::V4(ip), self.port))
    }

    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.services.to_le_bytes());
        out.extend_from_slice(&self.ip);
        out.extend_from_slice(&self.port.to_be_bytes());
    }

    pub(crate) fn read(reader: &mut SliceReader<'_>) -> Result<Self, ProtocolError> {
        let services = reader.read_u64_le()?;
        let ip = reader.read_array::<16>()?;
        let port = reader.read_u16_be()?;
        Ok(NetAddress { services, ip, port })
    }
}

/// Parses an `addr` payload, keeping only IPv4-mapped entries.
///
/// Truncated tails end the parse without error; announcements are
/// best-effort input, not something worth dropping a peer over.
pub fn parse_addr_payload(payload: &[u8]) -> Vec<SocketAddr> {
    let mut reader = SliceReader::new(payload);
    let mut addrs = Vec::new();

    let Ok(count) = reader.read_varint() else {
        return addrs;
    };

    for _ in 0..count.min(MAX_ADDR_ENTRIES) {
        // Leading 4-byte timestamp distinguishes addr entries from the
        // bare 26-byte form inside version payloads.
        if reader.read_u32_le().is_err() {
            break;
        }
        let Ok(addr) = NetAddress::read(&mut reader) else {
            break;
        };
        if let Some(socket) = addr.socket_addr() {
            addrs.push(socket);
        }
    }

    addrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::write_varint;

    fn addr_entry(out: &mut Vec<u8>, ip: IpAddr, port: u16) {
        out.extend_from_slice(&1u32.to_le_bytes()); // timestamp
        NetAddress::new(ip, port, 1).write(out);
    }

    #[test]
    fn ipv4_mapping_roundtrip() {
        let addr = NetAddress::new(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)), 8333, 1);
        assert_eq!(addr.ipv4(), Some(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(
            addr.socket_addr(),
            Some("93.184.216.34:8333".parse().unwrap())
        );

        let mut buf = Vec::new();
        addr.write(&mut buf);
        assert_eq!(buf.len(), 26);

        let mut reader = SliceReader::new(&buf);
        assert_eq!(NetAddress::read(&mut reader).unwrap(), addr);
    }

    #[test]
    fn ipv6_is_not_ipv4() {
        let addr = NetAddress::new("2001:db8::1".parse().unwrap(), 8333, 0);
        assert_eq!(addr.ipv4(), None);
        assert_eq!(addr.socket_addr(), None);
    }

    #[test]
    fn addr_payload_filters_to_ipv4() {
        let mut payload = Vec::new();
        write_varint(&mut payload, 3);
        addr_entry(&mut payload, "10.0.0.1".parse().unwrap(), 8333);
        addr_entry(&mut payload, "2001:db8::2".parse().unwrap(), 8333);
        addr_entry(&mut payload, "10.0.0.2".parse().unwrap(), 8334);

        let addrs = parse_addr_payload(&payload);
        assert_eq!(
            addrs,
            vec![
                "10.0.0.1:8333".parse().unwrap(),
                "10.0.0.2:8334".parse().unwrap()
            ]
        );
    }

    #[test]
    fn addr_payload_tolerates_truncation() {
        let mut payload = Vec::new();
        write_varint(&mut payload, 2);
        addr_entry(&mut payload, "10.0.0.1".parse().unwrap(), 8333);
        payload.extend_from_slice(&[0u8; 5]); // half an entry

        let addrs = parse_addr_payload(&payload);
        assert_eq!(addrs.len(), 1);
    }
}
