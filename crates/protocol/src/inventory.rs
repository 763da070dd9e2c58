//! Inventory vectors: `inv` announcements and `getdata` requests.

use crate::encoding::{write_varint, SliceReader};
use crate::hash::Hash256;

/// Inventory kinds the observer acts on. Anything else is parsed and
/// dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum InvKind {
    Tx = 1,
    Block = 2,
}

/// A typed hash announcing one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvVector {
    pub kind: InvKind,
    pub hash: Hash256,
}

impl InvVector {
    pub fn tx(hash: Hash256) -> Self {
        InvVector {
            kind: InvKind::Tx,
            hash,
        }
    }

    pub fn block(hash: Hash256) -> Self {
        InvVector {
            kind: InvKind::Block,
            hash,
        }
    }
}

/// Parsed `inv` payload split by kind, in announcement order.
#[derive(Debug, Default)]
pub struct InvSummary {
    pub tx: Vec<InvVector>,
    pub blocks: Vec<InvVector>,
}

impl InvSummary {
    pub fn is_empty(&self) -> bool {
        self.tx.is_empty() && self.blocks.is_empty()
    }
}

/// Parses an `inv` payload. A truncated tail ends the parse, keeping the
/// vectors decoded so far.
pub fn parse_inv_payload(payload: &[u8]) -> InvSummary {
    let mut summary = InvSummary::default();
    let mut reader = SliceReader::new(payload);

    let Ok(count) = reader.read_varint() else {
        return summary;
    };

    for _ in 0..count {
        let Ok(kind) = reader.read_u32_le() else {
            break;
        };
        let Ok(bytes) = reader.read_array::<32>() else {
            break;
        };
        let hash = Hash256::from_bytes(bytes);

        match kind {
            1 => summary.tx.push(InvVector::tx(hash)),
            2 => summary.blocks.push(InvVector::block(hash)),
            _ => {} // recognized, ignored
        }
    }

    summary
}

/// Serializes vectors into an `inv`/`getdata` payload (same layout).
pub fn encode_inv_payload(vectors: &[InvVector]) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + vectors.len() * 36);
    write_varint(&mut out, vectors.len() as u64);
    for vector in vectors {
        out.extend_from_slice(&(vector.kind as u32).to_le_bytes());
        out.extend_from_slice(vector.hash.as_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(fill: u8) -> Hash256 {
        Hash256::from_bytes([fill; 32])
    }

    #[test]
    fn roundtrip_preserves_order() {
        let vectors = vec![
            InvVector::tx(hash(1)),
            InvVector::block(hash(2)),
            InvVector::tx(hash(3)),
        ];
        let payload = encode_inv_payload(&vectors);
        let summary = parse_inv_payload(&payload);

        assert_eq!(summary.tx, vec![InvVector::tx(hash(1)), InvVector::tx(hash(3))]);
        assert_eq!(summary.blocks, vec![InvVector::block(hash(2))]);
    }

    #[test]
    fn unknown_kinds_are_dropped() {
        let mut payload = Vec::new();
        write_varint(&mut payload, 2);
        payload.extend_from_slice(&7u32.to_le_bytes()); // some filtered kind
        payload.extend_from_slice(&[0xaa; 32]);
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&[0xbb; 32]);

        let summary = parse_inv_payload(&payload);
        assert_eq!(summary.tx, vec![InvVector::tx(hash(0xbb))]);
        assert!(summary.blocks.is_empty());
    }

    #[test]
    fn truncated_tail_keeps_prefix() {
        let mut payload = encode_inv_payload(&[InvVector::tx(hash(1)), InvVector::tx(hash(2))]);
        payload.truncate(payload.len() - 10);

        let summary = parse_inv_payload(&payload);
        assert_eq!(summary.tx, vec![InvVector::tx(hash(1))]);
    }

    #[test]
    fn empty_payload() {
        assert!(parse_inv_payload(&[]).is_empty());
        assert_eq!(encode_inv_payload(&[]), vec![0u8]);
    }
}
