//! Block parsing: header, hash, derived height and difficulty.

use crate::encoding::SliceReader;
use crate::error::ProtocolError;
use crate::hash::{sha256d, Hash256};
use crate::transaction::Transaction;

/// The 80-byte block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash256,
    pub merkle_root: Hash256,
    /// Epoch seconds.
    pub timestamp: u32,
    /// Compact difficulty encoding.
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SIZE: usize = 80;

    pub(crate) fn read(reader: &mut SliceReader<'_>) -> Result<Self, ProtocolError> {
        Ok(BlockHeader {
            version: reader.read_i32_le()?,
            prev_block_hash: Hash256::from_bytes(reader.read_array::<32>()?),
            merkle_root: Hash256::from_bytes(reader.read_array::<32>()?),
            timestamp: reader.read_u32_le()?,
            bits: reader.read_u32_le()?,
            nonce: reader.read_u32_le()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(self.prev_block_hash.as_bytes());
        out[36..68].copy_from_slice(self.merkle_root.as_bytes());
        out[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        out[72..76].copy_from_slice(&self.bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    /// Block hash: double-SHA-256 over the 80 header bytes.
    pub fn hash(&self) -> Hash256 {
        sha256d(&self.to_bytes())
    }
}

/// A parsed block with its derived attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash256,
    /// Height decoded from the coinbase script; 0 when absent.
    pub height: i32,
    pub difficulty: f64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Parses a `block` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < BlockHeader::SIZE {
            return Err(ProtocolError::Malformed {
                context: "block payload too short",
            });
        }

        let hash = sha256d(&payload[..BlockHeader::SIZE]);

        let mut reader = SliceReader::new(payload);
        let header = BlockHeader::read(&mut reader)?;

        let tx_count = reader.read_varint()?;
        let mut transactions = Vec::new();
        for _ in 0..tx_count {
            transactions.push(Transaction::read(&mut reader)?);
        }

        let height = transactions
            .first()
            .map(coinbase_height)
            .unwrap_or_default();

        Ok(Block {
            header,
            hash,
            height,
            difficulty: difficulty_from_bits(header.bits),
            transactions,
        })
    }

    /// Transaction ids in block order, for confirmation posting.
    pub fn tx_ids(&self) -> Vec<Hash256> {
        self.transactions.iter().map(|tx| tx.txid).collect()
    }
}

/// Decodes the block height from the coinbase signature script: one length
/// byte N (1..8) followed by N little-endian bytes. A zero or truncated
/// prefix yields height 0.
pub fn coinbase_height(coinbase: &Transaction) -> i32 {
    let Some(input) = coinbase.inputs.first() else {
        return 0;
    };
    let script = &input.script_sig;
    if script.is_empty() {
        return 0;
    }

    let len = script[0] as usize;
    if len == 0 || len > 8 || script.len() < 1 + len {
        return 0;
    }

    let mut height: i64 = 0;
    for (i, &byte) in script[1..1 + len].iter().enumerate() {
        height |= i64::from(byte) << (8 * i);
    }
    height as i32
}

/// Converts the compact "bits" field into a difficulty figure:
/// `(0xFFFF / coefficient) × 2^(8 × (0x1d − exponent))`.
pub fn difficulty_from_bits(bits: u32) -> f64 {
    let exponent = bits >> 24;
    let coefficient = f64::from(bits & 0x007f_ffff);
    if coefficient == 0.0 {
        return 0.0;
    }
    let shift = 8 * (0x1d_i32 - exponent as i32);
    (f64::from(0xffffu32) / coefficient) * (shift as f64).exp2()
}
