//! Transaction parsing, including the segregated-witness extension.
//!
//! The txid commits to the legacy (non-witness) serialization only, so a
//! parsed transaction re-serializes through [`Transaction::to_legacy_bytes`]
//! both for identification and for round-trips; witness bytes are consumed
//! during parsing and discarded.

use crate::encoding::{write_varint, SliceReader};
use crate::error::ProtocolError;
use crate::hash::{sha256d, Hash256};

/// One transaction input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxInput {
    pub prev_hash: Hash256,
    pub prev_index: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    /// Coinbase inputs reference the all-zero txid.
    pub fn is_coinbase(&self) -> bool {
        self.prev_hash.is_zero()
    }
}

/// One transaction output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    /// Value in satoshi.
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

/// A fully parsed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
    /// Double-SHA-256 of the legacy serialization.
    pub txid: Hash256,
    pub has_witness: bool,
    /// Bytes consumed from the wire, witness included.
    pub size_bytes: usize,
}

impl Transaction {
    /// Parses a standalone `tx` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = SliceReader::new(payload);
        Self::read(&mut reader)
    }

    /// Parses one transaction from the cursor; used for both `tx` payloads
    /// and the transaction list of a block.
    pub(crate) fn read(reader: &mut SliceReader<'_>) -> Result<Self, ProtocolError> {
        let start = reader.consumed();

        let version = reader.read_i32_le()?;

        // Segwit marker: a zero byte where the input count would be,
        // followed by the 0x01 flag. A non-zero byte is the input count
        // itself and the cursor steps back over it.
        let mut has_witness = false;
        let marker = reader.read_u8()?;
        if marker == 0x00 {
            let flag = reader.read_u8()?;
            if flag == 0x01 {
                has_witness = true;
            }
        } else {
            reader.step_back(1);
        }

        let input_count = reader.read_varint()?;
        let mut inputs = Vec::new();
        for _ in 0..input_count {
            let prev_hash = Hash256::from_bytes(reader.read_array::<32>()?);
            let prev_index = reader.read_u32_le()?;
            let script_len = reader.read_varint()? as usize;
            let script_sig = reader.read_bytes(script_len)?.to_vec();
            let sequence = reader.read_u32_le()?;
            inputs.push(TxInput {
                prev_hash,
                prev_index,
                script_sig,
                sequence,
            });
        }

        let output_count = reader.read_varint()?;
        let mut outputs = Vec::new();
        for _ in 0..output_count {
            let value = reader.read_i64_le()?;
            let script_len = reader.read_varint()? as usize;
            let script_pubkey = reader.read_bytes(script_len)?.to_vec();
            outputs.push(TxOutput {
                value,
                script_pubkey,
            });
        }

        if has_witness {
            // One stack per input; items are consumed and dropped.
            for _ in 0..inputs.len() {
                let stack_items = reader.read_varint()?;
                for _ in 0..stack_items {
                    let item_len = reader.read_varint()? as usize;
                    reader.read_bytes(item_len)?;
                }
            }
        }

        let lock_time = reader.read_u32_le()?;
        let size_bytes = reader.consumed() - start;

        let mut tx = Transaction {
            version,
            inputs,
            outputs,
            lock_time,
            txid: Hash256::ZERO,
            has_witness,
            size_bytes,
        };
        tx.txid = sha256d(&tx.to_legacy_bytes());
        Ok(tx)
    }

    /// The legacy (pre-witness) serialization: the txid preimage.
    pub fn to_legacy_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size_bytes);
        out.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(input.prev_hash.as_bytes());
            out.extend_from_slice(&input.prev_index.to_le_bytes());
            write_varint(&mut out, input.script_sig.len() as u64);
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut out, output.script_pubkey.len() as u64);
            out.extend_from_slice(&output.script_pubkey);
        }

        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    /// Approximate weight units. Without witness data this is exact
    /// (`size × 4`); with witness data the `size × 3` factor is a rough
    /// average, not the per-section weighted sum.
    pub fn weight(&self) -> usize {
        if self.has_witness {
            self.size_bytes * 3
        } else {
            self.size_bytes * 4
        }
    }

    /// Sum of output values in satoshi.
    pub fn total_output(&self) -> i64 {
        self.outputs.iter().map(|o| o.value).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-assembles a 1-in/2-out legacy transaction.
    fn legacy_tx_bytes() -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&2i32.to_le_bytes()); // version
        out.push(1); // input count
        out.extend_from_slice(&[0x11; 32]); // prev txid
        out.extend_from_slice(&3u32.to_le_bytes()); // prev index
        out.push(2); // script len
        out.extend_from_slice(&[0xab, 0xcd]);
        out.extend_from_slice(&0xffff_ffffu32.to_le_bytes()); // sequence
        out.push(2); // output count
        out.extend_from_slice(&50_000i64.to_le_bytes());
        out.push(1);
        out.push(0x6a); // OP_RETURN
        out.extend_from_slice(&12_345i64.to_le_bytes());
        out.push(0); // empty script
        out.extend_from_slice(&0u32.to_le_bytes()); // lock time
        out
    }

    /// The same transaction with a witness stack spliced in.
    fn witness_tx_bytes() -> Vec<u8> {
        let legacy = legacy_tx_bytes();
        let mut out = Vec::new();
        out.extend_from_slice(&legacy[..4]); // version
        out.push(0x00); // marker
        out.push(0x01); // flag
        out.extend_from_slice(&legacy[4..legacy.len() - 4]); // inputs + outputs
        out.push(2); // witness stack: two items
        out.push(3);
        out.extend_from_slice(&[0xde, 0xad, 0x00]);
        out.push(1);
        out.push(0x51);
        out.extend_from_slice(&legacy[legacy.len() - 4..]); // lock time
        out
    }

    #[test]
    fn parses_legacy_transaction() {
        let bytes = legacy_tx_bytes();
        let tx = Transaction::parse(&bytes).unwrap();

        assert_eq!(tx.version, 2);
        assert_eq!(tx.inputs.len(), 1);
        assert_eq!(tx.inputs[0].prev_index, 3);
        assert_eq!(tx.inputs[0].script_sig, vec![0xab, 0xcd]);
        assert_eq!(tx.outputs.len(), 2);
        assert_eq!(tx.outputs[0].value, 50_000);
        assert_eq!(tx.total_output(), 62_345);
        assert!(!tx.has_witness);
        assert_eq!(tx.size_bytes, bytes.len());
        assert_eq!(tx.weight(), bytes.len() * 4);
    }

    #[test]
    fn roundtrip_matches_input() {
        let bytes = legacy_tx_bytes();
        let tx = Transaction::parse(&bytes).unwrap();
        assert_eq!(tx.to_legacy_bytes(), bytes);

        let reparsed = Transaction::parse(&tx.to_legacy_bytes()).unwrap();
        assert_eq!(reparsed, tx);
    }

    #[test]
    fn txid_ignores_witness_data() {
        let legacy = Transaction::parse(&legacy_tx_bytes()).unwrap();
        let witness_bytes = witness_tx_bytes();
        let witness = Transaction::parse(&witness_bytes).unwrap();

        assert!(witness.has_witness);
        assert_eq!(witness.txid, legacy.txid);
        assert_eq!(witness.txid, sha256d(&legacy_tx_bytes()));
        // Size accounts for the marker, flag and witness bytes.
        assert_eq!(witness.size_bytes, witness_bytes.len());
        assert!(witness.size_bytes > legacy.size_bytes);
    }

    #[test]
    fn coinbase_detection() {
        let mut bytes = legacy_tx_bytes();
        // Zero out the previous txid.
        for b in &mut bytes[5..37] {
            *b = 0;
        }
        let tx = Transaction::parse(&bytes).unwrap();
        assert!(tx.inputs[0].is_coinbase());
    }

    #[test]
    fn truncated_transaction_fails() {
        let bytes = legacy_tx_bytes();
        for cut in [3, 10, 40, bytes.len() - 1] {
            assert!(
                Transaction::parse(&bytes[..cut]).is_err(),
                "cut at {cut} accepted"
            );
        }
    }
}
