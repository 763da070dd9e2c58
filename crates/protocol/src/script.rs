//! Output-script address recognition.
//!
//! Recognizes the standard script templates of the observed mainnet and
//! renders the canonical address encoding for each: Base58Check for the
//! legacy hash templates, bech32 for witness v0, bech32m for taproot.
//! Non-standard scripts yield `None`.

use bech32::{ToBase32, Variant};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

use crate::hash::sha256d;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;

/// Base58Check version byte for pay-to-public-key-hash.
const VERSION_P2PKH: u8 = 0x00;
/// Base58Check version byte for pay-to-script-hash.
const VERSION_P2SH: u8 = 0x05;
/// Human-readable part for witness addresses.
const WITNESS_HRP: &str = "bc";

/// Decodes a locking script into an address string, or `None` for
/// non-standard scripts.
pub fn extract_address(script: &[u8]) -> Option<String> {
    match script {
        // OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG]
            if hash.len() == 20 =>
        {
            Some(base58check(VERSION_P2PKH, hash))
        }
        // OP_HASH160 <20> OP_EQUAL
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            Some(base58check(VERSION_P2SH, hash))
        }
        // OP_0 <20|32>: witness v0 key-hash or script-hash
        [OP_0, 0x14, program @ ..] if program.len() == 20 => segwit_address(0, program),
        [OP_0, 0x20, program @ ..] if program.len() == 32 => segwit_address(0, program),
        // OP_1 <32>: taproot
        [OP_1, 0x20, program @ ..] if program.len() == 32 => segwit_address(1, program),
        // <33|65-byte pubkey> OP_CHECKSIG: bare pay-to-public-key, rendered
        // as the address of the key's hash
        [0x21, key @ .., OP_CHECKSIG] if key.len() == 33 => {
            Some(base58check(VERSION_P2PKH, &hash160(key)))
        }
        [0x41, key @ .., OP_CHECKSIG] if key.len() == 65 => {
            Some(base58check(VERSION_P2PKH, &hash160(key)))
        }
        _ => None,
    }
}

/// RIPEMD-160 of SHA-256, the key/script hash used by legacy templates.
fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripe = Ripemd160::digest(sha);
    ripe.into()
}

fn base58check(version: u8, payload: &[u8]) -> String {
    let mut data = Vec::with_capacity(1 + payload.len() + 4);
    data.push(version);
    data.extend_from_slice(payload);
    let check = sha256d(&data);
    data.extend_from_slice(&check.as_bytes()[..4]);
    bs58::encode(data).into_string()
}

fn segwit_address(witness_version: u8, program: &[u8]) -> Option<String> {
    let variant = match witness_version {
        0 => Variant::Bech32,
        _ => Variant::Bech32m,
    };
    let mut data = vec![bech32::u5::try_from_u8(witness_version).ok()?];
    data.extend(program.to_base32());
    bech32::encode(WITNESS_HRP, data, variant).ok()
}
