//! Wire protocol codec for the observed cryptocurrency network.
//!
//! This crate covers the byte-level surface only: message framing with
//! double-SHA-256 checksums, var-ints, network addresses, the handshake
//! version payload, inventory vectors, transaction and block parsing
//! (segwit-aware) and standard output-script address recognition. Peer
//! lifecycle and I/O policy live in higher-level crates.

pub mod address;
pub mod block;
pub mod encoding;
pub mod error;
pub mod hash;
pub mod inventory;
pub mod message;
pub mod script;
pub mod transaction;
pub mod version;

pub use address::{parse_addr_payload, NetAddress};
pub use block::{coinbase_height, difficulty_from_bits, Block, BlockHeader};
pub use error::ProtocolError;
pub use hash::{checksum, sha256d, Hash256};
pub use inventory::{encode_inv_payload, parse_inv_payload, InvKind, InvSummary, InvVector};
pub use message::{
    encode_frame, FrameCodec, RawMessage, HEADER_SIZE, MAGIC_MAINNET, PAYLOAD_MAX_SIZE,
    PROTOCOL_VERSION, SERVICES_NODE_NETWORK, SERVICES_NONE,
};
pub use script::extract_address;
pub use transaction::{Transaction, TxInput, TxOutput};
pub use version::{VersionMessage, USER_AGENT};
