//! Message framing: `magic || command || length || checksum || payload`.
//!
//! The 24-byte header identifies the network, names the command and commits
//! to the payload with the first four bytes of its double-SHA-256. A
//! [`FrameCodec`] implementing the tokio codec traits keeps partial reads
//! buffered so the session loop can be cancelled between frames safely.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::hash::checksum;

/// Network magic for the observed mainnet.
pub const MAGIC_MAINNET: u32 = 0xD9B4_BEF9;

/// Protocol version advertised in our version message.
pub const PROTOCOL_VERSION: i32 = 70015;

/// Services bitmask for a node that offers nothing (an observer).
pub const SERVICES_NONE: u64 = 0;

/// Services bit advertised by full network nodes.
pub const SERVICES_NODE_NETWORK: u64 = 1;

/// Frame header size on the wire.
pub const HEADER_SIZE: usize = 24;

/// Upper bound on a single payload; larger frames are rejected before the
/// payload is buffered.
pub const PAYLOAD_MAX_SIZE: usize = 0x0200_0000; // 32 MiB

/// A framed message with the command still in its 12-byte padded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: [u8; 12],
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(command: &str, payload: Vec<u8>) -> Self {
        let mut cmd = [0u8; 12];
        cmd[..command.len()].copy_from_slice(command.as_bytes());
        RawMessage { command: cmd, payload }
    }

    /// The command with NUL padding stripped. Non-ASCII commands come back
    /// empty and fall through dispatch as "unknown".
    pub fn command(&self) -> &str {
        let end = self
            .command
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.command.len());
        std::str::from_utf8(&self.command[..end]).unwrap_or("")
    }
}

/// Serializes a complete frame for `command` around `payload`.
pub fn encode_frame(command: &str, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&MAGIC_MAINNET.to_le_bytes());

    let mut cmd = [0u8; 12];
    cmd[..command.len()].copy_from_slice(command.as_bytes());
    out.extend_from_slice(&cmd);

    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&checksum(payload));
    out.extend_from_slice(payload);
    out
}

struct PendingHeader {
    command: [u8; 12],
    length: usize,
    checksum: [u8; 4],
}

/// Stateful frame codec for use with `tokio_util::codec::Framed`.
///
/// Decoding is resumable: a frame split across reads leaves the header
/// parked in the codec and the buffer intact, so dropping an in-flight read
/// future never desynchronizes the stream.
#[derive(Default)]
pub struct FrameCodec {
    pending: Option<PendingHeader>,
}

impl FrameCodec {
    pub fn new() -> Self {
        FrameCodec { pending: None }
    }

    fn parse_header(src: &mut BytesMut) -> Result<PendingHeader, ProtocolError> {
        let magic = u32::from_le_bytes(src[0..4].try_into().expect("sliced"));
        if magic != MAGIC_MAINNET {
            return Err(ProtocolError::InvalidMagic {
                got: magic,
                expected: MAGIC_MAINNET,
            });
        }

        let mut command = [0u8; 12];
        command.copy_from_slice(&src[4..16]);
        let length = u32::from_le_bytes(src[16..20].try_into().expect("sliced")) as usize;
        let mut checksum = [0u8; 4];
        checksum.copy_from_slice(&src[20..24]);

        if length > PAYLOAD_MAX_SIZE {
            return Err(ProtocolError::OversizedPayload { length });
        }

        src.advance(HEADER_SIZE);
        Ok(PendingHeader {
            command,
            length,
            checksum,
        })
    }
}

impl Decoder for FrameCodec {
    type Item = RawMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawMessage>, ProtocolError> {
        if self.pending.is_none() {
            if src.len() < HEADER_SIZE {
                return Ok(None);
            }
            self.pending = Some(Self::parse_header(src)?);
        }

        let header = self.pending.as_ref().expect("pending header");
        if src.len() < header.length {
            src.reserve(header.length - src.len());
            return Ok(None);
        }

        let header = self.pending.take().expect("pending header");
        let payload = src.split_to(header.length).to_vec();
        if checksum(&payload) != header.checksum {
            let message = RawMessage {
                command: header.command,
                payload,
            };
            return Err(ProtocolError::ChecksumMismatch {
                command: message.command().to_string(),
            });
        }

        Ok(Some(RawMessage {
            command: header.command,
            payload,
        }))
    }
}

impl Encoder<RawMessage> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: RawMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if item.payload.len() > PAYLOAD_MAX_SIZE {
            return Err(ProtocolError::OversizedPayload {
                length: item.payload.len(),
            });
        }
        dst.extend_from_slice(&encode_frame(item.command(), &item.payload));
        Ok(())
    }
}
