// invtrace: Passive Measurement of Inventory Propagation and Peer Latency from Captured P2P Traffic
// Copyright (C) 2024-2025 Roland Schmid <roschmi@ethz.ch> and Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//! Decoder for the Bitcoin P2P message framing.
//!
//! A frame is a 24 byte header followed by the payload:
//!
//! | bytes  | field                                        |
//! |--------|----------------------------------------------|
//! | 0..4   | network magic                                |
//! | 4..16  | command, ASCII, padded with NUL              |
//! | 16..20 | payload length, u32 little endian            |
//! | 20..24 | first 4 bytes of SHA256(SHA256(payload))      |
use std::str::FromStr;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const HEADER_LEN: usize = 24;
pub const MAX_PAYLOAD_LEN: usize = 32 * 1024 * 1024;
pub const MAX_INV_ENTRIES: u64 = 50_000;
/// Inventory type of a block.
pub const MSG_BLOCK: u32 = 2;
/// Inventory type of a transaction.
pub const MSG_TX: u32 = 1;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    strum::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    Regtest,
    Signet,
}

impl Network {
    pub fn magic(&self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Self::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Self::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
            Self::Signet => [0x0a, 0x03, 0xcf, 0x40],
        }
    }
}

/// Commands known to the protocol. Anything else is still framed, but never interpreted.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum Command {
    Version,
    Verack,
    Addr,
    AddrV2,
    SendAddrV2,
    Inv,
    GetData,
    NotFound,
    GetBlocks,
    GetHeaders,
    Tx,
    Block,
    Headers,
    GetAddr,
    Mempool,
    Ping,
    Pong,
    Reject,
    SendHeaders,
    FeeFilter,
    SendCmpct,
    CmpctBlock,
    GetBlockTxn,
    BlockTxn,
    WtxidRelay,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Header too short: got {got} of {HEADER_LEN} bytes")]
    HeaderTooShort { got: usize },
    #[error("Payload too short: got {got} of {expected} bytes")]
    PayloadTooShort { expected: usize, got: usize },
    #[error("Invalid magic {}", hex::encode(.0))]
    InvalidMagic([u8; 4]),
    #[error("Payload of {0} bytes exceeds the maximum length")]
    PayloadTooLong(usize),
    #[error("Invalid checksum on {command} payload")]
    InvalidChecksum { command: String },
    #[error("Invalid {command} payload: {reason}")]
    InvalidPayload {
        command: Command,
        reason: &'static str,
    },
}

impl ProtocolError {
    /// The buffer is a valid prefix of a frame, but more bytes are needed.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Self::HeaderTooShort { .. } | Self::PayloadTooShort { .. }
        )
    }
}

/// One announced inventory item.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InvEntry {
    pub inv_type: u32,
    /// Hex encoded hash, in the byte order used for display (reversed wire order).
    pub hash: String,
}

impl InvEntry {
    pub fn is_block(&self) -> bool {
        self.inv_type == MSG_BLOCK
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Inv { entries: Vec<InvEntry>, count: u64 },
    /// Pings before BIP 31 carry no nonce.
    Ping { nonce: Option<u64> },
    Pong { nonce: u64 },
    /// Any other command. The payload was checked against the checksum but not decoded.
    Other { command: String },
}

impl Message {
    pub fn command(&self) -> &str {
        match self {
            Self::Inv { .. } => "inv",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Other { command } => command,
        }
    }
}

/// Turns the beginning of a byte buffer into a message.
pub trait Decoder {
    /// Decode the frame at the start of `data`. On success, the frame is removed from `data` and
    /// the remainder stays. On error, `data` is left untouched.
    fn decode(&self, data: &mut Bytes) -> Result<Message, ProtocolError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitcoinDecoder {
    magic: [u8; 4],
}

impl BitcoinDecoder {
    pub fn new(network: Network) -> Self {
        Self {
            magic: network.magic(),
        }
    }
}

impl Default for BitcoinDecoder {
    fn default() -> Self {
        Self::new(Network::default())
    }
}

impl Decoder for BitcoinDecoder {
    fn decode(&self, data: &mut Bytes) -> Result<Message, ProtocolError> {
        if data.len() < HEADER_LEN {
            return Err(ProtocolError::HeaderTooShort { got: data.len() });
        }
        if data[..4] != self.magic {
            let mut magic = [0; 4];
            magic.copy_from_slice(&data[..4]);
            return Err(ProtocolError::InvalidMagic(magic));
        }
        let len = LittleEndian::read_u32(&data[16..20]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(ProtocolError::PayloadTooLong(len));
        }
        if data.len() < HEADER_LEN + len {
            return Err(ProtocolError::PayloadTooShort {
                expected: len,
                got: data.len() - HEADER_LEN,
            });
        }

        let command = parse_command(&data[4..16]);
        let payload = &data[HEADER_LEN..HEADER_LEN + len];
        if checksum(payload) != data[20..24] {
            return Err(ProtocolError::InvalidChecksum { command });
        }
        let msg = parse_payload(command, payload)?;

        data.advance(HEADER_LEN + len);
        Ok(msg)
    }
}

fn parse_command(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn checksum(payload: &[u8]) -> [u8; 4] {
    let digest = Sha256::digest(Sha256::digest(payload));
    let mut checksum = [0; 4];
    checksum.copy_from_slice(&digest[..4]);
    checksum
}

fn parse_payload(command: String, mut payload: &[u8]) -> Result<Message, ProtocolError> {
    match Command::from_str(&command) {
        Ok(Command::Inv) => {
            let invalid = |reason| ProtocolError::InvalidPayload {
                command: Command::Inv,
                reason,
            };
            let count = read_varint(&mut payload).ok_or(invalid("missing count"))?;
            if count > MAX_INV_ENTRIES {
                return Err(invalid("too many entries"));
            }
            let mut entries = Vec::with_capacity(count as usize);
            for _ in 0..count {
                if payload.remaining() < 36 {
                    return Err(invalid("truncated entry"));
                }
                let inv_type = payload.get_u32_le();
                let mut hash = [0; 32];
                payload.copy_to_slice(&mut hash);
                hash.reverse();
                entries.push(InvEntry {
                    inv_type,
                    hash: hex::encode(hash),
                });
            }
            Ok(Message::Inv { entries, count })
        }
        Ok(Command::Ping) => Ok(Message::Ping {
            nonce: (payload.remaining() >= 8).then(|| payload.get_u64_le()),
        }),
        Ok(Command::Pong) => {
            if payload.remaining() < 8 {
                return Err(ProtocolError::InvalidPayload {
                    command: Command::Pong,
                    reason: "missing nonce",
                });
            }
            Ok(Message::Pong {
                nonce: payload.get_u64_le(),
            })
        }
        _ => Ok(Message::Other { command }),
    }
}

fn read_varint(buf: &mut &[u8]) -> Option<u64> {
    if !buf.has_remaining() {
        return None;
    }
    let (width, first) = match buf.get_u8() {
        0xfd => (2, None),
        0xfe => (4, None),
        0xff => (8, None),
        n => (0, Some(n as u64)),
    };
    if let Some(n) = first {
        return Some(n);
    }
    (buf.remaining() >= width).then(|| buf.get_uint_le(width))
}

fn write_varint(buf: &mut BytesMut, n: u64) {
    match n {
        0..=0xfc => buf.put_u8(n as u8),
        0xfd..=0xffff => {
            buf.put_u8(0xfd);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xffff_ffff => {
            buf.put_u8(0xfe);
            buf.put_u32_le(n as u32);
        }
        _ => {
            buf.put_u8(0xff);
            buf.put_u64_le(n);
        }
    }
}

/// Build a complete frame for `command` carrying `payload`.
pub fn encode_frame(network: Network, command: &str, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(&network.magic());
    let mut cmd = [0u8; 12];
    let cmd_len = command.len().min(12);
    cmd[..cmd_len].copy_from_slice(&command.as_bytes()[..cmd_len]);
    buf.put_slice(&cmd);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(&checksum(payload));
    buf.put_slice(payload);
    buf.freeze()
}

/// Build an `inv` payload. Hashes are given in display order.
pub fn encode_inv(entries: &[InvEntry]) -> Result<Bytes, hex::FromHexError> {
    let mut buf = BytesMut::new();
    write_varint(&mut buf, entries.len() as u64);
    for entry in entries {
        let mut hash = [0u8; 32];
        hex::decode_to_slice(&entry.hash, &mut hash)?;
        hash.reverse();
        buf.put_u32_le(entry.inv_type);
        buf.put_slice(&hash);
    }
    Ok(buf.freeze())
}

/// Build a `ping` or `pong` payload.
pub fn encode_nonce(nonce: u64) -> Bytes {
    Bytes::copy_from_slice(&nonce.to_le_bytes())
}
