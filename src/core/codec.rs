// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Line-oriented wire codec for the bootstrap/membership protocol (C1).
//!
//! One message per newline-terminated record, `|`-separated fields, except
//! `REQ` which is a multi-line snapshot terminated by the next frame or EOF.

use crate::core::types::{Address, AddressError, NetworkAddress, NetworkAddressError};
use thiserror::Error;

/// Hard cap on a decoded frame's size.
pub const MAX_FRAME_BYTES: usize = 65_536;

/// Codec errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Decoded frame exceeded [`MAX_FRAME_BYTES`].
    #[error("oversized frame")]
    OversizedFrame,
    /// The message-type token did not match any known variant.
    #[error("unknown message type")]
    UnknownMessageType,
    /// A required field was missing or could not be split out.
    #[error("malformed fields")]
    Malformed,
    /// An address field failed hex validation.
    #[error("invalid address")]
    InvalidAddress,
    /// A network address field failed `host:port` validation.
    #[error("invalid network address")]
    InvalidNetAddress,
    /// Frame was empty after sanitization.
    #[error("empty frame")]
    Empty,
}

impl From<AddressError> for CodecError {
    fn from(_: AddressError) -> Self {
        CodecError::InvalidAddress
    }
}

impl From<NetworkAddressError> for CodecError {
    fn from(_: NetworkAddressError) -> Self {
        CodecError::InvalidNetAddress
    }
}

/// Strip bytes outside `[0x20,0x7E] ∪ {CR, LF}` before any parsing is
/// attempted. Prevents control-character injection into framed text.
pub fn sanitize(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .copied()
        .filter(|&b| (0x20..=0x7E).contains(&b) || b == b'\r' || b == b'\n')
        .collect()
}

/// A single membership entry: address plus its known network address (empty
/// if not yet resolved).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeEntry {
    /// Node address.
    pub address: Address,
    /// Node's `host:port`, or [`NetworkAddress::empty`] if unresolved.
    pub network_address: NetworkAddress,
}

/// Tagged wire messages, centralizing what the legacy protocol expressed via
/// stringly-typed line prefixes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// `READY_REQUEST|<addr>|<netaddr>` — joiner opens membership.
    Ready {
        /// Joiner's address.
        addr: Address,
        /// Joiner's `host:port`.
        net_addr: NetworkAddress,
    },
    /// Multi-line initial snapshot sent by the bootstrap node.
    Req {
        /// Bootstrap's own address.
        self_addr: Address,
        /// Bootstrap's own `host:port`.
        self_net: NetworkAddress,
        /// Known membership entries.
        nodes: Vec<NodeEntry>,
        /// Epoch counter at snapshot time.
        nonce: u64,
    },
    /// Periodic topology broadcast.
    Nodes {
        /// Membership entries as `addr#netaddr` pairs.
        entries: Vec<NodeEntry>,
    },
    /// Paired with [`WireMessage::Nodes`].
    NodesCount(u32),
    /// Joiner liveness/sanity report.
    NodeOk {
        /// Joiner's view of the node count.
        count: u32,
        /// Joiner's view of the nonce.
        nonce: u64,
    },
    /// Request resolution of an address's network address.
    WhoIs(Address),
    /// Resolution reply.
    WhoIsResponse {
        /// Resolved address.
        addr: Address,
        /// Resolved `host:port`.
        net_addr: NetworkAddress,
    },
    /// Full view broadcast.
    ConsensusStatus {
        /// Opaque status code.
        status: i32,
        /// Current voter set.
        voters: Vec<Address>,
        /// Current node set.
        nodes: Vec<Address>,
        /// Epoch counter.
        nonce: u64,
    },
    /// Nonce refresh without a full snapshot.
    BroadcastNonce {
        /// New epoch value.
        nonce: u64,
        /// Node set at the time of refresh.
        nodes: Vec<Address>,
    },
    /// Liveness-only ping.
    Ping,
    /// Liveness-only keep-alive.
    KeepAlive,
    /// Opaque block payload (JSON), forwarded to the block pipeline.
    Block(String),
}

fn parse_addr(s: &str) -> Result<Address, CodecError> {
    Ok(Address::from_hex(s)?)
}

fn parse_net_addr(s: &str) -> Result<NetworkAddress, CodecError> {
    if s.is_empty() {
        return Ok(NetworkAddress::empty());
    }
    Ok(NetworkAddress::parse(s)?)
}

fn parse_addr_list(csv: &str) -> Result<Vec<Address>, CodecError> {
    if csv.is_empty() {
        return Ok(Vec::new());
    }
    csv.split(',').map(parse_addr).collect()
}

fn parse_entry_list(csv: &str) -> Result<Vec<NodeEntry>, CodecError> {
    if csv.is_empty() {
        return Ok(Vec::new());
    }
    csv.split(',')
        .map(|pair| {
            let (a, n) = pair.split_once('#').ok_or(CodecError::Malformed)?;
            Ok(NodeEntry {
                address: parse_addr(a)?,
                network_address: parse_net_addr(n)?,
            })
        })
        .collect()
}

fn fmt_entry_list(entries: &[NodeEntry]) -> String {
    entries
        .iter()
        .map(|e| format!("{}#{}", e.address, e.network_address))
        .collect::<Vec<_>>()
        .join(",")
}

fn fmt_addr_list(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Decode one already-sanitized frame (no trailing `\n`). `REQ` frames are
/// multi-line; every other message type is a single `|`-delimited line.
pub fn decode_frame(frame: &str) -> Result<WireMessage, CodecError> {
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CodecError::OversizedFrame);
    }
    let frame = frame.trim_end_matches(['\r', '\n']);
    if frame.is_empty() {
        return Err(CodecError::Empty);
    }

    let mut lines = frame.split('\n');
    let first = lines.next().unwrap();
    let (msg_type, rest) = match first.split_once('|') {
        Some((t, r)) => (t, Some(r)),
        None => (first, None),
    };

    match msg_type {
        "READY_REQUEST" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            let (a, n) = rest.split_once('|').ok_or(CodecError::Malformed)?;
            Ok(WireMessage::Ready {
                addr: parse_addr(a)?,
                net_addr: parse_net_addr(n)?,
            })
        }
        "REQ" => decode_req(lines),
        "NODES" => {
            let rest = rest.unwrap_or("");
            Ok(WireMessage::Nodes {
                entries: parse_entry_list(rest)?,
            })
        }
        "NODES_COUNT" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            let n: u32 = rest.parse().map_err(|_| CodecError::Malformed)?;
            Ok(WireMessage::NodesCount(n))
        }
        "NODE_OK" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            let (c, n) = rest.split_once('|').ok_or(CodecError::Malformed)?;
            Ok(WireMessage::NodeOk {
                count: c.parse().map_err(|_| CodecError::Malformed)?,
                nonce: n.parse().map_err(|_| CodecError::Malformed)?,
            })
        }
        "WHO_IS" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            Ok(WireMessage::WhoIs(parse_addr(rest)?))
        }
        "WHO_IS_RESPONSE" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            let (a, n) = rest.split_once('|').ok_or(CodecError::Malformed)?;
            Ok(WireMessage::WhoIsResponse {
                addr: parse_addr(a)?,
                net_addr: parse_net_addr(n)?,
            })
        }
        "CONSENSUS_STATUS" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            let mut parts = rest.splitn(4, '|');
            let status = parts.next().ok_or(CodecError::Malformed)?;
            let voters = parts.next().ok_or(CodecError::Malformed)?;
            let nodes = parts.next().ok_or(CodecError::Malformed)?;
            let nonce = parts.next().ok_or(CodecError::Malformed)?;
            Ok(WireMessage::ConsensusStatus {
                status: status.parse().map_err(|_| CodecError::Malformed)?,
                voters: parse_addr_list(voters)?,
                nodes: parse_addr_list(nodes)?,
                nonce: nonce.parse().map_err(|_| CodecError::Malformed)?,
            })
        }
        "BROADCAST_NONCE" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            let (nonce, nodes) = rest.split_once('|').ok_or(CodecError::Malformed)?;
            Ok(WireMessage::BroadcastNonce {
                nonce: nonce.parse().map_err(|_| CodecError::Malformed)?,
                nodes: parse_addr_list(nodes)?,
            })
        }
        "PING" => Ok(WireMessage::Ping),
        "KEEPALIVE" => Ok(WireMessage::KeepAlive),
        "BLOCK" => {
            let rest = rest.ok_or(CodecError::Malformed)?;
            Ok(WireMessage::Block(rest.to_string()))
        }
        _ => Err(CodecError::UnknownMessageType),
    }
}

fn decode_req<'a>(mut lines: impl Iterator<Item = &'a str>) -> Result<WireMessage, CodecError> {
    let a_line = lines.next().ok_or(CodecError::Malformed)?;
    let self_addr = parse_addr(a_line.strip_prefix("A|").ok_or(CodecError::Malformed)?)?;

    let na_line = lines.next().ok_or(CodecError::Malformed)?;
    let self_net = parse_net_addr(na_line.strip_prefix("NA|").ok_or(CodecError::Malformed)?)?;

    let n_line = lines.next().ok_or(CodecError::Malformed)?;
    if n_line != "N" {
        return Err(CodecError::Malformed);
    }

    let mut nodes = Vec::new();
    let mut nonce: Option<u64> = None;
    for line in lines {
        if let Some(rest) = line.strip_prefix("NONCE|") {
            nonce = Some(rest.parse().map_err(|_| CodecError::Malformed)?);
        } else if let Some(rest) = line.strip_prefix("E|") {
            let (a, n) = rest.split_once('|').ok_or(CodecError::Malformed)?;
            nodes.push(NodeEntry {
                address: parse_addr(a)?,
                network_address: parse_net_addr(n)?,
            });
        } else if !line.is_empty() {
            return Err(CodecError::Malformed);
        }
    }

    Ok(WireMessage::Req {
        self_addr,
        self_net,
        nodes,
        nonce: nonce.ok_or(CodecError::Malformed)?,
    })
}

/// Encode a message into its wire form, including the trailing newline.
pub fn encode_frame(msg: &WireMessage) -> String {
    match msg {
        WireMessage::Ready { addr, net_addr } => {
            format!("READY_REQUEST|{addr}|{net_addr}\n")
        }
        WireMessage::Req {
            self_addr,
            self_net,
            nodes,
            nonce,
        } => {
            let mut s = format!("REQ\nA|{self_addr}\nNA|{self_net}\nN\n");
            for e in nodes {
                s.push_str(&format!("E|{}|{}\n", e.address, e.network_address));
            }
            s.push_str(&format!("NONCE|{nonce}\n"));
            s
        }
        WireMessage::Nodes { entries } => {
            format!("NODES|{}\n", fmt_entry_list(entries))
        }
        WireMessage::NodesCount(n) => format!("NODES_COUNT|{n}\n"),
        WireMessage::NodeOk { count, nonce } => format!("NODE_OK|{count}|{nonce}\n"),
        WireMessage::WhoIs(addr) => format!("WHO_IS|{addr}\n"),
        WireMessage::WhoIsResponse { addr, net_addr } => {
            format!("WHO_IS_RESPONSE|{addr}|{net_addr}\n")
        }
        WireMessage::ConsensusStatus {
            status,
            voters,
            nodes,
            nonce,
        } => format!(
            "CONSENSUS_STATUS|{status}|{}|{}|{nonce}\n",
            fmt_addr_list(voters),
            fmt_addr_list(nodes)
        ),
        WireMessage::BroadcastNonce { nonce, nodes } => {
            format!("BROADCAST_NONCE|{nonce}|{}\n", fmt_addr_list(nodes))
        }
        WireMessage::Ping => "PING\n".to_string(),
        WireMessage::KeepAlive => "KEEPALIVE\n".to_string(),
        WireMessage::Block(json) => format!("BLOCK|{json}\n"),
    }
}

/// Split a raw, already-sanitized read buffer into individual frames per the
/// bootstrap client's reader rule: if the whole buffer parses as a `REQ`
/// snapshot, treat it as one frame; otherwise split on `\n`.
pub fn split_frames(buf: &str) -> Vec<String> {
    let trimmed = buf.trim_end_matches(['\r', '\n']);
    if trimmed.starts_with("REQ") {
        return vec![trimmed.to_string()];
    }
    trimmed
        .split('\n')
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect()
}
