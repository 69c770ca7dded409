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

//! Deterministic core types: node addresses, canonical encoding, configuration.

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Canonical serialization error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization")]
    Serialize,
    /// Deserialization failed.
    #[error("deserialization")]
    Deserialize,
    /// Decoded payload exceeded a size limit.
    #[error("size limit exceeded")]
    TooLarge,
}

/// Canonical bincode options (deterministic).
fn bincode_opts() -> impl Options {
    // Fixint encoding provides a stable integer representation.
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Encode with deterministic rules (fixed-width integers, no trailing bytes).
pub fn encode_canonical<T: Serialize>(v: &T) -> Result<Vec<u8>, CodecError> {
    bincode_opts().serialize(v).map_err(|_| CodecError::Serialize)
}

/// Decode with a hard size cap, defending against memory/CPU bombs via
/// oversized container lengths embedded in the payload.
pub fn decode_canonical_limited<T: DeserializeOwned>(
    bytes: &[u8],
    max: usize,
) -> Result<T, CodecError> {
    if bytes.len() > max {
        return Err(CodecError::TooLarge);
    }
    bincode_opts()
        .with_limit(max as u64)
        .deserialize(bytes)
        .map_err(|_| CodecError::Deserialize)
}

/// Current time in milliseconds since the UNIX epoch. Returns 0 if the clock
/// is set before the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Address validation/parsing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    /// Address is not 20 bytes / 40 hex chars.
    #[error("invalid address length")]
    Length,
    /// Address is not valid hex.
    #[error("invalid address hex")]
    Hex,
}

/// Canonical 20-byte opaque node identifier, hex-encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Construct from raw bytes.
    pub fn from_bytes(b: [u8; 20]) -> Self {
        Self(b)
    }

    /// Zero address (used as an invalid/absent sentinel; never a valid member).
    pub fn zero() -> Self {
        Self([0u8; 20])
    }

    /// Whether this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Canonical lowercase hex encoding (40 chars).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a canonical hex string (with or without a `0x` prefix).
    pub fn from_hex(s: &str) -> Result<Self, AddressError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|_| AddressError::Hex)?;
        if bytes.len() != 20 {
            return Err(AddressError::Length);
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = AddressError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Network address validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkAddressError {
    /// Missing or malformed `host:port`.
    #[error("malformed host:port")]
    Malformed,
    /// Port out of the `[1, 65535]` range.
    #[error("port out of range")]
    Port,
}

/// A validated `host:port` locating a node's listening socket. Accepts
/// dotted-quad IPv4 or bracketed IPv6, with a port in `1..=65535`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NetworkAddress(String);

impl NetworkAddress {
    /// Validate and construct from a `host:port` string.
    pub fn parse(s: &str) -> Result<Self, NetworkAddressError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(NetworkAddressError::Malformed);
        }
        // SocketAddr::from_str handles both dotted-quad and bracketed IPv6.
        let sa: SocketAddr = s.parse().map_err(|_| NetworkAddressError::Malformed)?;
        if sa.port() == 0 {
            return Err(NetworkAddressError::Port);
        }
        Ok(Self(s.to_string()))
    }

    /// The validated string, canonical form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty marker used by membership entries whose address is not yet known
    /// (see the WHO_IS resolution flow).
    pub fn empty() -> Self {
        Self(String::new())
    }

    /// Whether this is the empty marker.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 256-bit hash (block hash / gossip message id).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    /// SHA-256 of arbitrary bytes.
    pub fn digest(data: &[u8]) -> Self {
        let d = ring::digest::digest(&ring::digest::SHA256, data);
        let mut out = [0u8; 32];
        out.copy_from_slice(d.as_ref());
        Self(out)
    }

    /// Hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// Node configuration root, loaded from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity/data settings.
    pub node: NodeSettings,
    /// Bootstrap mesh wire-protocol settings.
    pub bootstrap: BootstrapSettings,
    /// Raft-like election engine settings.
    pub election: ElectionSettings,
    /// Gossip/pubsub settings.
    pub gossip: GossipSettings,
}

/// Node identity settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Human-readable name.
    pub name: String,
    /// Data directory (persistent identity keys).
    pub data_dir: String,
    /// This node's address (hex-encoded, 20 bytes).
    pub address_hex: String,
    /// This node's own listening `host:port`.
    pub listen_addr: String,
}

/// Bootstrap mesh settings (§4.4/§4.5/§5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BootstrapSettings {
    /// `host:port` of the bootstrap node. Matches `node.listen_addr` on the
    /// bootstrap node itself.
    pub bootstrap_addr: String,
    /// Maximum concurrent sessions held by the connection pool.
    #[serde(default = "defaults::max_connections")]
    pub max_connections: usize,
    /// Sessions idle longer than this are reaped by pool cleanup.
    #[serde(default = "defaults::peer_inactive_timeout_secs")]
    pub peer_inactive_timeout_secs: u64,
    /// Dial timeout.
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Steady-state read deadline on the bootstrap session.
    #[serde(default = "defaults::read_timeout_secs")]
    pub read_timeout_secs: u64,
    /// General write deadline.
    #[serde(default = "defaults::write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Write deadline for block transmission specifically.
    #[serde(default = "defaults::block_write_timeout_secs")]
    pub block_write_timeout_secs: u64,
    /// Keep-alive ping interval.
    #[serde(default = "defaults::keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,
    /// NODE_OK reporting interval.
    #[serde(default = "defaults::node_ok_interval_secs")]
    pub node_ok_interval_secs: u64,
    /// Reconnect backoff base.
    #[serde(default = "defaults::backoff_base_secs")]
    pub backoff_base_secs: u64,
    /// Reconnect backoff cap.
    #[serde(default = "defaults::backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Consecutive failures before resuming at the backoff cap.
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    /// Block-producer poll interval.
    #[serde(default = "defaults::block_poll_interval_secs")]
    pub block_poll_interval_secs: u64,
}

/// Election engine settings (§4.6/§5).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ElectionSettings {
    /// Tick interval.
    #[serde(default = "defaults::election_tick_ms")]
    pub tick_ms: u64,
    /// Heartbeat interval (leader).
    #[serde(default = "defaults::heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Baseline election timeout; actual timeout adds `[0, baseline)` jitter.
    #[serde(default = "defaults::election_timeout_ms")]
    pub election_timeout_ms: u64,
}

/// Gossip/pubsub settings (§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GossipSettings {
    /// Listen multiaddr for the pubsub swarm, e.g. `/ip4/0.0.0.0/tcp/4001`.
    pub listen_addr: String,
    /// Bootstrap peers to dial at startup (multiaddrs).
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
    /// Topic name prefix; actual topics are `{prefix}-blocks`, `{prefix}-txs`,
    /// `{prefix}-consensus`.
    #[serde(default = "defaults::topic_prefix")]
    pub topic_prefix: String,
    /// Sliding-window age after which a gossip message is dropped/forgotten.
    #[serde(default = "defaults::max_message_age_secs")]
    pub max_message_age_secs: u64,
    /// Deliver local publishes back to local subscribers.
    #[serde(default)]
    pub flood_publish: bool,
}

mod defaults {
    pub fn max_connections() -> usize {
        1024
    }
    pub fn peer_inactive_timeout_secs() -> u64 {
        120
    }
    pub fn connect_timeout_secs() -> u64 {
        10
    }
    pub fn read_timeout_secs() -> u64 {
        60
    }
    pub fn write_timeout_secs() -> u64 {
        5
    }
    pub fn block_write_timeout_secs() -> u64 {
        10
    }
    pub fn keepalive_interval_secs() -> u64 {
        30
    }
    pub fn node_ok_interval_secs() -> u64 {
        15
    }
    pub fn backoff_base_secs() -> u64 {
        3
    }
    pub fn backoff_cap_secs() -> u64 {
        60
    }
    pub fn max_retries() -> u32 {
        10
    }
    pub fn block_poll_interval_secs() -> u64 {
        5
    }
    pub fn election_tick_ms() -> u64 {
        50
    }
    pub fn heartbeat_interval_ms() -> u64 {
        1_000
    }
    pub fn election_timeout_ms() -> u64 {
        3_000
    }
    pub fn topic_prefix() -> String {
        "meshcore".to_string()
    }
    pub fn max_message_age_secs() -> u64 {
        300
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_hex_roundtrip() {
        let a = Address::from_bytes([7u8; 20]);
        let s = a.to_hex();
        assert_eq!(Address::from_hex(&s).unwrap(), a);
        assert_eq!(Address::from_hex(&format!("0x{s}")).unwrap(), a);
    }

    #[test]
    fn address_rejects_bad_length() {
        assert_eq!(Address::from_hex("abcd"), Err(AddressError::Length));
    }

    #[test]
    fn network_address_validates_port() {
        assert!(NetworkAddress::parse("10.0.0.2:31000").is_ok());
        assert_eq!(
            NetworkAddress::parse("10.0.0.2:0"),
            Err(NetworkAddressError::Port)
        );
        assert!(NetworkAddress::parse("not-an-address").is_err());
        assert!(NetworkAddress::parse("[::1]:9000").is_ok());
    }

    #[test]
    fn canonical_codec_roundtrip() {
        let v: Vec<u32> = vec![1, 2, 3];
        let bytes = encode_canonical(&v).unwrap();
        let back: Vec<u32> = decode_canonical_limited(&bytes, 65536).unwrap();
        assert_eq!(v, back);
    }

    #[test]
    fn canonical_codec_enforces_limit() {
        let v: Vec<u32> = vec![1, 2, 3];
        let bytes = encode_canonical(&v).unwrap();
        assert!(matches!(
            decode_canonical_limited::<Vec<u32>>(&bytes, 1),
            Err(CodecError::TooLarge)
        ));
    }
}
