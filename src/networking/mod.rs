#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Networking support: persistent libp2p identity and peer reputation.
//! The gossip transport itself lives in [`crate::gossip`].

pub mod p2p_identity;
pub mod peer_score;
