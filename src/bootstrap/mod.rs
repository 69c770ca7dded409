#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Bootstrap mesh: the coordinator (C4, bootstrap node only) and the client
//! (C5, every non-bootstrap node).

pub mod client;
pub mod coordinator;
