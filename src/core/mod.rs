#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Core protocol primitives: types, wire codec, connection pool, membership.

pub mod codec;
pub mod membership;
pub mod pool;
pub mod types;
