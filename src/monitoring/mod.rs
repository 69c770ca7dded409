#![forbid(unsafe_code)]
#![allow(missing_docs)]

//! Observability: Prometheus metrics export.

pub mod metrics;
