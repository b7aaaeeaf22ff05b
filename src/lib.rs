//! flowmon attributes live network traffic to owning processes, computes
//! per-connection throughput, and rolls samples into multi-granularity
//! time-series statistics per application and system-wide.

pub mod agent;
pub mod config;
pub mod export;
pub mod flow;
pub mod migrate;
pub mod proc;
pub mod publish;
pub mod rollup;
pub mod snapshot;
pub mod store;
pub mod trace;
