//! # blit-sim
//!
//! Drives a `blit-core` window scheduler with a synthetic damage
//! workload over a simulated link, then reports what the pipeline
//! did with it. Useful for eyeballing batching, congestion response
//! and refresh behaviour without a real display or client.

pub mod config;
pub mod workload;
