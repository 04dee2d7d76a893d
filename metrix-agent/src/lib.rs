//! Host metrics agent: samples on one cadence, reports on another.

#![forbid(unsafe_code)]

pub mod config;
pub mod handoff;
pub mod sampler;
pub mod scheduler;
pub mod sender;
pub mod transport;
