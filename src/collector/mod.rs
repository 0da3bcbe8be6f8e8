//! Collector client: wire shapes, config loading, and utilization probes (§4.5, §6).

pub mod client;
pub mod config;
pub mod utilization;
pub mod wire;

pub use client::CollectorClient;
pub use config::{Config, ConfigBuilder};
pub use utilization::Utilization;
