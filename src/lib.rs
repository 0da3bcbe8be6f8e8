//! # apm-agent-core
//!
//! In-process application performance monitoring agent core: a Transaction
//! state machine, harvest aggregators, a collector wire client, and the
//! harvest processor that ties them together on a fixed reporting cadence.
//!
//! This crate is the embeddable core of an APM agent. It does not bind to
//! any particular web framework or instrumentation point; a host application
//! starts [`domain::Transaction`]s, records segments and attributes on them,
//! and hands the crate's [`processor::HarvestProcessor`] a [`collector::Config`]
//! to drive the connect handshake and periodic harvest delivery.
//!
//! ## Layout
//!
//! - [`domain_types`] — validated newtypes (`RunId`, `MetricName`, `Priority`, ...)
//! - [`domain`] — `Transaction`, `AgentRun`, segments, rules, attributes, apdex
//! - [`harvest`] — the per-interval `Harvest` aggregate and its reservoirs
//! - [`collector`] — wire shapes, the HTTP client, config, utilization probe
//! - [`processor`] — the connector handshake and the harvest processor main loop
//! - [`performance`] — the runtime CPU/memory sampler
//! - [`time_provider`] — the injectable clock used for deterministic tests
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use apm_agent_core::collector::ConfigBuilder;
//! use apm_agent_core::domain::{Transaction, WebRequestInfo};
//! use apm_agent_core::processor::HarvestProcessor;
//! use apm_agent_core::time_provider::production_time_provider;
//!
//! # async fn run() -> Result<(), apm_agent_core::error::ConfigError> {
//! let config = ConfigBuilder::new()
//!     .license_key("0123456789012345678901234567890123456789")
//!     .app_name("My Application")
//!     .build()?;
//!
//! let processor = Arc::new(HarvestProcessor::new(config, production_time_provider(), std::process::id()));
//! let driver = Arc::clone(&processor);
//! tokio::spawn(async move { driver.run().await });
//!
//! let txn = Transaction::start("WebTransaction/Go/hello", Some(WebRequestInfo::default()), false, true, Vec::new());
//! txn.write_header(200);
//! # Ok(())
//! # }
//! ```

pub mod collector;
pub mod domain;
pub mod domain_types;
pub mod error;
pub mod harvest;
pub mod performance;
pub mod processor;
pub mod time_provider;

pub use domain::{AgentRun, Transaction};
pub use harvest::Harvest;
