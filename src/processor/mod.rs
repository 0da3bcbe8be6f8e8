//! The Harvest Processor: connector handshake, per-endpoint delivery, and the
//! single-owner main loop that ties them together (§4.1).

pub mod connector;
pub mod delivery;
pub mod lifecycle_manager;

pub use connector::Connector;
pub use delivery::{DeliveryOutcome, DeliveryTask};
pub use lifecycle_manager::{DataMessage, DataSender, HarvestProcessor, Telemetry};
