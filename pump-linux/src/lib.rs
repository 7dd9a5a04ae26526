//! Linux host for the pump link: BLE transport, connection lifecycle, driver API and the
//! daemon's configuration and cursor persistence.

pub mod ble;
pub mod config;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod link_state;
pub mod manager;
pub mod transport;

#[cfg(test)]
mod fake;

pub use driver::PumpDriver;
pub use error::LinkError;
pub use manager::{ConnectionManager, HistoryConfig, LinkConfig};
pub use transport::{Transport, TransportError, TransportEvent};
