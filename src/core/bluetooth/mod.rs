//! Bluetooth link to the sensor glove
//! This module handles all bluetooth operations including scanning,
//! connecting, discovering the glove service and polling its characteristics.

mod bluest_transport;
mod catalog;
mod connection;
mod constants;
mod dispatcher;
mod manager;
mod read_queue;
mod scanner;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use catalog::{Catalog, CatalogEntry, CatalogError, SensorChannel};
pub use connection::{ConnectionStateMachine, Effect, LinkFailure, LinkPhase};
pub use constants::*; // Re-export all constants
pub use dispatcher::{
    ChannelSink, DispatchError, Dispatched, SensorReading, ValueDispatcher, decode_text,
    reading_sink,
};
pub use manager::{GloveLink, LinkMailbox, LinkManager, LinkSettings, LinkStatus, mailbox};
pub use read_queue::{ReadQueue, ReadScheduler};
pub use scanner::{BluetoothScanner, ScanOutcome};
pub use transport::{
    CallbackType, EventSender, MatchMode, ScanFilter, ScanMode, ScanSettings, Transport,
    TransportEvent,
};
pub use types::{
    AddressError, Advertisement, ConnectionState, DeviceAddress, DeviceDescriptor,
    DiscoveredService, GattStatus, LinkHandle,
};
