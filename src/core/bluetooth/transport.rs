//! Transport boundary
//! The platform BLE stack as seen by the link core: requests go out through
//! [`Transport`], completions come back as [`TransportEvent`]s on the link mailbox.

use anyhow::{Result, anyhow};
use futures_util::stream::BoxStream;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::manager::LinkMessage;
use crate::core::bluetooth::types::{
    Advertisement, ConnectionState, DeviceAddress, DiscoveredService, GattStatus, LinkHandle,
};

/// How aggressively the radio scans
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    LowPower,
    Balanced,
    LowLatency,
}

/// Which advertisements produce a callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackType {
    AllMatches,
    FirstMatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    Aggressive,
    Sticky,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub mode: ScanMode,
    pub callback_type: CallbackType,
    pub match_mode: MatchMode,
    /// Advertisements required before a match is reported
    pub num_matches: u8,
    /// Zero reports immediately instead of batching
    pub report_delay_ms: u64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mode: ScanMode::LowPower,
            callback_type: CallbackType::FirstMatch,
            match_mode: MatchMode::Aggressive,
            num_matches: 1,
            report_delay_ms: 0,
        }
    }
}

/// Scan filter; only the device address is matched, never service UUIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub address: DeviceAddress,
}

impl ScanFilter {
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        advertisement.address == self.address
    }
}

/// Asynchronous completions delivered by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionStateChanged {
        handle: LinkHandle,
        status: GattStatus,
        state: ConnectionState,
    },
    ServicesDiscovered {
        handle: LinkHandle,
        status: GattStatus,
        services: Vec<DiscoveredService>,
    },
    CharacteristicRead {
        handle: LinkHandle,
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    },
    CharacteristicChanged {
        handle: LinkHandle,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

impl TransportEvent {
    pub fn handle(&self) -> LinkHandle {
        match self {
            Self::ConnectionStateChanged { handle, .. }
            | Self::ServicesDiscovered { handle, .. }
            | Self::CharacteristicRead { handle, .. }
            | Self::CharacteristicChanged { handle, .. } => *handle,
        }
    }
}

/// Clonable sender a transport uses to post completions into the link mailbox
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<LinkMessage>,
}

impl EventSender {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LinkMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, event: TransportEvent) -> Result<()> {
        debug!("Transport event for {}: {:?}", event.handle(), event);
        self.tx
            .send(LinkMessage::Transport(event))
            .map_err(|_| anyhow!("Link mailbox is closed"))
    }

    pub(crate) fn post(&self, message: LinkMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| anyhow!("Link mailbox is closed"))
    }

    /// Resolves once the link mailbox has been dropped
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// The platform BLE stack.
///
/// Every request only has to be accepted before returning; the outcome is
/// reported later as a [`TransportEvent`]. The core never has more than one
/// characteristic read outstanding on a link.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Starts scanning and returns the stream of matching advertisements
    async fn scan(
        &self,
        filter: &ScanFilter,
        settings: &ScanSettings,
    ) -> Result<BoxStream<'static, Advertisement>>;

    async fn stop_scan(&self) -> Result<()>;

    /// Opens a link to `address`; connect/disconnect events follow for the returned handle
    async fn connect(&self, address: &DeviceAddress, auto_reconnect: bool) -> Result<LinkHandle>;

    async fn discover_services(&self, handle: LinkHandle) -> Result<()>;

    async fn read_characteristic(&self, handle: LinkHandle, characteristic: Uuid) -> Result<()>;

    async fn disconnect(&self, handle: LinkHandle) -> Result<()>;

    /// Releases every resource held for `handle`
    async fn close(&self, handle: LinkHandle) -> Result<()>;
}
