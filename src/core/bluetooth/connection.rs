//! Connection state machine for the glove link
//! Consumes transport events and produces the effects the link manager must
//! carry out. Holds no transport objects itself, only the link handle.

use std::fmt;

use log::{debug, info, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::read_queue::ReadScheduler;
use crate::core::bluetooth::transport::TransportEvent;
use crate::core::bluetooth::types::{
    ConnectionState, DeviceAddress, DeviceDescriptor, DiscoveredService, GattStatus, LinkHandle,
};

/// Why a link attempt ended without reaching `Ready`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkFailure {
    #[error("scan window elapsed without finding the device")]
    ScanTimedOut,
    #[error("transport fault during service discovery: {0}")]
    TransportFault(GattStatus),
    #[error("expected service {missing} not found on the peripheral")]
    ProfileMismatch { missing: Uuid },
    #[error("transport rejected the connect request: {0}")]
    ConnectRejected(String),
}

/// Lifecycle phase of the single link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkPhase {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Ready,
    /// Behaves like `Idle`, but remembers why
    Failed(LinkFailure),
}

impl LinkPhase {
    /// Whether a new scan or connect may start from here
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle | Self::Failed(_))
    }
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Scanning => f.write_str("scanning"),
            Self::Connecting => f.write_str("connecting"),
            Self::ServiceDiscovery => f.write_str("discovering services"),
            Self::Ready => f.write_str("ready"),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Work the state machine asks the link manager to perform, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect {
        address: DeviceAddress,
        auto_reconnect: bool,
    },
    /// Must run on the next mailbox turn, not inside the current event
    DiscoverServices(LinkHandle),
    ReadCharacteristic {
        handle: LinkHandle,
        characteristic: Uuid,
    },
    /// Hand a successfully read value to the dispatcher
    Deliver {
        characteristic: Uuid,
        value: Vec<u8>,
    },
    Disconnect(LinkHandle),
    Close(LinkHandle),
}

pub struct ConnectionStateMachine {
    descriptor: DeviceDescriptor,
    phase: LinkPhase,
    link: Option<LinkHandle>,
    /// Links abandoned after a failure, waiting for their disconnect to complete
    retiring: Vec<LinkHandle>,
    scheduler: ReadScheduler,
    setup_finished: bool,
    auto_reconnect: bool,
}

impl ConnectionStateMachine {
    pub fn new(descriptor: DeviceDescriptor, auto_reconnect: bool) -> Self {
        Self {
            descriptor,
            phase: LinkPhase::Idle,
            link: None,
            retiring: Vec::new(),
            scheduler: ReadScheduler::new(),
            setup_finished: false,
            auto_reconnect,
        }
    }

    pub fn phase(&self) -> &LinkPhase {
        &self.phase
    }

    pub fn setup_finished(&self) -> bool {
        self.setup_finished
    }

    pub fn link(&self) -> Option<LinkHandle> {
        self.link
    }

    pub fn scheduler(&self) -> &ReadScheduler {
        &self.scheduler
    }

    /// Takes the links still waiting for their disconnect, e.g. to close them on shutdown
    pub fn take_retiring(&mut self) -> Vec<LinkHandle> {
        std::mem::take(&mut self.retiring)
    }

    /// Whether a discovery request for `handle` is still wanted
    pub fn awaiting_discovery(&self, handle: LinkHandle) -> bool {
        self.phase == LinkPhase::ServiceDiscovery && self.link == Some(handle)
    }

    pub fn scan_started(&mut self) -> bool {
        if !self.phase.is_idle() {
            return false;
        }
        self.phase = LinkPhase::Scanning;
        true
    }

    /// The scan ended without a match, either by timeout or by being toggled off
    pub fn scan_finished(&mut self, timed_out: bool) {
        if self.phase != LinkPhase::Scanning {
            return;
        }
        self.phase = if timed_out {
            LinkPhase::Failed(LinkFailure::ScanTimedOut)
        } else {
            LinkPhase::Idle
        };
    }

    /// `Idle --connect(device)--> Connecting`
    pub fn connect(&mut self, address: DeviceAddress) -> Vec<Effect> {
        if !self.phase.is_idle() && self.phase != LinkPhase::Scanning {
            warn!("Ignoring connect to {} while {}", address, self.phase);
            return Vec::new();
        }
        info!("Connecting to {}", address);
        self.phase = LinkPhase::Connecting;
        vec![Effect::Connect {
            address,
            auto_reconnect: self.auto_reconnect,
        }]
    }

    /// The transport accepted the connect request and handed back a link handle
    pub fn link_opened(&mut self, handle: LinkHandle) -> Vec<Effect> {
        if self.phase != LinkPhase::Connecting || self.link.is_some() {
            warn!("Unexpected link {} while {}, closing it", handle, self.phase);
            return vec![Effect::Close(handle)];
        }
        debug!("Link {} opened", handle);
        self.link = Some(handle);
        Vec::new()
    }

    /// The transport refused the connect request outright
    pub fn connect_rejected(&mut self, reason: String) {
        if self.phase != LinkPhase::Connecting {
            return;
        }
        self.reset();
        self.phase = LinkPhase::Failed(LinkFailure::ConnectRejected(reason));
    }

    pub fn handle(&mut self, event: TransportEvent) -> Vec<Effect> {
        let handle = event.handle();
        if self.link != Some(handle) {
            return self.on_stale_event(event);
        }

        match event {
            TransportEvent::ConnectionStateChanged { status, state, .. } => {
                self.on_connection_state_changed(handle, status, state)
            }
            TransportEvent::ServicesDiscovered {
                status, services, ..
            } => self.on_services_discovered(handle, status, services),
            TransportEvent::CharacteristicRead {
                characteristic,
                status,
                value,
                ..
            } => self.on_characteristic_read(handle, characteristic, status, value),
            TransportEvent::CharacteristicChanged { characteristic, .. } => {
                debug!("Characteristic {} changed", characteristic);
                Vec::new()
            }
        }
    }

    fn on_stale_event(&mut self, event: TransportEvent) -> Vec<Effect> {
        match event {
            TransportEvent::ConnectionStateChanged {
                handle,
                state: ConnectionState::Connected,
                ..
            } => {
                warn!("Link {} came up but is no longer wanted, closing it", handle);
                self.retiring.retain(|h| *h != handle);
                vec![Effect::Close(handle)]
            }
            TransportEvent::ConnectionStateChanged { handle, .. } if self.retiring.contains(&handle) => {
                debug!("Retired {} is down, closing it", handle);
                self.retiring.retain(|h| *h != handle);
                vec![Effect::Close(handle)]
            }
            other => {
                debug!("Dropping event for stale {}", other.handle());
                Vec::new()
            }
        }
    }

    fn on_connection_state_changed(
        &mut self,
        handle: LinkHandle,
        status: GattStatus,
        state: ConnectionState,
    ) -> Vec<Effect> {
        match (status.is_success(), state) {
            (true, ConnectionState::Connected) => {
                if self.phase != LinkPhase::Connecting {
                    debug!("Already connected on {} while {}", handle, self.phase);
                    return Vec::new();
                }
                info!("Connected to {}", self.descriptor.address);
                self.phase = LinkPhase::ServiceDiscovery;
                vec![Effect::DiscoverServices(handle)]
            }
            (true, ConnectionState::Disconnected) => {
                info!("Disconnected from {}", self.descriptor.address);
                self.on_disconnected(handle)
            }
            (false, _) => {
                warn!("Connection state change on {} failed: {}", handle, status);
                self.on_disconnected(handle)
            }
        }
    }

    /// `any --onDisconnected--> Idle`; a recorded failure stays visible
    fn on_disconnected(&mut self, handle: LinkHandle) -> Vec<Effect> {
        self.reset();
        if !matches!(self.phase, LinkPhase::Failed(_)) {
            self.phase = LinkPhase::Idle;
        }
        vec![Effect::Close(handle)]
    }

    fn on_services_discovered(
        &mut self,
        handle: LinkHandle,
        status: GattStatus,
        services: Vec<DiscoveredService>,
    ) -> Vec<Effect> {
        if self.phase != LinkPhase::ServiceDiscovery {
            debug!("Ignoring service discovery result while {}", self.phase);
            return Vec::new();
        }
        info!("Services discovered: {}", services.len());

        match status {
            GattStatus::Success => {}
            GattStatus::InternalError => {
                warn!("Service discovery failed with {}, disconnecting", status);
                return self.fail_and_disconnect(handle, LinkFailure::TransportFault(status));
            }
            GattStatus::Failure(_) => {
                warn!("Service discovery reported {}, validating what was found", status);
            }
        }

        let missing = self
            .descriptor
            .services
            .iter()
            .find(|expected| !services.iter().any(|s| s.uuid == **expected))
            .copied();
        if let Some(missing) = missing {
            for service in &services {
                info!("Available service: {}", service.uuid);
            }
            warn!("Service not found {}, disconnecting", missing);
            return self.fail_and_disconnect(handle, LinkFailure::ProfileMismatch { missing });
        }

        let cycle: Vec<Uuid> = self
            .descriptor
            .services
            .iter()
            .filter_map(|expected| services.iter().find(|s| s.uuid == *expected))
            .flat_map(|s| s.characteristics.iter().copied())
            .collect();
        self.setup_finished = true;
        self.phase = LinkPhase::Ready;
        info!("Link ready, polling {} characteristics", cycle.len());

        match self.scheduler.start(cycle) {
            Some(characteristic) => vec![Effect::ReadCharacteristic {
                handle,
                characteristic,
            }],
            None => {
                warn!("Expected services expose no characteristics, nothing to poll");
                Vec::new()
            }
        }
    }

    /// Gives the link up right away; its disconnect completion only closes it
    fn fail_and_disconnect(&mut self, handle: LinkHandle, failure: LinkFailure) -> Vec<Effect> {
        self.reset();
        self.retiring.push(handle);
        self.phase = LinkPhase::Failed(failure);
        vec![Effect::Disconnect(handle)]
    }

    fn on_characteristic_read(
        &mut self,
        handle: LinkHandle,
        characteristic: Uuid,
        status: GattStatus,
        value: Vec<u8>,
    ) -> Vec<Effect> {
        if self.phase != LinkPhase::Ready {
            debug!("Dropping read of {} while {}", characteristic, self.phase);
            return Vec::new();
        }

        let mut effects = Vec::with_capacity(2);
        if status.is_success() {
            effects.push(Effect::Deliver {
                characteristic,
                value,
            });
        } else {
            debug!("Read of {} failed: {}", characteristic, status);
        }
        if let Some(next) = self.scheduler.on_read_completed(characteristic) {
            effects.push(Effect::ReadCharacteristic {
                handle,
                characteristic: next,
            });
        }
        effects
    }

    fn reset(&mut self) {
        self.link = None;
        self.scheduler.stop();
        self.setup_finished = false;
    }
}
