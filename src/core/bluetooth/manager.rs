//! Link manager for the glove
//! This module provides the main interface for the link: it owns the state
//! machine, the dispatcher and the scanner inside one actor task and carries
//! out the effects the state machine asks for.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::core::bluetooth::catalog::{Catalog, SensorChannel};
use crate::core::bluetooth::connection::{ConnectionStateMachine, Effect, LinkPhase};
use crate::core::bluetooth::constants::{
    DEFAULT_READ_FAILURE_BACKOFF_MS, DEFAULT_SCAN_PERIOD_SECS, GATT_FAILURE,
};
use crate::core::bluetooth::dispatcher::{ChannelSink, DispatchError, ValueDispatcher};
use crate::core::bluetooth::scanner::{BluetoothScanner, ScanOutcome};
use crate::core::bluetooth::transport::{EventSender, ScanSettings, Transport, TransportEvent};
use crate::core::bluetooth::types::{ConnectionState, DeviceDescriptor, GattStatus, LinkHandle};

/// Everything that reaches the link actor goes through this one mailbox
#[derive(Debug)]
pub(crate) enum LinkMessage {
    Transport(TransportEvent),
    Scan { scan_id: u64, outcome: ScanOutcome },
    Command(LinkCommand),
    /// Deferred discovery request, run on the turn after the connect event
    Discover(LinkHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LinkCommand {
    StartScan,
    Disconnect,
    Shutdown,
}

/// Receiving half of the link mailbox
pub struct LinkMailbox {
    rx: mpsc::UnboundedReceiver<LinkMessage>,
}

/// Creates the mailbox. The sender goes to the transport, the receiver to [`LinkManager::new`].
pub fn mailbox() -> (EventSender, LinkMailbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender::new(tx), LinkMailbox { rx })
}

/// Externally observable link state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub phase: LinkPhase,
    pub setup_finished: bool,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            phase: LinkPhase::Idle,
            setup_finished: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub descriptor: DeviceDescriptor,
    pub scan_timeout: Duration,
    pub scan: ScanSettings,
    pub auto_reconnect: bool,
    /// Delay before a read the transport refused is fed back as a failure
    pub read_failure_backoff: Duration,
}

impl LinkSettings {
    pub fn new(descriptor: DeviceDescriptor) -> Self {
        Self {
            descriptor,
            scan_timeout: Duration::from_secs(DEFAULT_SCAN_PERIOD_SECS),
            scan: ScanSettings::default(),
            auto_reconnect: true,
            read_failure_backoff: Duration::from_millis(DEFAULT_READ_FAILURE_BACKOFF_MS),
        }
    }
}

/// Manages the single glove link
pub struct LinkManager<T: Transport> {
    transport: Arc<T>,
    settings: LinkSettings,
    machine: ConnectionStateMachine,
    dispatcher: ValueDispatcher,
    scanner: BluetoothScanner<T>,
    sender: EventSender,
    mailbox: LinkMailbox,
    status_tx: watch::Sender<LinkStatus>,
}

impl<T: Transport> LinkManager<T> {
    pub fn new(
        settings: LinkSettings,
        catalog: Catalog,
        transport: Arc<T>,
        sender: EventSender,
        mailbox: LinkMailbox,
    ) -> Self {
        let machine = ConnectionStateMachine::new(settings.descriptor.clone(), settings.auto_reconnect);
        let scanner = BluetoothScanner::new(transport.clone(), settings.scan);
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            transport,
            settings,
            machine,
            dispatcher: ValueDispatcher::new(catalog),
            scanner,
            sender,
            mailbox,
            status_tx,
        }
    }

    /// Registers the sink for one catalog channel; call before [`start`](Self::start)
    pub fn register_channel_sink(
        &mut self,
        channel: SensorChannel,
        sink: impl ChannelSink,
    ) -> Result<(), DispatchError> {
        self.dispatcher.register(channel, sink)
    }

    /// Spawns the actor task and returns the consumer handle
    pub fn start(self) -> GloveLink {
        let link = GloveLink {
            sender: self.sender.clone(),
            status: self.status_tx.subscribe(),
        };
        tokio::spawn(self.run());
        link
    }

    async fn run(mut self) {
        info!(
            "Link manager started for {} ({} catalog entries)",
            self.settings.descriptor.address,
            self.dispatcher.catalog().len()
        );
        while let Some(message) = self.mailbox.rx.recv().await {
            let keep_running = self.on_message(message).await;
            self.publish_status();
            if !keep_running {
                break;
            }
        }
        info!("Link manager stopped");
    }

    async fn on_message(&mut self, message: LinkMessage) -> bool {
        match message {
            LinkMessage::Command(LinkCommand::StartScan) => self.start_scan_and_connect().await,
            LinkMessage::Command(LinkCommand::Disconnect) => self.request_disconnect().await,
            LinkMessage::Command(LinkCommand::Shutdown) => {
                self.shutdown().await;
                return false;
            }
            LinkMessage::Scan { scan_id, outcome } => self.on_scan_outcome(scan_id, outcome).await,
            LinkMessage::Discover(handle) => self.discover_services(handle).await,
            LinkMessage::Transport(event) => {
                let effects = self.machine.handle(event);
                self.apply(effects).await;
            }
        }
        true
    }

    async fn start_scan_and_connect(&mut self) {
        if self.scanner.is_scanning() {
            info!("Scan already running, toggling it off");
            self.scanner.stop_scan().await;
            self.machine.scan_finished(false);
            return;
        }
        if !self.machine.scan_started() {
            warn!("Ignoring scan request while {}", self.machine.phase());
            return;
        }
        self.scanner.start_scan(
            &self.settings.descriptor,
            self.settings.scan_timeout,
            self.sender.clone(),
        );
    }

    async fn on_scan_outcome(&mut self, scan_id: u64, outcome: ScanOutcome) {
        if !self.scanner.scan_finished(scan_id) {
            debug!("Dropping outcome of superseded scan {}: {:?}", scan_id, outcome);
            return;
        }
        match outcome {
            ScanOutcome::Found(advertisement) => {
                info!(
                    "Found glove {} (RSSI {:?})",
                    advertisement.address, advertisement.rssi
                );
                let effects = self.machine.connect(advertisement.address);
                self.apply(effects).await;
            }
            ScanOutcome::TimedOut => {
                warn!(
                    "No advertisement from {} within {:?}",
                    self.settings.descriptor.address, self.settings.scan_timeout
                );
                self.machine.scan_finished(true);
            }
            ScanOutcome::Failed(reason) => {
                error!("Scan failed: {}", reason);
                self.machine.scan_finished(false);
            }
            ScanOutcome::Cancelled | ScanOutcome::Ended => self.machine.scan_finished(false),
        }
    }

    async fn discover_services(&mut self, handle: LinkHandle) {
        if !self.machine.awaiting_discovery(handle) {
            debug!("Skipping discovery for {}, no longer wanted", handle);
            return;
        }
        if let Err(e) = self.transport.discover_services(handle).await {
            warn!("Service discovery request on {} failed: {}", handle, e);
            let effects = self.machine.handle(TransportEvent::ServicesDiscovered {
                handle,
                status: GattStatus::InternalError,
                services: Vec::new(),
            });
            self.apply(effects).await;
        }
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Connect {
                    address,
                    auto_reconnect,
                } => match self.transport.connect(&address, auto_reconnect).await {
                    Ok(handle) => queue.extend(self.machine.link_opened(handle)),
                    Err(e) => {
                        error!("Failed to connect to {}: {}", address, e);
                        self.machine.connect_rejected(e.to_string());
                    }
                },
                Effect::DiscoverServices(handle) => {
                    if self.sender.post(LinkMessage::Discover(handle)).is_err() {
                        error!("Link mailbox closed before discovery on {}", handle);
                    }
                }
                Effect::ReadCharacteristic {
                    handle,
                    characteristic,
                } => {
                    if let Err(e) = self.transport.read_characteristic(handle, characteristic).await {
                        warn!("Read request for {} was not accepted: {}", characteristic, e);
                        self.report_failed_read(handle, characteristic);
                    }
                }
                Effect::Deliver {
                    characteristic,
                    value,
                } => {
                    self.dispatcher.dispatch(&characteristic, &value);
                }
                Effect::Disconnect(handle) => {
                    if let Err(e) = self.transport.disconnect(handle).await {
                        warn!("Disconnect of {} failed: {}, treating link as gone", handle, e);
                        self.report_disconnected(handle);
                    }
                }
                Effect::Close(handle) => {
                    if let Err(e) = self.transport.close(handle).await {
                        warn!("Failed to close {}: {}", handle, e);
                    }
                }
            }
        }
    }

    /// Feeds a refused read back as a failed completion so the cycle keeps moving
    fn report_failed_read(&self, handle: LinkHandle, characteristic: Uuid) {
        let sender = self.sender.clone();
        let backoff = self.settings.read_failure_backoff;
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = sender.send(TransportEvent::CharacteristicRead {
                handle,
                characteristic,
                status: GattStatus::Failure(GATT_FAILURE),
                value: Vec::new(),
            });
        });
    }

    fn report_disconnected(&self, handle: LinkHandle) {
        let event = TransportEvent::ConnectionStateChanged {
            handle,
            status: GattStatus::Success,
            state: ConnectionState::Disconnected,
        };
        if self.sender.send(event).is_err() {
            error!("Link mailbox closed while reporting {} as disconnected", handle);
        }
    }

    async fn request_disconnect(&mut self) {
        if self.scanner.is_scanning() {
            self.scanner.stop_scan().await;
            self.machine.scan_finished(false);
        }
        match self.machine.link() {
            Some(handle) => {
                info!("Disconnecting {}", handle);
                self.apply(vec![Effect::Disconnect(handle)]).await;
            }
            None => info!("No link to disconnect"),
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down link manager");
        if self.scanner.is_scanning() {
            self.scanner.stop_scan().await;
            self.machine.scan_finished(false);
        }
        if let Some(handle) = self.machine.link() {
            if let Err(e) = self.transport.disconnect(handle).await {
                warn!("Disconnect of {} during shutdown failed: {}", handle, e);
            }
            let effects = self.machine.handle(TransportEvent::ConnectionStateChanged {
                handle,
                status: GattStatus::Success,
                state: ConnectionState::Disconnected,
            });
            self.apply(effects).await;
        }
        for handle in self.machine.take_retiring() {
            if let Err(e) = self.transport.close(handle).await {
                warn!("Failed to close {}: {}", handle, e);
            }
        }
    }

    fn publish_status(&self) {
        let status = LinkStatus {
            phase: self.machine.phase().clone(),
            setup_finished: self.machine.setup_finished(),
        };
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!("Link status: {}", status.phase);
            *current = status;
            true
        });
    }
}

/// Clonable consumer handle for a running link
#[derive(Clone)]
pub struct GloveLink {
    sender: EventSender,
    status: watch::Receiver<LinkStatus>,
}

impl GloveLink {
    /// Scans for the glove and connects on the first match.
    /// Calling it while a scan runs stops that scan instead.
    pub fn start_scan_and_connect(&self) -> Result<()> {
        self.sender.post(LinkMessage::Command(LinkCommand::StartScan))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.sender.post(LinkMessage::Command(LinkCommand::Disconnect))
    }

    /// Tears the link down and stops the actor
    pub fn shutdown(&self) -> Result<()> {
        self.sender.post(LinkMessage::Command(LinkCommand::Shutdown))
    }

    /// True once the expected services were validated and polling has begun
    pub fn is_ready(&self) -> bool {
        self.status.borrow().setup_finished
    }

    pub fn status(&self) -> LinkStatus {
        self.status.borrow().clone()
    }

    pub async fn wait_for_status(
        &self,
        predicate: impl FnMut(&LinkStatus) -> bool,
    ) -> Result<LinkStatus> {
        let mut status = self.status.clone();
        let matched = status.wait_for(predicate).await?.clone();
        Ok(matched)
    }

    /// Resolves once the actor task has exited
    pub async fn stopped(&self) {
        self.sender.closed().await
    }
}
