//! Bluetooth scanner for the glove
//! Runs one bounded scan for the configured address and reports how it ended.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::manager::LinkMessage;
use crate::core::bluetooth::transport::{EventSender, ScanFilter, ScanSettings, Transport};
use crate::core::bluetooth::types::{Advertisement, DeviceDescriptor};

/// How a scan ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Found(Advertisement),
    TimedOut,
    Cancelled,
    /// The transport closed the advertisement stream
    Ended,
    Failed(String),
}

/// Finds the one target device by address within a bounded window.
pub struct BluetoothScanner<T: Transport> {
    transport: Arc<T>,
    settings: ScanSettings,
    cancel_token: Arc<CancellationToken>,
    scan_task_handle: Option<(u64, JoinHandle<()>)>,
    next_scan_id: u64,
}

impl<T: Transport> BluetoothScanner<T> {
    pub fn new(transport: Arc<T>, settings: ScanSettings) -> Self {
        Self {
            transport,
            settings,
            cancel_token: Arc::new(CancellationToken::new()),
            scan_task_handle: None,
            next_scan_id: 0,
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_task_handle.is_some()
    }

    /// Spawns the scan task; its outcome is posted to the link mailbox tagged with the returned id.
    ///
    /// Callers must not start a second scan while one runs; the link manager
    /// turns that request into [`stop_scan`](Self::stop_scan).
    pub fn start_scan(
        &mut self,
        descriptor: &DeviceDescriptor,
        timeout: Duration,
        mailbox: EventSender,
    ) -> u64 {
        self.next_scan_id += 1;
        let scan_id = self.next_scan_id;

        self.cancel_token = Arc::new(CancellationToken::new());
        let cancel_token_for_task = self.cancel_token.clone();
        let transport_for_task = self.transport.clone();
        let filter = ScanFilter {
            address: descriptor.address.clone(),
        };
        let settings = self.settings;

        let handle = tokio::spawn(async move {
            let outcome = Self::internal_scan_task(
                transport_for_task,
                filter,
                settings,
                timeout,
                cancel_token_for_task,
            )
            .await;
            if mailbox.post(LinkMessage::Scan { scan_id, outcome }).is_err() {
                debug!("Scan {} finished after the link manager stopped", scan_id);
            }
        });

        self.scan_task_handle = Some((scan_id, handle));
        info!(
            "Scan {} started for {} ({}s window)",
            scan_id,
            descriptor.address,
            timeout.as_secs_f32()
        );
        scan_id
    }

    async fn internal_scan_task(
        transport: Arc<T>,
        filter: ScanFilter,
        settings: ScanSettings,
        timeout: Duration,
        cancel_token: Arc<CancellationToken>,
    ) -> ScanOutcome {
        let mut scan_stream = match transport.scan(&filter, &settings).await {
            Ok(stream) => stream,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                return ScanOutcome::Failed(e.to_string());
            }
        };

        let outcome = tokio::select! {
            found = Self::first_match(&mut scan_stream, &filter) => match found {
                Some(advertisement) => ScanOutcome::Found(advertisement),
                None => {
                    info!("Bluetooth scan stream has ended.");
                    ScanOutcome::Ended
                }
            },
            _ = tokio::time::sleep(timeout) => ScanOutcome::TimedOut,
            _ = cancel_token.cancelled() => ScanOutcome::Cancelled,
        };
        drop(scan_stream);

        if let Err(e) = transport.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        outcome
    }

    async fn first_match(
        stream: &mut BoxStream<'static, Advertisement>,
        filter: &ScanFilter,
    ) -> Option<Advertisement> {
        while let Some(advertisement) = stream.next().await {
            debug!(
                "Found device - Address: {}, Name: {:?}, RSSI: {:?}",
                advertisement.address, advertisement.name, advertisement.rssi
            );
            if filter.matches(&advertisement) {
                return Some(advertisement);
            }
        }
        None
    }

    /// Cancels the running scan and waits for its task to wind down
    pub async fn stop_scan(&mut self) {
        info!("Stopping Bluetooth scan.");
        self.cancel_token.cancel();

        if let Some((scan_id, handle)) = self.scan_task_handle.take() {
            match handle.await {
                Ok(()) => info!("Scan {} finished after cancellation.", scan_id),
                Err(e) if e.is_cancelled() => info!("Scan task {} was cancelled.", scan_id),
                Err(e) => error!("Scan task {} finished with an unexpected join error: {:?}", scan_id, e),
            }
        } else {
            info!("No active scan task handle found to wait for.");
        }
    }

    /// Marks scan `scan_id` finished; false when the outcome belongs to an older scan
    pub fn scan_finished(&mut self, scan_id: u64) -> bool {
        match &self.scan_task_handle {
            Some((current, _)) if *current == scan_id => {
                self.scan_task_handle = None;
                true
            }
            _ => false,
        }
    }
}
