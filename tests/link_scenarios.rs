use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use glove_link_lib::core::bluetooth::{
    Advertisement, Catalog, CatalogEntry, ConnectionState, DeviceAddress, DeviceDescriptor,
    DiscoveredService, EventSender, GattStatus, GloveLink, LinkFailure, LinkHandle, LinkManager,
    LinkPhase, LinkSettings, LinkStatus, ScanFilter, ScanSettings, SensorChannel, Transport,
    TransportEvent, mailbox,
};
use uuid::Uuid;

const SERVICE: Uuid = Uuid::from_u128(0x5e);
const CHAR_A: Uuid = Uuid::from_u128(0xa);
const CHAR_B: Uuid = Uuid::from_u128(0xb);
const CHAR_C: Uuid = Uuid::from_u128(0xc);

const WAIT: Duration = Duration::from_secs(2);

fn glove_address() -> DeviceAddress {
    "94:B5:55:2C:C9:C2".parse().unwrap()
}

#[derive(Clone)]
enum ScanBehaviour {
    /// Advertises the glove straight away
    Advertise,
    /// Never sees anything
    Silent,
}

#[derive(Default)]
struct Recorded {
    reads: Vec<Uuid>,
    handles: Vec<LinkHandle>,
    disconnects: Vec<LinkHandle>,
    closes: Vec<LinkHandle>,
}

/// In-memory peripheral answering every request through the link mailbox.
struct FakeTransport {
    events: EventSender,
    scan: ScanBehaviour,
    services: Vec<DiscoveredService>,
    /// Reads of these characteristics are refused outright
    refused: HashSet<Uuid>,
    /// Reads of these characteristics complete with an error status
    failing: HashSet<Uuid>,
    read_latency: Duration,
    recorded: Arc<Mutex<Recorded>>,
    read_counts: Arc<Mutex<HashMap<Uuid, u32>>>,
    in_flight: Arc<AtomicBool>,
    overlapping_reads: Arc<AtomicUsize>,
    stop_scans: AtomicUsize,
    next_handle: AtomicU64,
}

impl FakeTransport {
    fn new(events: EventSender, scan: ScanBehaviour, services: Vec<DiscoveredService>) -> Self {
        Self {
            events,
            scan,
            services,
            refused: HashSet::new(),
            failing: HashSet::new(),
            read_latency: Duration::from_millis(2),
            recorded: Arc::new(Mutex::new(Recorded::default())),
            read_counts: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(AtomicBool::new(false)),
            overlapping_reads: Arc::new(AtomicUsize::new(0)),
            stop_scans: AtomicUsize::new(0),
            next_handle: AtomicU64::new(0),
        }
    }

    fn reads(&self) -> Vec<Uuid> {
        self.recorded.lock().unwrap().reads.clone()
    }

    fn disconnects(&self) -> Vec<LinkHandle> {
        self.recorded.lock().unwrap().disconnects.clone()
    }

    fn closes(&self) -> Vec<LinkHandle> {
        self.recorded.lock().unwrap().closes.clone()
    }

    fn connects(&self) -> usize {
        self.recorded.lock().unwrap().handles.len()
    }
}

fn value_prefix(characteristic: Uuid) -> &'static str {
    match characteristic {
        CHAR_A => "a",
        CHAR_B => "b",
        CHAR_C => "c",
        _ => "x",
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn scan(
        &self,
        _filter: &ScanFilter,
        _settings: &ScanSettings,
    ) -> Result<BoxStream<'static, Advertisement>> {
        Ok(match self.scan {
            ScanBehaviour::Advertise => {
                let stranger = Advertisement {
                    address: "00:11:22:33:44:55".parse().unwrap(),
                    name: None,
                    rssi: Some(-80),
                };
                let glove = Advertisement {
                    address: glove_address(),
                    name: Some("glove".to_string()),
                    rssi: Some(-50),
                };
                stream::iter(vec![stranger, glove])
                    .chain(stream::pending())
                    .boxed()
            }
            ScanBehaviour::Silent => stream::pending().boxed(),
        })
    }

    async fn stop_scan(&self) -> Result<()> {
        self.stop_scans.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn connect(&self, address: &DeviceAddress, _auto_reconnect: bool) -> Result<LinkHandle> {
        assert_eq!(*address, glove_address());
        let handle = LinkHandle(self.next_handle.fetch_add(1, Ordering::SeqCst) + 1);
        self.recorded.lock().unwrap().handles.push(handle);
        self.events.send(TransportEvent::ConnectionStateChanged {
            handle,
            status: GattStatus::Success,
            state: ConnectionState::Connected,
        })?;
        Ok(handle)
    }

    async fn discover_services(&self, handle: LinkHandle) -> Result<()> {
        self.events.send(TransportEvent::ServicesDiscovered {
            handle,
            status: GattStatus::Success,
            services: self.services.clone(),
        })
    }

    async fn read_characteristic(&self, handle: LinkHandle, characteristic: Uuid) -> Result<()> {
        self.recorded.lock().unwrap().reads.push(characteristic);
        if self.refused.contains(&characteristic) {
            return Err(anyhow!("read of {} refused", characteristic));
        }
        if self.in_flight.swap(true, Ordering::SeqCst) {
            self.overlapping_reads.fetch_add(1, Ordering::SeqCst);
        }

        let count = {
            let mut counts = self.read_counts.lock().unwrap();
            let count = counts.entry(characteristic).or_insert(0);
            *count += 1;
            *count
        };
        let (status, value) = if self.failing.contains(&characteristic) {
            (GattStatus::Failure(2), Vec::new())
        } else {
            let mut value = format!("{}{}", value_prefix(characteristic), count).into_bytes();
            value.push(0);
            (GattStatus::Success, value)
        };

        let events = self.events.clone();
        let in_flight = self.in_flight.clone();
        let latency = self.read_latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            in_flight.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::CharacteristicRead {
                handle,
                characteristic,
                status,
                value,
            });
        });
        Ok(())
    }

    async fn disconnect(&self, handle: LinkHandle) -> Result<()> {
        self.recorded.lock().unwrap().disconnects.push(handle);
        self.events.send(TransportEvent::ConnectionStateChanged {
            handle,
            status: GattStatus::Success,
            state: ConnectionState::Disconnected,
        })
    }

    async fn close(&self, handle: LinkHandle) -> Result<()> {
        self.recorded.lock().unwrap().closes.push(handle);
        Ok(())
    }
}

fn abc_catalog() -> Catalog {
    Catalog::new(vec![
        CatalogEntry::new(CHAR_A, SensorChannel::ThumbFlex),
        CatalogEntry::new(CHAR_B, SensorChannel::IndexFlex),
        CatalogEntry::new(CHAR_C, SensorChannel::MiddleFlex),
    ])
    .unwrap()
}

fn glove_service() -> Vec<DiscoveredService> {
    vec![DiscoveredService {
        uuid: SERVICE,
        characteristics: vec![CHAR_A, CHAR_B, CHAR_C],
    }]
}

fn settings(scan_timeout: Duration) -> LinkSettings {
    let mut settings = LinkSettings::new(DeviceDescriptor::new(glove_address(), vec![SERVICE]));
    settings.scan_timeout = scan_timeout;
    settings.read_failure_backoff = Duration::from_millis(5);
    settings
}

type Collected = Arc<Mutex<HashMap<SensorChannel, Vec<String>>>>;

struct Harness {
    link: GloveLink,
    transport: Arc<FakeTransport>,
    events: EventSender,
    collected: Collected,
}

fn launch(
    scan: ScanBehaviour,
    services: Vec<DiscoveredService>,
    scan_timeout: Duration,
    configure: impl FnOnce(&mut FakeTransport),
) -> Harness {
    let (sender, link_mailbox) = mailbox();
    let mut fake = FakeTransport::new(sender.clone(), scan, services);
    configure(&mut fake);
    let transport = Arc::new(fake);

    let catalog = abc_catalog();
    let mut manager = LinkManager::new(
        settings(scan_timeout),
        catalog.clone(),
        transport.clone(),
        sender.clone(),
        link_mailbox,
    );
    let collected: Collected = Arc::new(Mutex::new(HashMap::new()));
    for entry in catalog.entries() {
        let channel = entry.channel;
        let collected = collected.clone();
        manager
            .register_channel_sink(channel, move |value: String| {
                collected.lock().unwrap().entry(channel).or_default().push(value);
            })
            .unwrap();
    }

    Harness {
        link: manager.start(),
        transport,
        events: sender,
        collected,
    }
}

async fn wait_for_status(link: &GloveLink, predicate: impl FnMut(&LinkStatus) -> bool) -> LinkStatus {
    tokio::time::timeout(WAIT, link.wait_for_status(predicate))
        .await
        .expect("status not reached in time")
        .unwrap()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn polls_catalog_in_lifo_cycles_and_stops_on_disconnect() {
    let harness = launch(
        ScanBehaviour::Advertise,
        glove_service(),
        Duration::from_secs(5),
        |_| {},
    );
    assert!(!harness.link.is_ready());

    harness.link.start_scan_and_connect().unwrap();
    let status = wait_for_status(&harness.link, |s| s.setup_finished).await;
    assert_eq!(status.phase, LinkPhase::Ready);
    assert!(harness.link.is_ready());

    let transport = harness.transport.clone();
    eventually(|| transport.reads().len() >= 6).await;
    assert_eq!(
        harness.transport.reads()[..6],
        [CHAR_C, CHAR_B, CHAR_A, CHAR_C, CHAR_B, CHAR_A]
    );

    let collected = harness.collected.clone();
    eventually(|| {
        let collected = collected.lock().unwrap();
        SensorChannel::FLEX[..3]
            .iter()
            .all(|channel| collected.get(channel).is_some_and(|values| values.len() >= 2))
    })
    .await;
    {
        let collected = harness.collected.lock().unwrap();
        assert_eq!(collected[&SensorChannel::ThumbFlex][..2], ["a1", "a2"]);
        assert_eq!(collected[&SensorChannel::IndexFlex][..2], ["b1", "b2"]);
        assert_eq!(collected[&SensorChannel::MiddleFlex][..2], ["c1", "c2"]);
    }

    let handle = LinkHandle(1);
    harness
        .events
        .send(TransportEvent::ConnectionStateChanged {
            handle,
            status: GattStatus::Success,
            state: ConnectionState::Disconnected,
        })
        .unwrap();
    let status = wait_for_status(&harness.link, |s| s.phase == LinkPhase::Idle).await;
    assert!(!status.setup_finished);
    assert!(!harness.link.is_ready());

    let reads_after_disconnect = harness.transport.reads().len();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(harness.transport.reads().len(), reads_after_disconnect);
    assert_eq!(harness.transport.closes(), vec![handle]);
    assert_eq!(harness.transport.overlapping_reads.load(Ordering::SeqCst), 0);
    assert_eq!(harness.transport.connects(), 1);
}

#[tokio::test]
async fn scan_times_out_without_connecting() {
    let harness = launch(
        ScanBehaviour::Silent,
        glove_service(),
        Duration::from_millis(30),
        |_| {},
    );

    harness.link.start_scan_and_connect().unwrap();
    let status = wait_for_status(&harness.link, |s| matches!(s.phase, LinkPhase::Failed(_))).await;
    assert_eq!(status.phase, LinkPhase::Failed(LinkFailure::ScanTimedOut));
    assert!(!status.setup_finished);
    assert_eq!(harness.transport.connects(), 0);
    assert!(harness.transport.stop_scans.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn missing_service_disconnects_exactly_once() {
    let other_service = Uuid::from_u128(0xbad);
    let services = vec![DiscoveredService {
        uuid: other_service,
        characteristics: vec![CHAR_A],
    }];
    let harness = launch(
        ScanBehaviour::Advertise,
        services,
        Duration::from_secs(5),
        |_| {},
    );

    harness.link.start_scan_and_connect().unwrap();
    let status = wait_for_status(&harness.link, |s| matches!(s.phase, LinkPhase::Failed(_))).await;
    assert_eq!(
        status.phase,
        LinkPhase::Failed(LinkFailure::ProfileMismatch { missing: SERVICE })
    );

    let transport = harness.transport.clone();
    eventually(|| !transport.closes().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(harness.transport.disconnects(), vec![LinkHandle(1)]);
    assert_eq!(harness.transport.closes(), vec![LinkHandle(1)]);
    assert!(harness.transport.reads().is_empty());
    assert!(!harness.link.is_ready());
    // The failure stays visible after the link went down
    assert_eq!(
        harness.link.status().phase,
        LinkPhase::Failed(LinkFailure::ProfileMismatch { missing: SERVICE })
    );
}

#[tokio::test]
async fn second_request_toggles_running_scan_off() {
    let harness = launch(
        ScanBehaviour::Silent,
        glove_service(),
        Duration::from_secs(30),
        |_| {},
    );

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.phase == LinkPhase::Scanning).await;

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.phase == LinkPhase::Idle).await;
    assert!(harness.transport.stop_scans.load(Ordering::SeqCst) >= 1);

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.phase == LinkPhase::Scanning).await;
    assert_eq!(harness.transport.connects(), 0);
}

#[tokio::test]
async fn refused_read_does_not_stall_the_cycle() {
    let harness = launch(
        ScanBehaviour::Advertise,
        glove_service(),
        Duration::from_secs(5),
        |fake| {
            fake.refused.insert(CHAR_B);
        },
    );

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.setup_finished).await;

    let collected = harness.collected.clone();
    eventually(|| {
        let collected = collected.lock().unwrap();
        [SensorChannel::ThumbFlex, SensorChannel::MiddleFlex]
            .iter()
            .all(|channel| collected.get(channel).is_some_and(|values| values.len() >= 2))
    })
    .await;

    let reads = harness.transport.reads();
    assert_eq!(reads[..6], [CHAR_C, CHAR_B, CHAR_A, CHAR_C, CHAR_B, CHAR_A]);
    assert!(!harness.collected.lock().unwrap().contains_key(&SensorChannel::IndexFlex));
    assert_eq!(harness.transport.overlapping_reads.load(Ordering::SeqCst), 0);
    assert!(harness.link.is_ready());
}

#[tokio::test]
async fn failed_read_status_is_retried_next_cycle() {
    let harness = launch(
        ScanBehaviour::Advertise,
        glove_service(),
        Duration::from_secs(5),
        |fake| {
            fake.failing.insert(CHAR_A);
        },
    );

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.setup_finished).await;

    let transport = harness.transport.clone();
    eventually(|| transport.reads().len() >= 7).await;

    let reads = harness.transport.reads();
    assert_eq!(reads[..7], [CHAR_C, CHAR_B, CHAR_A, CHAR_C, CHAR_B, CHAR_A, CHAR_C]);
    {
        let collected = harness.collected.lock().unwrap();
        assert!(!collected.contains_key(&SensorChannel::ThumbFlex));
        assert_eq!(collected[&SensorChannel::MiddleFlex][..2], ["c1", "c2"]);
        assert_eq!(collected[&SensorChannel::IndexFlex][..2], ["b1", "b2"]);
    }
    assert_eq!(harness.transport.overlapping_reads.load(Ordering::SeqCst), 0);
    assert!(harness.link.is_ready());
}

#[tokio::test]
async fn scan_request_is_ignored_while_connected() {
    let harness = launch(
        ScanBehaviour::Advertise,
        glove_service(),
        Duration::from_secs(5),
        |_| {},
    );

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.setup_finished).await;

    harness.link.start_scan_and_connect().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.link.status().phase, LinkPhase::Ready);
    assert_eq!(harness.transport.connects(), 1);
}

#[tokio::test]
async fn disconnect_request_then_shutdown() {
    let harness = launch(
        ScanBehaviour::Advertise,
        glove_service(),
        Duration::from_secs(5),
        |_| {},
    );

    harness.link.start_scan_and_connect().unwrap();
    wait_for_status(&harness.link, |s| s.setup_finished).await;

    harness.link.disconnect().unwrap();
    let status = wait_for_status(&harness.link, |s| s.phase == LinkPhase::Idle).await;
    assert!(!status.setup_finished);
    assert_eq!(harness.transport.disconnects(), vec![LinkHandle(1)]);

    let transport = harness.transport.clone();
    eventually(|| transport.closes() == vec![LinkHandle(1)]).await;

    harness.link.shutdown().unwrap();
    tokio::time::timeout(WAIT, harness.link.stopped())
        .await
        .expect("link manager did not stop");
    assert!(harness.link.start_scan_and_connect().is_err());
}
