//! Pool manager tests: hotplug joins and departures, active-unit
//! selection and teardown, driven by an in-memory scanner and factory.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{SimBehavior, SimUnit};
use tokio::sync::Mutex;
use tokio::time::{sleep, Duration};
use voltage_cycler::{
    CyclerError, CyclerResult, Device, DeviceFactory, DevicePool, LogSink, PoolEvent, PortScanner,
    Settings, CHANNELS_PER_DEVICE,
};

#[derive(Clone, Default)]
struct SimScanner {
    ports: Arc<Mutex<Vec<String>>>,
}

impl SimScanner {
    async fn plug(&self, port: &str) {
        self.ports.lock().await.push(port.to_string());
    }

    async fn unplug(&self, port: &str) {
        self.ports.lock().await.retain(|p| p != port);
    }
}

#[async_trait]
impl PortScanner for SimScanner {
    async fn scan(&self) -> Vec<String> {
        self.ports.lock().await.clone()
    }
}

/// Connects a fresh simulator per port. Ports named "bad*" fail.
#[derive(Clone, Default)]
struct SimFactory {
    attempts: Arc<AtomicUsize>,
    units: Arc<Mutex<Vec<(String, SimUnit)>>>,
}

#[async_trait]
impl DeviceFactory for SimFactory {
    async fn connect(
        &self,
        port: &str,
        logger: LogSink,
        settings: Arc<Settings>,
    ) -> CyclerResult<Arc<Device>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if port.starts_with("bad") {
            return Err(CyclerError::ConnectionFailed {
                port: port.to_string(),
                reason: "refused".into(),
            });
        }
        let (sim, link) = SimUnit::spawn(SimBehavior::default());
        self.units.lock().await.push((port.to_string(), sim));
        Device::connect(link, port, logger, settings).await
    }
}

fn pool_with(scanner: SimScanner, factory: SimFactory) -> DevicePool {
    DevicePool::new(
        Box::new(scanner),
        Box::new(factory),
        LogSink::new(),
        Arc::new(Settings::default()),
    )
}

#[tokio::test(start_paused = true)]
async fn first_unit_joins_and_becomes_active() {
    let scanner = SimScanner::default();
    let pool = pool_with(scanner.clone(), SimFactory::default());
    let mut events = pool.take_events().unwrap();
    assert!(pool.take_events().is_none());

    scanner.plug("simA").await;
    assert_eq!(events.recv().await, Some(PoolEvent::Connected("simA".into())));
    assert_eq!(events.recv().await, Some(PoolEvent::SetActive("simA".into())));

    assert_eq!(pool.ports().await, vec!["simA".to_string()]);
    assert_eq!(pool.active().await.as_deref(), Some("simA"));
    let device = pool.active_device().await.unwrap();
    assert_eq!(device.port(), "simA");
    let channels = pool.channels("simA").await.unwrap();
    assert_eq!(channels.len(), CHANNELS_PER_DEVICE);
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn second_unit_joins_without_stealing_active() {
    let scanner = SimScanner::default();
    let pool = pool_with(scanner.clone(), SimFactory::default());
    let mut events = pool.take_events().unwrap();

    scanner.plug("simA").await;
    assert_eq!(events.recv().await, Some(PoolEvent::Connected("simA".into())));
    assert_eq!(events.recv().await, Some(PoolEvent::SetActive("simA".into())));

    scanner.plug("simB").await;
    assert_eq!(events.recv().await, Some(PoolEvent::Connected("simB".into())));
    assert_eq!(pool.active().await.as_deref(), Some("simA"));

    pool.set_active("simB").await.unwrap();
    assert_eq!(events.recv().await, Some(PoolEvent::SetActive("simB".into())));
    assert_eq!(pool.active_device().await.unwrap().port(), "simB");
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn vanished_unit_is_torn_down() {
    let scanner = SimScanner::default();
    let pool = pool_with(scanner.clone(), SimFactory::default());
    let mut events = pool.take_events().unwrap();

    scanner.plug("simA").await;
    assert_eq!(events.recv().await, Some(PoolEvent::Connected("simA".into())));
    assert_eq!(events.recv().await, Some(PoolEvent::SetActive("simA".into())));

    scanner.unplug("simA").await;
    assert_eq!(
        events.recv().await,
        Some(PoolEvent::Disconnected("simA".into()))
    );
    assert!(pool.ports().await.is_empty());
    // the active label still points at the gone port; resolving it reports
    // the missing unit
    let err = pool.active_device().await.unwrap_err();
    assert!(matches!(err, CyclerError::NoDeviceFound(_)));
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn failed_connect_is_retried_every_scan() {
    let scanner = SimScanner::default();
    let factory = SimFactory::default();
    let attempts = Arc::clone(&factory.attempts);
    let pool = pool_with(scanner.clone(), factory);

    scanner.plug("bad0").await;
    while attempts.load(Ordering::SeqCst) < 3 {
        sleep(Duration::from_millis(100)).await;
    }
    assert!(pool.ports().await.is_empty());
    assert!(pool.active().await.is_none());
    assert!(matches!(
        pool.active_device().await.unwrap_err(),
        CyclerError::NoActiveDevice
    ));
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn set_active_rejects_unknown_ports() {
    let pool = pool_with(SimScanner::default(), SimFactory::default());
    assert!(matches!(
        pool.set_active("nope").await.unwrap_err(),
        CyclerError::NoDeviceFound(_)
    ));
    pool.quit().await;
}

#[tokio::test(start_paused = true)]
async fn quit_disconnects_every_unit() {
    let scanner = SimScanner::default();
    let pool = pool_with(scanner.clone(), SimFactory::default());
    let mut events = pool.take_events().unwrap();

    scanner.plug("simA").await;
    assert_eq!(events.recv().await, Some(PoolEvent::Connected("simA".into())));
    assert_eq!(events.recv().await, Some(PoolEvent::SetActive("simA".into())));
    let device = pool.with_device("simA").await.unwrap();

    pool.quit().await;
    assert_eq!(
        events.recv().await,
        Some(PoolEvent::Disconnected("simA".into()))
    );
    assert!(device.is_link_closed());
}
