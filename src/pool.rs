//! Hotplug device pool.
//!
//! A manager task rescans the candidate ports every half second: new ports
//! get a device connected and its four channel loops spawned, vanished
//! ports get torn down under their per-port lock. The first device to
//! appear becomes the active one. Scanning and connecting sit behind
//! traits so tests drive the pool with in-memory links.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::channel::Channel;
use crate::constants::{BAUD_RATE, CHANNELS_PER_DEVICE, POOL_SCAN_INTERVAL, USB_PID, USB_VID};
use crate::device::Device;
use crate::error::{CyclerError, CyclerResult};
use crate::logging::LogSink;
use crate::settings::Settings;

/// Lists the serial ports a cycler unit could be attached to.
#[async_trait]
pub trait PortScanner: Send + Sync {
    async fn scan(&self) -> Vec<String>;
}

/// Connects a device on a named port.
#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn connect(
        &self,
        port: &str,
        logger: LogSink,
        settings: Arc<Settings>,
    ) -> CyclerResult<Arc<Device>>;
}

/// Production scanner: USB serial ports matching the unit's VID/PID.
pub struct SerialPortScanner;

#[async_trait]
impl PortScanner for SerialPortScanner {
    async fn scan(&self) -> Vec<String> {
        match tokio_serial::available_ports() {
            Ok(ports) => ports
                .into_iter()
                .filter(|p| match &p.port_type {
                    tokio_serial::SerialPortType::UsbPort(usb) => {
                        usb.vid == USB_VID && usb.pid == USB_PID
                    }
                    _ => false,
                })
                .map(|p| p.port_name)
                .collect(),
            Err(err) => {
                warn!(%err, "serial port enumeration failed");
                Vec::new()
            }
        }
    }
}

/// Production factory: opens the port at the unit baud rate.
pub struct SerialDeviceFactory;

#[async_trait]
impl DeviceFactory for SerialDeviceFactory {
    async fn connect(
        &self,
        port: &str,
        logger: LogSink,
        settings: Arc<Settings>,
    ) -> CyclerResult<Arc<Device>> {
        let stream = tokio_serial::SerialStream::open(&tokio_serial::new(port, BAUD_RATE))
            .map_err(|err| CyclerError::ConnectionFailed {
                port: port.to_string(),
                reason: err.to_string(),
            })?;
        Device::connect(stream, port, logger, settings).await
    }
}

/// Pool lifecycle event, visible to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    Connected(String),
    Disconnected(String),
    SetActive(String),
}

impl std::fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolEvent::Connected(port) => write!(f, "unit on {port} connected"),
            PoolEvent::Disconnected(port) => write!(f, "unit on {port} disconnected"),
            PoolEvent::SetActive(port) => write!(f, "unit on {port} set as active"),
        }
    }
}

struct PoolEntry {
    device: Arc<Device>,
    channels: Arc<Vec<Channel>>,
    /// Held while the entry is handed out or torn down.
    lock: Arc<Mutex<()>>,
}

struct PoolInner {
    scanner: Box<dyn PortScanner>,
    factory: Box<dyn DeviceFactory>,
    logger: LogSink,
    settings: RwLock<Arc<Settings>>,
    entries: RwLock<HashMap<String, PoolEntry>>,
    active: RwLock<Option<String>>,
    events: mpsc::UnboundedSender<PoolEvent>,
    quit: CancellationToken,
    done: Notify,
}

/// Pool of connected cycler units, maintained by a background manager.
pub struct DevicePool {
    inner: Arc<PoolInner>,
    event_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<PoolEvent>>>,
}

impl DevicePool {
    /// Create the pool and spawn its manager task.
    pub fn new(
        scanner: Box<dyn PortScanner>,
        factory: Box<dyn DeviceFactory>,
        logger: LogSink,
        settings: Arc<Settings>,
    ) -> DevicePool {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            scanner,
            factory,
            logger,
            settings: RwLock::new(settings),
            entries: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
            events: event_tx,
            quit: CancellationToken::new(),
            done: Notify::new(),
        });
        tokio::spawn(manager_loop(Arc::clone(&inner)));
        DevicePool {
            inner,
            event_rx: std::sync::Mutex::new(Some(event_rx)),
        }
    }

    /// Take the lifecycle event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PoolEvent>> {
        self.event_rx.lock().ok().and_then(|mut rx| rx.take())
    }

    /// Ports with a connected unit.
    pub async fn ports(&self) -> Vec<String> {
        self.inner.entries.read().await.keys().cloned().collect()
    }

    /// Currently active port, if any.
    pub async fn active(&self) -> Option<String> {
        self.inner.active.read().await.clone()
    }

    /// Point the active label at a connected port.
    pub async fn set_active(&self, port: &str) -> CyclerResult<()> {
        if !self.inner.entries.read().await.contains_key(port) {
            return Err(CyclerError::NoDeviceFound(port.to_string()));
        }
        *self.inner.active.write().await = Some(port.to_string());
        let _ = self.inner.events.send(PoolEvent::SetActive(port.to_string()));
        Ok(())
    }

    /// The active unit. Reports whether no label is set or the label
    /// points at a unit that is no longer plugged in.
    pub async fn active_device(&self) -> CyclerResult<Arc<Device>> {
        let active = self.inner.active.read().await.clone();
        match active {
            None => Err(CyclerError::NoActiveDevice),
            Some(port) => self.with_device(&port).await,
        }
    }

    /// The unit on `port`, cloned out under the per-port lock.
    pub async fn with_device(&self, port: &str) -> CyclerResult<Arc<Device>> {
        let entries = self.inner.entries.read().await;
        let entry = entries
            .get(port)
            .ok_or_else(|| CyclerError::NoDeviceFound(port.to_string()))?;
        let _guard = entry.lock.lock().await;
        Ok(Arc::clone(&entry.device))
    }

    /// The channel handles of the unit on `port`.
    pub async fn channels(&self, port: &str) -> CyclerResult<Arc<Vec<Channel>>> {
        let entries = self.inner.entries.read().await;
        let entry = entries
            .get(port)
            .ok_or_else(|| CyclerError::NoDeviceFound(port.to_string()))?;
        Ok(Arc::clone(&entry.channels))
    }

    /// Replace the settings used for future connects and tests.
    pub async fn set_settings(&self, settings: Arc<Settings>) {
        *self.inner.settings.write().await = Arc::clone(&settings);
        for entry in self.inner.entries.read().await.values() {
            entry.device.set_settings(Arc::clone(&settings)).await;
        }
    }

    /// Stop the manager and disconnect every unit. Waits briefly for the
    /// teardown to finish.
    pub async fn quit(&self) {
        self.inner.quit.cancel();
        let _ = timeout(Duration::from_secs(1), self.inner.done.notified()).await;
    }
}

async fn manager_loop(inner: Arc<PoolInner>) {
    loop {
        tokio::select! {
            _ = inner.quit.cancelled() => break,
            _ = sleep(POOL_SCAN_INTERVAL) => {}
        }
        let ports = inner.scanner.scan().await;

        // connect newly appeared ports
        for port in &ports {
            let known = inner.entries.read().await.contains_key(port);
            if known {
                continue;
            }
            let settings = Arc::clone(&*inner.settings.read().await);
            match inner
                .factory
                .connect(port, inner.logger.clone(), settings)
                .await
            {
                Ok(device) => {
                    let channels = (0..CHANNELS_PER_DEVICE)
                        .map(|slot| Channel::spawn(Arc::clone(&device), slot))
                        .collect();
                    inner.entries.write().await.insert(
                        port.clone(),
                        PoolEntry {
                            device,
                            channels: Arc::new(channels),
                            lock: Arc::new(Mutex::new(())),
                        },
                    );
                    info!(port = %port, "unit joined the pool");
                    let _ = inner.events.send(PoolEvent::Connected(port.clone()));
                    let mut active = inner.active.write().await;
                    if active.is_none() {
                        *active = Some(port.clone());
                        let _ = inner.events.send(PoolEvent::SetActive(port.clone()));
                    }
                }
                Err(err) => {
                    // no blacklist: the port is retried on the next scan
                    warn!(port = %port, %err, "connect failed");
                }
            }
        }

        // tear down vanished ports
        let gone: Vec<String> = {
            let entries = inner.entries.read().await;
            entries
                .keys()
                .filter(|port| !ports.contains(port))
                .cloned()
                .collect()
        };
        for port in gone {
            remove_entry(&inner, &port).await;
        }
    }

    // quitting: disconnect everything
    let all: Vec<String> = inner.entries.read().await.keys().cloned().collect();
    for port in all {
        remove_entry(&inner, &port).await;
    }
    inner.done.notify_one();
}

async fn remove_entry(inner: &PoolInner, port: &str) {
    let entry = inner.entries.write().await.remove(port);
    if let Some(entry) = entry {
        let _guard = entry.lock.lock().await;
        for channel in entry.channels.iter() {
            channel.stop();
        }
        entry.device.disconnect();
        info!(port = %port, "unit left the pool");
        let _ = inner.events.send(PoolEvent::Disconnected(port.to_string()));
    }
}
