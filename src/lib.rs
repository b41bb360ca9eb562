//! # Voltage Cycler - Multi-Channel Battery Cycler Control Library
//!
//! An async control library for four-channel battery cycler/tester units
//! attached over USB serial. It owns the wire protocol, the per-channel
//! charge/discharge test state machines with their safety interlocks, and
//! a hotplug pool that tracks units as they come and go.
//!
//! ## Features
//!
//! - **Framed register transport**: background reader, response
//!   correlation, bounded retries and desync recovery
//! - **Register codec**: exact raw ↔ physical conversions for voltage,
//!   current, temperature, charge and impedance
//! - **Test state machines**: cycle and discharge tests with rests,
//!   trickle, pulse and constant-voltage phases
//! - **Safety interlocks**: verified limit registers, supply-rail
//!   monitoring and voltage-fault detection
//! - **Hotplug pool**: devices join and leave at runtime, with an active
//!   device selection
//! - **Telemetry logging**: non-blocking append-only CSV sink
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use voltage_cycler::{
//!     CyclerResult, DevicePool, LogSink, SerialDeviceFactory, SerialPortScanner, Settings,
//!     TestType,
//! };
//!
//! #[tokio::main]
//! async fn main() -> CyclerResult<()> {
//!     let settings = Arc::new(Settings::default());
//!     let pool = DevicePool::new(
//!         Box::new(SerialPortScanner),
//!         Box::new(SerialDeviceFactory),
//!         LogSink::new(),
//!         settings,
//!     );
//!
//!     // wait for a unit to appear, then cycle the cell in slot 0
//!     tokio::time::sleep(std::time::Duration::from_secs(1)).await;
//!     if let Some(port) = pool.active().await {
//!         let channels = pool.channels(&port).await?;
//!         channels[0].start_test("CELL_A", TestType::Cycle, None).await?;
//!     }
//!     Ok(())
//! }
//! ```

// ============================================================================
// Core modules
// ============================================================================

/// Unified error types and result handling
pub mod error;

/// Register map, wire markers and protocol constants
pub mod constants;

/// Raw register value to physical unit conversions
pub mod codec;

/// Wire frame types and parsing
pub mod frame;

/// Framed request/response transport with background reader
pub mod transport;

/// Register-map-aware device facade and macros
pub mod device;

/// Per-slot test control loops and state machines
pub mod channel;

/// Hotplug device pool
pub mod pool;

/// Test settings with safety-bounds validation
pub mod settings;

/// Async append-only telemetry log sink
pub mod logging;

// ============================================================================
// Re-exports for convenience
// ============================================================================

// === Async runtime (users can use voltage_cycler::tokio) ===
pub use tokio;

// === Error handling ===
pub use error::{CyclerError, CyclerResult};

// === Core types ===
pub use frame::{Namespace, RegisterValue, ResponseFrame, StreamFrame};
pub use transport::{CyclerLink, Transport};

// === Device and channels ===
pub use channel::{Channel, TestState, TestType};
pub use device::{CalibrationState, Device, FirmwareCaps};

// === Pool ===
pub use pool::{
    DeviceFactory, DevicePool, PoolEvent, PortScanner, SerialDeviceFactory, SerialPortScanner,
};

// === Configuration and logging ===
pub use logging::{LogSink, SummaryRow, TelemetryRow};
pub use settings::Settings;

// === Commonly needed constants ===
pub use constants::{BAUD_RATE, CHANNELS_PER_DEVICE, USB_PID, USB_VID};
