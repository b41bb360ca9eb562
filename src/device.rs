//! Register-map-aware device façade.
//!
//! A `Device` wraps one transport and owns everything that is per-unit
//! rather than per-register: the connect-time probe, the calibration
//! snapshot, the software setpoint shadow, multi-register macros
//! (impedance, rollover-safe charge), the watchdog, and firmware
//! bootloading. Firmware-version differences are resolved once at connect
//! into `FirmwareCaps`; nothing else in the crate branches on the raw
//! version number.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::constants::{
    bootloader, cell, unit, CHANNELS_PER_DEVICE, COMMAND_ERROR, FIRMWARE_IMAGE_BASE,
    FIRMWARE_IMAGE_SIZE, IMPEDANCE_NOISE_FLOOR, IMPEDANCE_RESTORE_RETRIES, IMPEDANCE_SETTLE,
    LOCK_LOCKED, LOCK_UNLOCKED, MODE_IMPEDANCE, RELAY_DELAY, SETPOINT_MAX_RAW,
    SETTINGS_COMP_MASK, SET_HIGH_RES_CHARGE, VERIFY_RETRIES, WATCHDOG_RELOAD,
};
use crate::codec;
use crate::error::{CyclerError, CyclerResult};
use crate::frame::{self, Namespace, RegisterValue};
use crate::logging::LogSink;
use crate::settings::Settings;
use crate::transport::{CyclerLink, Transport};

/// Firmware capabilities, resolved once at connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct FirmwareCaps {
    /// WATCHDOG_TIMER register exists and must be fed.
    pub has_watchdog: bool,
    /// Firmware current-compensation loop is broken; run it in software.
    pub needs_sw_current_compensation: bool,
    /// Charge accumulator runs at ×1 scaling instead of the legacy ×6.
    pub hi_res_charge: bool,
}

impl FirmwareCaps {
    pub fn resolve(version: u16, settings_bits: u16) -> Self {
        FirmwareCaps {
            has_watchdog: version >= 4,
            needs_sw_current_compensation: version <= 3,
            hi_res_charge: settings_bits & SET_HIGH_RES_CHARGE != 0,
        }
    }
}

/// Per-unit calibration snapshot taken at connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalibrationState {
    /// Thermistor divider resistance per slot (TEMP_CALIB_R).
    pub r: [u16; CHANNELS_PER_DEVICE],
    /// Thermistor beta per slot (TEMP_CALIB_B).
    pub b: [u16; CHANNELS_PER_DEVICE],
    /// Software shadow of the current setpoint registers.
    pub setpoints: [u16; CHANNELS_PER_DEVICE],
}

#[derive(Debug, Clone, Copy, Default)]
struct UnitInfo {
    sn: u32,
    firmware_version: u16,
    caps: FirmwareCaps,
}

/// One connected cycler unit with four cell channels.
pub struct Device {
    port: String,
    transport: Arc<Transport>,
    info: RwLock<UnitInfo>,
    calibration: RwLock<CalibrationState>,
    in_bootloader: AtomicBool,
    /// Serializes multi-register macros across channels and external
    /// callers; single registers don't need it.
    critical_section: Mutex<()>,
    logger: LogSink,
    settings: RwLock<Arc<Settings>>,
}

impl Device {
    /// Open the link, probe the unit and snapshot its identity and
    /// calibration. A unit stuck in its bootloader still connects, but
    /// only bootloader-namespace registers are reachable until a firmware
    /// image is loaded.
    pub async fn connect(
        link: impl CyclerLink,
        port: impl Into<String>,
        logger: LogSink,
        settings: Arc<Settings>,
    ) -> CyclerResult<Arc<Device>> {
        let port = port.into();
        let transport = Transport::open(link, port.clone());
        let device = Arc::new(Device {
            port,
            transport,
            info: RwLock::new(UnitInfo::default()),
            calibration: RwLock::new(CalibrationState::default()),
            in_bootloader: AtomicBool::new(false),
            critical_section: Mutex::new(()),
            logger,
            settings: RwLock::new(settings),
        });

        let probe = device
            .transport
            .read(Namespace::Bootloader, bootloader::BL_ADDR)
            .await?;
        if probe.value() == Some(COMMAND_ERROR) {
            device.initialize_operational().await?;
        } else {
            device.in_bootloader.store(true, Ordering::SeqCst);
            info!(port = %device.port, "unit is in its bootloader");
        }
        Ok(device)
    }

    /// Post-probe setup: mask off the firmware compensation loop, resolve
    /// capabilities, snapshot identity and calibration.
    async fn initialize_operational(&self) -> CyclerResult<()> {
        let settings_bits = self
            .transport
            .read(Namespace::Unit, unit::SETTINGS)
            .await?
            .value()
            .unwrap_or(0);
        let masked = settings_bits & SETTINGS_COMP_MASK;
        self.transport
            .write(Namespace::Unit, unit::SETTINGS, i32::from(masked))
            .await?;

        let mut calibration = CalibrationState::default();
        for slot in 0..CHANNELS_PER_DEVICE {
            let ns = Namespace::cell(slot);
            calibration.r[slot] = self.transport.read(ns, cell::TEMP_CALIB_R).await?.raw;
            calibration.b[slot] = self.transport.read(ns, cell::TEMP_CALIB_B).await?.raw;
            calibration.setpoints[slot] =
                self.transport.read(ns, cell::CURRENT_SETPOINT).await?.raw;
        }
        *self.calibration.write().await = calibration;

        let sn_lo = self.transport.read(Namespace::Unit, unit::SERIAL_NUM).await?.raw;
        let sn_hi = self.transport.read(Namespace::Unit, unit::DEVICE_ID).await?.raw;
        let version = self
            .transport
            .read(Namespace::Unit, unit::FIRMWARE_VER)
            .await?
            .raw;
        let caps = FirmwareCaps::resolve(version, masked);
        *self.info.write().await = UnitInfo {
            sn: u32::from(sn_lo) | (u32::from(sn_hi) << 16),
            firmware_version: version,
            caps,
        };
        self.in_bootloader.store(false, Ordering::SeqCst);

        if caps.has_watchdog {
            self.transport
                .write(
                    Namespace::Unit,
                    unit::WATCHDOG_TIMER,
                    i32::from(WATCHDOG_RELOAD),
                )
                .await?;
        }
        let info = self.info.read().await;
        info!(
            port = %self.port,
            sn = info.sn,
            firmware = info.firmware_version,
            "unit connected"
        );
        Ok(())
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub async fn sn(&self) -> u32 {
        self.info.read().await.sn
    }

    pub async fn firmware_version(&self) -> u16 {
        self.info.read().await.firmware_version
    }

    pub async fn caps(&self) -> FirmwareCaps {
        self.info.read().await.caps
    }

    pub async fn calibration(&self) -> CalibrationState {
        *self.calibration.read().await
    }

    pub fn is_in_bootloader(&self) -> bool {
        self.in_bootloader.load(Ordering::SeqCst)
    }

    /// True once the underlying serial link is gone.
    pub fn is_link_closed(&self) -> bool {
        self.transport.is_closed()
    }

    pub fn logger(&self) -> &LogSink {
        &self.logger
    }

    pub async fn settings(&self) -> Arc<Settings> {
        Arc::clone(&*self.settings.read().await)
    }

    pub async fn set_settings(&self, settings: Arc<Settings>) {
        *self.settings.write().await = settings;
    }

    /// Serialize a multi-register sequence against this unit's other users.
    pub async fn critical_section(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.critical_section.lock().await
    }

    fn gate(&self, namespace: Namespace) -> CyclerResult<()> {
        if self.is_in_bootloader() && namespace != Namespace::Bootloader {
            return Err(CyclerError::InBootloader);
        }
        Ok(())
    }

    /// Read one register.
    pub async fn read(&self, namespace: Namespace, addr: u8) -> CyclerResult<RegisterValue> {
        self.gate(namespace)?;
        self.transport.read(namespace, addr).await
    }

    /// Write one register, applying the device-level policies: cell
    /// setpoint writes clamp to the accepted raw range and update the
    /// software shadow; unit SETTINGS writes keep the broken firmware
    /// compensation loop masked off.
    pub async fn write(
        &self,
        namespace: Namespace,
        addr: u8,
        value: i32,
    ) -> CyclerResult<RegisterValue> {
        self.gate(namespace)?;
        let mut value = value;
        if namespace.is_cell() && addr == cell::CURRENT_SETPOINT {
            value = value.clamp(0, i32::from(SETPOINT_MAX_RAW));
            if let Some(slot) = namespace.slot() {
                self.calibration.write().await.setpoints[slot] = value as u16;
            }
        }
        if namespace == Namespace::Unit && addr == unit::SETTINGS {
            value &= i32::from(SETTINGS_COMP_MASK);
        }
        self.transport.write(namespace, addr, value).await
    }

    /// Write and read back until the register holds `value`.
    ///
    /// Setpoint writes get the relay-timing treatment: the register is
    /// zeroed first and the real value follows after a short delay, so the
    /// output relay always sees a clean edge.
    pub async fn write_verify(
        &self,
        namespace: Namespace,
        addr: u8,
        value: i32,
    ) -> CyclerResult<()> {
        self.gate(namespace)?;
        let is_setpoint = namespace.is_cell() && addr == cell::CURRENT_SETPOINT;
        let expected = if is_setpoint {
            value.clamp(0, i32::from(SETPOINT_MAX_RAW)) as u16
        } else if namespace == Namespace::Unit && addr == unit::SETTINGS {
            frame::fold_write_value(value)? & SETTINGS_COMP_MASK
        } else {
            frame::fold_write_value(value)?
        };
        let mut read_back = 0u16;
        for _ in 0..VERIFY_RETRIES {
            if is_setpoint && expected != 0 {
                self.write(namespace, addr, 0).await?;
                sleep(RELAY_DELAY).await;
            }
            self.write(namespace, addr, value).await?;
            let echo = self.read(namespace, addr).await?;
            if echo.value() == Some(expected) {
                return Ok(());
            }
            read_back = echo.raw;
        }
        Err(CyclerError::VerifyFailed {
            namespace: namespace.code(),
            addr,
            wrote: expected,
            read_back,
        })
    }

    /// Set a channel's current setpoint in amps.
    pub async fn set_current(&self, slot: usize, amps: f64) -> CyclerResult<RegisterValue> {
        let raw = codec::encode_setpoint(amps);
        self.write(Namespace::cell(slot), cell::CURRENT_SETPOINT, i32::from(raw))
            .await
    }

    /// Software setpoint shadow for a slot, in raw register units.
    pub async fn setpoint_shadow(&self, slot: usize) -> u16 {
        self.calibration.read().await.setpoints[slot]
    }

    /// Write a raw setpoint nudge without moving the software shadow.
    /// Used by the software compensation loop, whose target stays the
    /// shadow value while the register walks toward it.
    pub async fn nudge_setpoint(&self, slot: usize, raw: u16) -> CyclerResult<()> {
        let shadow = self.setpoint_shadow(slot).await;
        self.write(
            Namespace::cell(slot),
            cell::CURRENT_SETPOINT,
            i32::from(raw),
        )
        .await?;
        self.calibration.write().await.setpoints[slot] = shadow;
        Ok(())
    }

    /// Measure a channel's AC impedance in ohms.
    ///
    /// Drives the channel into impedance mode, lets the sine settle,
    /// samples the current/voltage peak-peak registers under LOCK, then
    /// restores the prior mode, re-writing until the channel actually
    /// leaves impedance mode.
    pub async fn impedance(&self, slot: usize) -> CyclerResult<f64> {
        let _cs = self.critical_section.lock().await;
        self.impedance_unguarded(slot).await
    }

    /// Impedance measurement body for callers that already hold this
    /// unit's critical section; the mutex is not reentrant.
    pub(crate) async fn impedance_unguarded(&self, slot: usize) -> CyclerResult<f64> {
        let ns = Namespace::cell(slot);
        let saved_mode = self.read(ns, cell::MODE).await?.value();

        self.write(ns, cell::MODE, i32::from(MODE_IMPEDANCE)).await?;
        sleep(IMPEDANCE_SETTLE).await;

        self.write(Namespace::Unit, unit::LOCK, i32::from(LOCK_LOCKED))
            .await?;
        let i_pp = self.read(ns, cell::CURRENT_PP).await?.as_current();
        let v_pp = self.read(ns, cell::VOLTAGE_PP).await?.as_voltage();
        self.write(Namespace::Unit, unit::LOCK, i32::from(LOCK_UNLOCKED))
            .await?;

        let z = if i_pp.is_nan() || v_pp.is_nan() {
            f64::NAN
        } else if i_pp.abs() < IMPEDANCE_NOISE_FLOOR {
            // below the measurement noise floor there is no real signal
            0.0
        } else {
            v_pp / i_pp
        };

        if let Some(saved) = saved_mode {
            if saved != MODE_IMPEDANCE {
                for _ in 0..IMPEDANCE_RESTORE_RETRIES {
                    self.write(ns, cell::MODE, i32::from(saved)).await?;
                    let now = self.read(ns, cell::MODE).await?;
                    if now.value() != Some(MODE_IMPEDANCE) {
                        break;
                    }
                }
            }
        }
        Ok(z)
    }

    /// Read a channel's accumulated charge in coulombs, correcting for a
    /// rollover of the 16-bit low word between the two register reads.
    pub async fn charge(&self, slot: usize) -> CyclerResult<f64> {
        let ns = Namespace::cell(slot);
        self.write(Namespace::Unit, unit::LOCK, i32::from(LOCK_LOCKED))
            .await?;
        let high_before = self.read(ns, cell::CHARGEH).await?.raw;
        let low = self.read(ns, cell::CHARGEL).await?.raw;
        let high_after = self.read(ns, cell::CHARGEH).await?.raw;
        self.write(Namespace::Unit, unit::LOCK, i32::from(LOCK_UNLOCKED))
            .await?;

        // If the high word moved, the low word tells us which side of the
        // rollover it was sampled on.
        let high = if high_before == high_after {
            high_after
        } else if low >= 0x8000 {
            high_before
        } else {
            high_after
        };
        let raw = (u32::from(high) << 16) | u32::from(low);
        let hi_res = self.caps().await.hi_res_charge;
        Ok(codec::as_charge(raw, hi_res))
    }

    /// Zero a channel's charge accumulator.
    pub async fn zero_charge(&self, slot: usize) -> CyclerResult<()> {
        let ns = Namespace::cell(slot);
        self.write(ns, cell::CHARGEH, 0).await?;
        self.write(ns, cell::CHARGEL, 0).await?;
        Ok(())
    }

    /// Feed the hardware watchdog. No-op on firmware without one.
    pub async fn reset_watchdog(&self) -> CyclerResult<()> {
        if self.caps().await.has_watchdog {
            self.write(
                Namespace::Unit,
                unit::WATCHDOG_TIMER,
                i32::from(WATCHDOG_RELOAD),
            )
            .await?;
        }
        Ok(())
    }

    /// Supply rail voltage in volts.
    pub async fn vcc(&self) -> CyclerResult<f64> {
        Ok(self.read(Namespace::Unit, unit::VCC).await?.as_vcc())
    }

    /// Channel temperature in °C using the connect-time calibration.
    pub async fn temperature_c(&self, slot: usize) -> CyclerResult<f64> {
        let calibration = self.calibration().await;
        let raw = self
            .read(Namespace::cell(slot), cell::TEMPERATURE)
            .await?;
        Ok(raw.as_temperature_c(calibration.r[slot], calibration.b[slot]))
    }

    // ========================================================================
    // Firmware bootloading
    // ========================================================================

    /// Load a firmware image. The unit reboots into the new image on
    /// success; identity and capabilities are re-read.
    pub async fn firmware_bootload(&self, image: &[u8]) -> CyclerResult<()> {
        if image.len() != FIRMWARE_IMAGE_SIZE {
            return Err(CyclerError::BadFirmwareImage(image.len()));
        }
        if !self.is_in_bootloader() {
            info!(port = %self.port, "entering bootloader");
            self.write(Namespace::Unit, unit::BOOTLOAD, 0).await?;
            self.in_bootloader.store(true, Ordering::SeqCst);
            sleep(std::time::Duration::from_secs(2)).await;
        }
        for (offset, byte) in image.iter().enumerate() {
            let addr = FIRMWARE_IMAGE_BASE + offset as u16;
            loop {
                self.write(Namespace::Bootloader, bootloader::BL_ADDR, i32::from(addr))
                    .await?;
                self.write(Namespace::Bootloader, bootloader::BL_DATA, i32::from(*byte))
                    .await?;
                let echo = self.read(Namespace::Bootloader, bootloader::BL_DATA).await?;
                if echo.value() == Some(u16::from(*byte)) {
                    break;
                }
                warn!(port = %self.port, addr, "flash byte mismatch, rewriting");
            }
        }
        self.write(Namespace::Bootloader, bootloader::BL_BOOTLOAD, 0)
            .await?;
        sleep(std::time::Duration::from_secs(2)).await;
        let check = self.read(Namespace::Bootloader, bootloader::BL_DATA).await?;
        if check.value() == Some(COMMAND_ERROR) {
            self.initialize_operational().await?;
            Ok(())
        } else {
            Err(CyclerError::BootloadRebootFailed)
        }
    }

    // ========================================================================
    // Calibration recovery
    // ========================================================================

    /// Restore the unit-level voltage calibration to pass-through.
    pub async fn calibration_reset_voltage(&self) -> CyclerResult<()> {
        self.write(Namespace::Unit, unit::VOLT_CH_CALIB_OFF, 0).await?;
        self.write(Namespace::Unit, unit::VOLT_CH_CALIB_SCA, 0x4000).await?;
        self.write(Namespace::Unit, unit::VOLT_DC_CALIB_OFF, 0).await?;
        self.write(Namespace::Unit, unit::VOLT_DC_CALIB_SCA, 0x4000).await?;
        Ok(())
    }

    /// Restore a channel's current calibration to pass-through.
    pub async fn calibration_reset_current(&self, slot: usize) -> CyclerResult<()> {
        let ns = Namespace::cell(slot);
        self.write(ns, cell::CURRENT_CALIB_OFF, 0).await?;
        self.write(ns, cell::CURRENT_CALIB_SCA, 0x4000).await?;
        self.write(ns, cell::CURR_LOWV_OFF_SCA, 0x7FFF).await?;
        self.write(ns, cell::CURR_LOWV_SCA, 0x7FFF).await?;
        self.write(ns, cell::CURR_LOWV_OFF, 0x7FFF).await?;
        Ok(())
    }

    /// Restore a channel's thermistor calibration to the factory values
    /// and update the in-memory snapshot to match.
    pub async fn calibration_reset_temperature(&self, slot: usize) -> CyclerResult<()> {
        let ns = Namespace::cell(slot);
        self.write(ns, cell::TEMP_CALIB_R, 1500).await?;
        self.write(ns, cell::TEMP_CALIB_B, 3380).await?;
        let mut calibration = self.calibration.write().await;
        calibration.r[slot] = 1500;
        calibration.b[slot] = 3380;
        Ok(())
    }

    /// Restore a channel's AC (peak-peak) calibration to pass-through.
    pub async fn calibration_reset_frequency(&self, slot: usize) -> CyclerResult<()> {
        let ns = Namespace::cell(slot);
        self.write(ns, cell::CURRENT_CALIB_PP, 0x4000).await?;
        self.write(ns, cell::VOLTAGE_CALIB_PP, 0x4000).await?;
        self.write(ns, cell::CURR_CALIB_PP_OFF, 0).await?;
        self.write(ns, cell::VOLT_CALIB_PP_OFF, 0).await?;
        Ok(())
    }

    /// Stop the transport. Channel loops must be cancelled first.
    pub fn disconnect(&self) {
        self.transport.close();
        info!(port = %self.port, "unit disconnected");
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("port", &self.port)
            .field("in_bootloader", &self.is_in_bootloader())
            .finish()
    }
}
