//! Protocol and register-map constants for the cycler firmware.
//!
//! The register layout, mode codes and wire markers are a fixed external
//! contract with the microcontroller firmware and must match it bit for bit.

use std::time::Duration;

// ============================================================================
// Wire framing
// ============================================================================

/// Leading byte of a command and of a register response frame.
pub const RESPONSE_START: u8 = 0xAA;
/// Leading byte of an unsolicited telemetry stream frame.
pub const STREAM_START: u8 = 0xAF;
/// Bytes following the start marker in a response frame.
pub const RESPONSE_TRAILING: usize = 4;
/// Bytes following the start marker in a stream frame.
pub const STREAM_TRAILING: usize = 12;
/// Write bit OR'ed into the address byte of write commands and echoes.
pub const WRITE_BIT: u8 = 0x80;

/// USB vendor ID of the cycler units.
pub const USB_VID: u16 = 0x04D8;
/// USB product ID of the cycler units.
pub const USB_PID: u16 = 0x000A;
/// Serial link baud rate.
pub const BAUD_RATE: u32 = 38400;

// ============================================================================
// Retry / timing discipline
// ============================================================================

/// Polls of the response queue per send attempt (1 ms apart).
pub const RESPONSE_POLLS: u32 = 50;
/// Interval between response-queue polls.
pub const RESPONSE_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Whole-command retries before a read gives up.
pub const READ_RETRY_CEILING: u32 = 50;
/// Whole-command retries before a write gives up.
pub const WRITE_RETRY_CEILING: u32 = 20;
/// Write-then-readback cycles before `write_verify` reports failure.
pub const VERIFY_RETRIES: u32 = 10;
/// Time the reader waits for the trailing bytes of a frame before
/// discarding the partial frame and re-scanning for a start marker.
pub const FRAME_COLLECT_TIMEOUT: Duration = Duration::from_millis(100);
/// Pad bytes written after the retry ceiling to push the firmware command
/// parser past any partially transmitted command.
pub const RESYNC_PAD: [u8; 5] = [0x00; 5];

/// Settle time between entering impedance mode and sampling the peaks.
pub const IMPEDANCE_SETTLE: Duration = Duration::from_secs(2);
/// Attempts to restore the prior mode after an impedance measurement.
pub const IMPEDANCE_RESTORE_RETRIES: u32 = 10;
/// Relay-timing delay between the pre-zeroed setpoint write and the real one.
pub const RELAY_DELAY: Duration = Duration::from_millis(10);
/// Enforced floor for the channel reporting period.
pub const MIN_REPORTING_PERIOD: Duration = Duration::from_millis(500);
/// Pool manager scan cadence.
pub const POOL_SCAN_INTERVAL: Duration = Duration::from_millis(500);
/// Backoff after a recoverable channel-tick error.
pub const TICK_ERROR_BACKOFF: Duration = Duration::from_secs(2);

// ============================================================================
// Safety interlocks
// ============================================================================

/// VCC below this is survivable but suspicious; logged as a warning.
pub const VCC_SOFT_FLOOR: f64 = 4.25;
/// Two consecutive VCC samples below this abort the test.
pub const VCC_HARD_FLOOR: f64 = 4.1;
/// Unexpected voltage drop treated as a measurement fault (volts).
pub const VOLTAGE_FAULT_DELTA: f64 = 0.2;
/// Consecutive faulty samples before the voltage-fault abort fires.
pub const VOLTAGE_FAULT_TICKS: u32 = 5;
/// Current considered "stable" for the voltage-fault heuristic (amps).
pub const CURRENT_STABLE_BAND: f64 = 0.05;
/// Peak current below this reads as zero impedance instead of a bogus
/// divide-by-noise estimate (amps).
pub const IMPEDANCE_NOISE_FLOOR: f64 = 0.001;

// ============================================================================
// Namespaces
// ============================================================================

/// Register namespace codes.
pub mod ns {
    pub const CELL0: u8 = 0x00;
    pub const CELL1: u8 = 0x01;
    pub const CELL2: u8 = 0x02;
    pub const CELL3: u8 = 0x03;
    pub const UNIT: u8 = 0x04;
    pub const BOOTLOADER: u8 = 0x05;
    pub const COMMS: u8 = 0xFF;
}

// ============================================================================
// Cell register map (namespaces 0..=3)
// ============================================================================

pub mod cell {
    pub const MODE: u8 = 0x00;
    pub const ERROR: u8 = 0x01;
    pub const STATUS: u8 = 0x02;
    pub const CURRENT_SETPOINT: u8 = 0x03;
    pub const REPORT_INTERVAL: u8 = 0x04;
    pub const TEMPERATURE: u8 = 0x05;
    pub const CURRENT: u8 = 0x06;
    pub const VOLTAGE: u8 = 0x07;
    pub const CHARGEL: u8 = 0x08;
    pub const CHARGEH: u8 = 0x09;
    pub const VOLTAGE_LIMIT_CHG: u8 = 0x0A;
    pub const VOLTAGE_LIMIT_DCHG: u8 = 0x0B;
    pub const CURRENT_LIMIT_CHG: u8 = 0x0C;
    pub const CURRENT_LIMIT_DCHG: u8 = 0x0D;
    pub const TEMP_LIMIT_CHG: u8 = 0x0E;
    pub const TEMP_LIMIT_DCHG: u8 = 0x0F;
    pub const DUTY: u8 = 0x10;
    pub const COMPENSATION: u8 = 0x11;
    pub const CURRENT_PP: u8 = 0x12;
    pub const VOLTAGE_PP: u8 = 0x13;
    pub const CURRENT_CALIB_OFF: u8 = 0x14;
    pub const CURRENT_CALIB_SCA: u8 = 0x15;
    pub const TEMP_CALIB_R: u8 = 0x16;
    pub const TEMP_CALIB_B: u8 = 0x17;
    pub const CURRENT_CALIB_PP: u8 = 0x18;
    pub const VOLTAGE_CALIB_PP: u8 = 0x19;
    pub const CURR_CALIB_PP_OFF: u8 = 0x1A;
    pub const VOLT_CALIB_PP_OFF: u8 = 0x1B;
    pub const CURR_LOWV_SCA: u8 = 0x1C;
    pub const CURR_LOWV_OFF: u8 = 0x1D;
    pub const CURR_LOWV_OFF_SCA: u8 = 0x1E;
}

// ============================================================================
// Unit register map (namespace 4)
// ============================================================================

pub mod unit {
    pub const SERIAL_NUM: u8 = 0x00;
    pub const DEVICE_ID: u8 = 0x01;
    pub const FIRMWARE_VER: u8 = 0x02;
    pub const VCC: u8 = 0x03;
    pub const SINE_FREQ: u8 = 0x04;
    pub const SYSTEM_TIMER: u8 = 0x05;
    pub const SETTINGS: u8 = 0x06;
    pub const SINE_OFFSET: u8 = 0x07;
    pub const SINE_MAGDIV: u8 = 0x08;
    pub const LED_MESSAGE: u8 = 0x09;
    pub const BOOTLOAD: u8 = 0x0A;
    pub const VOLT_CH_CALIB_OFF: u8 = 0x0B;
    pub const VOLT_CH_CALIB_SCA: u8 = 0x0C;
    pub const VOLT_DC_CALIB_OFF: u8 = 0x0D;
    pub const VOLT_DC_CALIB_SCA: u8 = 0x0E;
    pub const LOCK: u8 = 0x0F;
    pub const ZERO_AMP_THRESH: u8 = 0x10;
    /// Present on firmware with watchdog support only.
    pub const WATCHDOG_TIMER: u8 = 0x11;
}

// ============================================================================
// Bootloader register map (namespace 5)
// ============================================================================

pub mod bootloader {
    pub const BL_BOOTLOAD: u8 = 0x00;
    pub const BL_ADDR: u8 = 0x01;
    pub const BL_DATA: u8 = 0x02;
}

// ============================================================================
// Comms register map (namespace 0xFF)
// ============================================================================

pub mod comms {
    pub const LED0: u8 = 0x00;
    pub const LED1: u8 = 0x01;
    pub const LED2: u8 = 0x02;
    pub const LED3: u8 = 0x03;
    pub const PSU: u8 = 0x04;
    pub const PSU_VOLTAGE: u8 = 0x05;
}

// ============================================================================
// Register codes
// ============================================================================

pub const MODE_NO_CELL: u16 = 0x0000;
pub const MODE_BACKWARDS: u16 = 0x0001;
pub const MODE_IDLE: u16 = 0x0002;
pub const MODE_CHARGE: u16 = 0x0003;
pub const MODE_DISCHARGE: u16 = 0x0004;
pub const MODE_IMPEDANCE: u16 = 0x0005;
pub const MODE_STOPPED: u16 = 0x0006;

pub const ERR_VOLTAGE_LIMIT_CHG: u16 = 0x0001;
pub const ERR_VOLTAGE_LIMIT_DCHG: u16 = 0x0002;
pub const ERR_CURRENT_LIMIT_CHG: u16 = 0x0004;
pub const ERR_CURRENT_LIMIT_DCHG: u16 = 0x0008;
pub const ERR_TEMP_LIMIT_CHG: u16 = 0x0010;
pub const ERR_TEMP_LIMIT_DCHG: u16 = 0x0020;

pub const STAT_VOLTAGE_LIMIT_CHG: u16 = 0x0001;
pub const STAT_VOLTAGE_LIMIT_DCHG: u16 = 0x0002;
pub const STAT_CURRENT_LIMIT_CHG: u16 = 0x0004;
pub const STAT_CURRENT_LIMIT_DCHG: u16 = 0x0008;
pub const STAT_TEMP_LIMIT_CHG: u16 = 0x0010;
pub const STAT_TEMP_LIMIT_DCHG: u16 = 0x0020;
pub const STAT_BACKWARDS: u16 = 0x0040;
pub const STAT_NO_CELL: u16 = 0x0080;

/// Unit SETTINGS register bits. The two low bits enable the firmware
/// current-compensation loop, which the host keeps masked off because the
/// loop is buggy on old firmware (compensation runs in software instead).
pub const SET_TRIM_OUTPUT: u16 = 0x0001;
pub const SET_VCC_COMPENSATION: u16 = 0x0002;
/// Charge accumulator high-resolution mode (×1 scaling instead of ×6).
pub const SET_HIGH_RES_CHARGE: u16 = 0x0004;
pub const SET_DEBUG: u16 = 0x8000;
/// Mask clearing the firmware current-compensation enables.
pub const SETTINGS_COMP_MASK: u16 = !0x0003;

pub const LOCK_UNLOCKED: u16 = 0x0000;
pub const LOCK_LOCKED: u16 = 0x0001;

/// Value the bootloader namespace echoes once application firmware is
/// running (also the post-reboot "command error" sentinel).
pub const COMMAND_ERROR: u16 = 257;

// ============================================================================
// Setpoint / firmware limits
// ============================================================================

/// Maximum raw value the CURRENT_SETPOINT register accepts.
pub const SETPOINT_MAX_RAW: u16 = 575;
/// Software current-compensation dead band (amps).
pub const COMPENSATION_DEAD_BAND: f64 = 0.01;
/// Measured current above this forces the compensation loop to back off.
pub const COMPENSATION_SATURATION: f64 = 4.02;
/// Shadow setpoint above this pins the register at `SETPOINT_MAX_RAW`.
pub const COMPENSATION_PIN_THRESHOLD: f64 = 4.5;

/// Reload value written to WATCHDOG_TIMER each control tick.
pub const WATCHDOG_RELOAD: u16 = 0xFFFF;

/// Required firmware image size in bytes.
pub const FIRMWARE_IMAGE_SIZE: usize = 15360;
/// Flash address the firmware image is written from.
pub const FIRMWARE_IMAGE_BASE: u16 = 0x0400;

/// Channels per physical unit.
pub const CHANNELS_PER_DEVICE: usize = 4;
