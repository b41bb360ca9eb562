//! Register value codec: raw 16-bit register content ↔ physical units.
//!
//! All conversions are pure functions over fixed-point formats with a full
//! scale of 2^15. Domain errors (zero divisors, non-positive logarithm
//! arguments, invalid samples) yield `f64::NAN` instead of panicking —
//! callers run in long-lived polling loops that must survive a bad sample.

use crate::constants::SETPOINT_MAX_RAW;

const FULL_SCALE: f64 = 32768.0;
/// Voltage ADC full-scale span in volts.
const VOLTAGE_SPAN: f64 = 4.5;
/// Current ADC full-scale span in amps.
const CURRENT_SPAN: f64 = 4.096;
/// Sine generator frequency LSB in hertz.
const FREQ_LSB: f64 = 10000.0 / 256.0;
/// Charge accumulator scale divisor.
const CHARGE_DIVISOR: f64 = 9.765625;
/// Thermistor nominal resistance at 25 °C (ohms).
const THERMISTOR_RO: f64 = 10000.0;
/// 25 °C reference in kelvin.
const THERMISTOR_TO: f64 = 298.15;

/// Interpret a raw register as a signed 16-bit quantity.
#[inline]
pub fn sign_extend(raw: u16) -> i16 {
    raw as i16
}

// ============================================================================
// Decode: raw register -> physical value
// ============================================================================

/// Cell or limit voltage in volts. Signed, ±4.5 V over 15 bits.
pub fn as_voltage(raw: u16) -> f64 {
    f64::from(sign_extend(raw)) * VOLTAGE_SPAN / FULL_SCALE
}

/// Cell or limit current in amps. Signed, ±4.096 A over 15 bits.
pub fn as_current(raw: u16) -> f64 {
    f64::from(sign_extend(raw)) * CURRENT_SPAN / FULL_SCALE
}

/// Supply voltage in volts. The VCC register holds a reciprocal reading.
pub fn as_vcc(raw: u16) -> f64 {
    if raw == 0 {
        return f64::NAN;
    }
    FULL_SCALE * CURRENT_SPAN / f64::from(raw)
}

/// Sine excitation frequency in hertz.
pub fn as_freq(raw: u16) -> f64 {
    f64::from(raw) * FREQ_LSB
}

/// Current setpoint in amps (7-bit fractional fixed point).
pub fn as_setpoint(raw: u16) -> f64 {
    f64::from(raw) / 128.0
}

/// Sine offset current in amps (same /128 fixed point as the setpoint).
pub fn as_ioff(raw: u16) -> f64 {
    f64::from(raw) / 128.0
}

/// Sine magnitude divider: 2.0 / 2^raw amps peak-peak.
pub fn as_magdiv(raw: u16) -> f64 {
    2.0 / f64::from(1u32 << (raw as u32).min(31))
}

/// Accumulated charge in coulombs from the 32-bit accumulator.
///
/// `hi_res` selects the firmware high-resolution accumulator scaling
/// (×1 instead of the legacy ×6 multiplier).
pub fn as_charge(raw: u32, hi_res: bool) -> f64 {
    let mult = if hi_res { 1.0 } else { 6.0 };
    (mult * (f64::from(raw) / FULL_SCALE)) * CURRENT_SPAN / CHARGE_DIVISOR
}

/// Cell temperature in °C via the Beta thermistor model.
///
/// `r_divider` and `beta` are the per-channel calibration constants read
/// from TEMP_CALIB_R / TEMP_CALIB_B. Any domain error yields NaN.
pub fn as_temperature_c(raw: u16, r_divider: u16, beta: u16) -> f64 {
    if raw == 0 || r_divider == 0 || beta == 0 {
        return f64::NAN;
    }
    // Invert the voltage divider to recover the thermistor resistance.
    let r_meas = f64::from(r_divider) / ((FULL_SCALE / f64::from(raw)) - 1.0);
    let t_inv = (1.0 / THERMISTOR_TO) + (r_meas / THERMISTOR_RO).ln() / f64::from(beta);
    (1.0 / t_inv) - 273.15
}

/// Cell temperature in °F.
pub fn as_temperature_f(raw: u16, r_divider: u16, beta: u16) -> f64 {
    as_temperature_c(raw, r_divider, beta) * 1.8 + 32.0
}

// ============================================================================
// Encode: physical value -> raw register
// ============================================================================

pub fn encode_voltage(volts: f64) -> u16 {
    let raw = (volts * FULL_SCALE / VOLTAGE_SPAN).round();
    raw.clamp(-FULL_SCALE, FULL_SCALE - 1.0) as i32 as u16
}

pub fn encode_current(amps: f64) -> u16 {
    let raw = (amps * FULL_SCALE / CURRENT_SPAN).round();
    raw.clamp(-FULL_SCALE, FULL_SCALE - 1.0) as i32 as u16
}

pub fn encode_vcc(volts: f64) -> u16 {
    if volts == 0.0 || !volts.is_finite() {
        return 0;
    }
    ((FULL_SCALE * CURRENT_SPAN) / volts) as i32 as u16
}

pub fn encode_freq(hertz: f64) -> u16 {
    (hertz / FREQ_LSB) as i32 as u16
}

pub fn encode_ioff(amps: f64) -> u16 {
    (amps * 128.0) as i32 as u16
}

/// Encode a current setpoint, clamped to the device-accepted raw range.
pub fn encode_setpoint(amps: f64) -> u16 {
    if !amps.is_finite() || amps <= 0.0 {
        return 0;
    }
    ((amps * 128.0) as i64).clamp(0, i64::from(SETPOINT_MAX_RAW)) as u16
}

pub fn encode_magdiv(amps_pp: f64) -> u16 {
    if amps_pp <= 0.0 || !amps_pp.is_finite() {
        return 0;
    }
    (1.0 - amps_pp.log2()) as i32 as u16
}

/// Encode accumulated charge into the (low, high) register pair.
pub fn encode_charge(coulombs: f64, hi_res: bool) -> (u16, u16) {
    let mult = if hi_res { 1.0 } else { 6.0 };
    let raw = (coulombs * CHARGE_DIVISOR / CURRENT_SPAN / mult * FULL_SCALE) as i64 as u32;
    ((raw & 0xFFFF) as u16, (raw >> 16) as u16)
}

/// Encode a °C temperature limit into the raw register domain.
///
/// Returns the firmware's -100 dummy (as u16) when the divider inversion
/// has no solution, matching the device-side sentinel.
pub fn encode_temperature_c(celsius: f64, r_divider: u16, beta: u16) -> u16 {
    let t_inv = 1.0 / (celsius + 273.15);
    let r = ((t_inv - 1.0 / THERMISTOR_TO) * f64::from(beta)).exp() * THERMISTOR_RO;
    if r > 0.0 && r_divider > 0 {
        (FULL_SCALE / ((f64::from(r_divider) / r) + 1.0)) as i32 as u16
    } else {
        (-100i32) as u16
    }
}

/// Encode a °F temperature limit into the raw register domain.
pub fn encode_temperature_f(fahrenheit: f64, r_divider: u16, beta: u16) -> u16 {
    encode_temperature_c((fahrenheit - 32.0) / 1.8, r_divider, beta)
}
