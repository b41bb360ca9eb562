//! Wire frame types for the serial register protocol.
//!
//! Commands are fixed 5-byte frames. The device answers with a 5-byte
//! response frame (start `0xAA`) and interleaves unsolicited 13-byte
//! telemetry stream frames (start `0xAF`). All multi-byte values are
//! little-endian u16.

use crate::codec;
use crate::constants::{ns, RESPONSE_START, STREAM_TRAILING, WRITE_BIT};
use crate::error::{CyclerError, CyclerResult};

/// Register namespace: which sub-unit a register address refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Cell0,
    Cell1,
    Cell2,
    Cell3,
    Unit,
    Bootloader,
    Comms,
}

impl Namespace {
    /// Map a wire code to a namespace. Unknown codes are rejected before
    /// any I/O happens.
    pub fn from_code(code: u8) -> CyclerResult<Self> {
        match code {
            ns::CELL0 => Ok(Namespace::Cell0),
            ns::CELL1 => Ok(Namespace::Cell1),
            ns::CELL2 => Ok(Namespace::Cell2),
            ns::CELL3 => Ok(Namespace::Cell3),
            ns::UNIT => Ok(Namespace::Unit),
            ns::BOOTLOADER => Ok(Namespace::Bootloader),
            ns::COMMS => Ok(Namespace::Comms),
            other => Err(CyclerError::InvalidNamespace(other)),
        }
    }

    /// Namespace of a cell slot (0..=3).
    pub fn cell(slot: usize) -> Self {
        match slot {
            0 => Namespace::Cell0,
            1 => Namespace::Cell1,
            2 => Namespace::Cell2,
            _ => Namespace::Cell3,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Namespace::Cell0 => ns::CELL0,
            Namespace::Cell1 => ns::CELL1,
            Namespace::Cell2 => ns::CELL2,
            Namespace::Cell3 => ns::CELL3,
            Namespace::Unit => ns::UNIT,
            Namespace::Bootloader => ns::BOOTLOADER,
            Namespace::Comms => ns::COMMS,
        }
    }

    /// Cell slot index, if this is a cell namespace.
    pub fn slot(self) -> Option<usize> {
        match self {
            Namespace::Cell0 => Some(0),
            Namespace::Cell1 => Some(1),
            Namespace::Cell2 => Some(2),
            Namespace::Cell3 => Some(3),
            _ => None,
        }
    }

    pub fn is_cell(self) -> bool {
        self.slot().is_some()
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Cell0 => write!(f, "cell0"),
            Namespace::Cell1 => write!(f, "cell1"),
            Namespace::Cell2 => write!(f, "cell2"),
            Namespace::Cell3 => write!(f, "cell3"),
            Namespace::Unit => write!(f, "unit"),
            Namespace::Bootloader => write!(f, "bootloader"),
            Namespace::Comms => write!(f, "comms"),
        }
    }
}

/// Encode a 5-byte register read command.
pub fn encode_read(namespace: Namespace, addr: u8) -> [u8; 5] {
    [RESPONSE_START, namespace.code(), addr, 0x00, 0x00]
}

/// Encode a 5-byte register write command. The write bit is OR'ed into the
/// address byte and the value travels little-endian.
pub fn encode_write(namespace: Namespace, addr: u8, value: u16) -> [u8; 5] {
    let [lo, hi] = value.to_le_bytes();
    [RESPONSE_START, namespace.code(), addr | WRITE_BIT, lo, hi]
}

/// A parsed register response frame (the 4 bytes after the `0xAA` marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub namespace_code: u8,
    pub addr: u8,
    pub write_echo: bool,
    pub value: u16,
}

impl ResponseFrame {
    pub fn from_trailing(bytes: [u8; 4]) -> Self {
        ResponseFrame {
            namespace_code: bytes[0],
            addr: bytes[1] & !WRITE_BIT,
            write_echo: bytes[1] & WRITE_BIT != 0,
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
        }
    }

    /// True when this frame answers a command for the given register.
    pub fn matches(&self, namespace: Namespace, addr: u8) -> bool {
        self.namespace_code == namespace.code() && self.addr == addr
    }
}

/// An unsolicited telemetry stream frame (the 12 bytes after `0xAF`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrame {
    pub namespace_code: u8,
    pub mode: u16,
    pub status: u16,
    pub temperature_raw: u16,
    pub current_raw: u16,
    pub voltage_raw: u16,
}

impl StreamFrame {
    pub fn from_trailing(bytes: [u8; STREAM_TRAILING]) -> Self {
        let word = |i: usize| u16::from_le_bytes([bytes[i], bytes[i + 1]]);
        StreamFrame {
            namespace_code: bytes[0],
            // bytes[1] is a reserved zero byte
            mode: word(2),
            status: word(4),
            temperature_raw: word(6),
            current_raw: word(8),
            voltage_raw: word(10),
        }
    }
}

/// The outcome of a register read or write: the raw value plus enough echo
/// context to convert it to physical units.
///
/// A transport that exhausts its retries hands back an *invalid* value
/// rather than an error; every conversion on an invalid value is NaN so
/// bad samples flow harmlessly through telemetry math.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterValue {
    pub namespace: Namespace,
    pub addr: u8,
    pub raw: u16,
    pub write_echo: bool,
    pub valid: bool,
}

impl RegisterValue {
    pub fn new(namespace: Namespace, addr: u8, raw: u16, write_echo: bool) -> Self {
        RegisterValue {
            namespace,
            addr,
            raw,
            write_echo,
            valid: true,
        }
    }

    /// The value returned when the transport gives up on a register.
    pub fn invalid(namespace: Namespace, addr: u8) -> Self {
        RegisterValue {
            namespace,
            addr,
            raw: 0,
            write_echo: false,
            valid: false,
        }
    }

    /// Raw register content, `None` when the read failed.
    pub fn value(&self) -> Option<u16> {
        self.valid.then_some(self.raw)
    }

    pub fn as_signed(&self) -> Option<i16> {
        self.value().map(codec::sign_extend)
    }

    pub fn as_voltage(&self) -> f64 {
        self.value().map_or(f64::NAN, codec::as_voltage)
    }

    pub fn as_current(&self) -> f64 {
        self.value().map_or(f64::NAN, codec::as_current)
    }

    pub fn as_vcc(&self) -> f64 {
        self.value().map_or(f64::NAN, codec::as_vcc)
    }

    pub fn as_freq(&self) -> f64 {
        self.value().map_or(f64::NAN, codec::as_freq)
    }

    pub fn as_setpoint(&self) -> f64 {
        self.value().map_or(f64::NAN, codec::as_setpoint)
    }

    pub fn as_magdiv(&self) -> f64 {
        self.value().map_or(f64::NAN, codec::as_magdiv)
    }

    pub fn as_temperature_c(&self, r_divider: u16, beta: u16) -> f64 {
        self.value()
            .map_or(f64::NAN, |raw| codec::as_temperature_c(raw, r_divider, beta))
    }

    pub fn as_temperature_f(&self, r_divider: u16, beta: u16) -> f64 {
        self.value()
            .map_or(f64::NAN, |raw| codec::as_temperature_f(raw, r_divider, beta))
    }
}

/// Validate a host-supplied write value and fold it into the register's
/// 16-bit domain. Values carrying the 0x8000 bit are accepted in either
/// sign convention, everything outside ±65535 is rejected locally.
pub fn fold_write_value(value: i32) -> CyclerResult<u16> {
    if !(-65535..=65535).contains(&value) {
        return Err(CyclerError::ValueOutOfRange(value));
    }
    if value >= 0 {
        if value & 0x8000 != 0 {
            // Treat the sign bit as already encoded.
            Ok((value as u32 & 0xFFFF) as u16)
        } else {
            Ok(value as u16)
        }
    } else {
        Ok(value as i16 as u16)
    }
}
