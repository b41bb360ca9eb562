//! Unified error handling for the cycler library.
//!
//! Transient link problems (timeouts, frame mismatches) are *not* errors:
//! they surface as invalid register values so long-lived polling loops keep
//! running. `CyclerError` covers the conditions a caller must act on.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type CyclerResult<T> = Result<T, CyclerError>;

/// Main error type for all cycler operations.
#[derive(Debug, Error)]
pub enum CyclerError {
    // ======================================
    // Configuration errors (rejected before any wire I/O)
    // ======================================
    #[error("invalid namespace: {0:#04x}")]
    InvalidNamespace(u8),

    #[error("register value out of range: {0} (16-bit value expected)")]
    ValueOutOfRange(i32),

    // ======================================
    // Connection / transport errors
    // ======================================
    #[error("could not open serial port {port}: {reason}")]
    ConnectionFailed { port: String, reason: String },

    #[error("serial link closed")]
    LinkClosed,

    #[error("serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ======================================
    // Device errors
    // ======================================
    #[error("device is in bootloader mode; register operations unavailable")]
    InBootloader,

    #[error("write verify failed: namespace {namespace:#04x} addr {addr:#04x}: wrote {wrote}, read back {read_back}")]
    VerifyFailed {
        namespace: u8,
        addr: u8,
        wrote: u16,
        read_back: u16,
    },

    #[error("firmware image size {0} not allowed (expected 15360)")]
    BadFirmwareImage(usize),

    #[error("device still in bootloader after reboot attempt")]
    BootloadRebootFailed,

    // ======================================
    // Test / channel errors
    // ======================================
    #[error("no cell detected in slot {0}")]
    NoCellDetected(usize),

    #[error("test already running on slot {0}")]
    TestAlreadyRunning(usize),

    #[error("channel {0} control loop is not running")]
    ChannelStopped(usize),

    // ======================================
    // Pool errors
    // ======================================
    #[error("no device found on port {0}")]
    NoDeviceFound(String),

    #[error("no device currently set as active")]
    NoActiveDevice,
}

impl CyclerError {
    /// True for conditions a polling loop should absorb and retry rather
    /// than treat as the end of its device.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            CyclerError::ConnectionFailed { .. } | CyclerError::LinkClosed | CyclerError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_loss_is_fatal() {
        assert!(!CyclerError::LinkClosed.is_recoverable());
        assert!(CyclerError::NoCellDetected(0).is_recoverable());
        assert!(CyclerError::InvalidNamespace(0x42).is_recoverable());
    }

    #[test]
    fn error_messages_identify_the_register() {
        let err = CyclerError::VerifyFailed {
            namespace: 0x00,
            addr: 0x03,
            wrote: 256,
            read_back: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x03"));
        assert!(msg.contains("256"));
    }
}
