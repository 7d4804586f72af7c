//! Error types for the WireView Pro II host driver.

use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors that can occur while driving the device.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Serial port error from the serialport crate.
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another process held the system-wide port lock past the timeout.
    #[error("Port lock '{name}' busy after {timeout_ms}ms")]
    PortBusy { name: String, timeout_ms: u64 },

    /// The OS refused to open the serial port.
    #[error("Port '{port}' unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    /// Welcome banner or vendor data did not identify our device.
    #[error("Wrong device on port: {reason}")]
    WrongDevice { reason: String },

    /// A fixed-size response did not arrive within the deadline.
    #[error("Timed out waiting for {expected} response bytes (got {got})")]
    Timeout { expected: usize, got: usize },

    /// A decoded record carried a value the protocol forbids.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// A record buffer had the wrong length for its type.
    #[error("Record length mismatch: expected {expected} bytes, got {got}")]
    RecordLength { expected: usize, got: usize },

    /// USB error from the nusb crate.
    #[error("USB error: {0}")]
    Usb(#[from] nusb::Error),

    /// USB transfer error from the nusb crate.
    #[error("USB transfer error: {0}")]
    Transfer(#[from] nusb::transfer::TransferError),

    /// No device in DFU mode was found on the bus.
    #[error("No DFU device found")]
    NoDfuDevice,

    /// DFU_GETSTATUS reported a non-zero status code.
    #[error("DFU status error: code 0x{status:02X}")]
    Dfu { status: u8 },

    /// The device reported a DFU state the download loop cannot leave.
    #[error("Unexpected DFU state: 0x{state:02X}")]
    DfuState { state: u8 },

    /// The firmware image was rejected by the ELF parser.
    #[error("Firmware image rejected: {reason}")]
    ImageFormat { reason: String },

    /// The session is not connected.
    #[error("Not connected")]
    NotConnected,
}

impl DriverError {
    /// Transient errors the caller may reasonably retry.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DriverError::Timeout { .. } | DriverError::PortBusy { .. }
        )
    }
}
