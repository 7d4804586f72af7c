//! Protocol constants for the WireView Pro II host driver.
//!
//! Everything the wire protocol pins down lives here: USB identifiers,
//! serial settings, command opcodes, timing parameters, and the flash
//! log geometry.

use std::time::Duration;

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// STMicroelectronics USB Vendor ID (the device uses the ST USB stack).
pub const USB_VID: u16 = 0x0483;

/// Product ID in application mode (virtual serial port).
pub const SERIAL_PID: u16 = 0x5740;

/// Product ID in DFU bootloader mode.
pub const DFU_PID: u16 = 0xDF11;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for the virtual serial port. The link is USB CDC, so the
/// value is nominal, but the firmware expects it to be configured.
pub const BAUD_RATE: u32 = 115_200;

/// Serial read timeout for individual read operations.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Serial write timeout for individual write operations.
pub const SERIAL_WRITE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Wall-clock deadline for assembling a complete fixed-size response.
pub const READ_EXACT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Welcome banner emitted by the device on RTS assertion.
pub const WELCOME_BANNER: &str = "Thermal Grizzly WireView Pro II";

/// Bytes read during the welcome handshake: the 31-character banner
/// plus its terminating NUL.
pub const WELCOME_READ_LEN: usize = 32;

// ============================================================================
// Cross-Process Port Arbitration
// ============================================================================

/// Name of the system-wide lock serializing port access across host
/// processes. On Windows this is the classic named-mutex identifier;
/// elsewhere the backslash-stripped stem names a lock file in the
/// system temp directory.
pub const PORT_LOCK_NAME: &str = "Global\\Access_USB_Sensors";

/// How long to wait for the system-wide lock before giving up.
pub const PORT_LOCK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Retry cadence while waiting for the system-wide lock.
pub const PORT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Vendor Identification
// ============================================================================

/// Vendor byte a genuine device reports in `VendorData`.
pub const VENDOR_ID_BYTE: u8 = 0xEF;

/// Product byte a genuine device reports in `VendorData`.
pub const PRODUCT_ID_BYTE: u8 = 0x05;

// ============================================================================
// Polling & Supervision
// ============================================================================

/// Default sensor polling interval.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Session-level clamp bounds for the polling interval.
pub const POLL_INTERVAL_MIN_MS: u64 = 100;
pub const POLL_INTERVAL_MAX_MS: u64 = 5000;

/// Connector-level clamp bounds for the polling interval.
pub const CONNECTOR_POLL_MIN_MS: u64 = 50;
pub const CONNECTOR_POLL_MAX_MS: u64 = 5000;

/// Cadence of the AutoConnector supervisor loop.
pub const SUPERVISOR_INTERVAL: Duration = Duration::from_millis(1000);

/// How long `disconnect` waits for the polling thread to exit.
pub const POLL_JOIN_TIMEOUT: Duration = Duration::from_millis(1000);

/// How long `AutoConnector::stop` waits for the supervisor to exit.
pub const SUPERVISOR_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Settle time between `CMD_BOOTLOADER` and dropping the port, so the
/// byte drains before the device resets.
pub const BOOTLOADER_SETTLE: Duration = Duration::from_millis(50);

// ============================================================================
// Command Opcodes
// ============================================================================

/// Single-byte command opcodes understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Request the welcome banner.
    Welcome = 0x01,
    /// Read `VendorData`.
    ReadVendorData = 0x02,
    /// Read the 12-byte unique id.
    ReadUid = 0x03,
    /// Read one `SensorStruct` snapshot.
    ReadSensorValues = 0x04,
    /// Read the firmware build string.
    ReadBuildInfo = 0x05,
    /// Read the packed device configuration.
    ReadConfig = 0x06,
    /// Write one frame of the device configuration.
    WriteConfig = 0x07,
    /// Non-volatile memory command (guarded by magic bytes).
    NvmConfig = 0x08,
    /// Screen control command.
    ScreenChange = 0x09,
    /// Clear latched fault bits.
    ClearFaults = 0x0A,
    /// Reboot into the DFU bootloader.
    Bootloader = 0x0B,
}

/// Screen sub-commands carried after `Opcode::ScreenChange`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScreenCommand {
    /// Resume the on-device display refresh.
    ResumeUpdates = 0x01,
    /// Pause the on-device display refresh.
    PauseUpdates = 0x02,
    /// Advance to the next screen page.
    NextPage = 0x03,
}

/// Magic guard bytes preceding the NVM sub-command byte.
pub const NVM_MAGIC: [u8; 4] = [0x55, 0xAA, 0x55, 0xAA];

/// Non-volatile memory sub-commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NvmCommand {
    /// Persist the active configuration to flash.
    SaveConfig = 0x01,
    /// Restore factory defaults.
    FactoryReset = 0x02,
    /// Erase the on-board telemetry log region.
    EraseLog = 0x03,
}

/// Per-frame payload capacity of a `WriteConfig` frame: 64 bytes minus
/// the opcode and offset header bytes.
pub const CONFIG_FRAME_PAYLOAD: usize = 62;

// ============================================================================
// Flash Log Geometry
// ============================================================================

/// Alignment unit of the device's flash log region.
pub const LOG_PAGE_SIZE: usize = 256;

/// Consecutive EMPTY tags that terminate a log scan.
pub const LOG_EMPTY_SENTINEL_RUN: usize = 32;

/// Duration of one MCU tick in the log timestamp field.
pub const MCU_TICK_MS: i64 = 4;

/// Fixed scan epoch: 2026-01-01 00:00:00 UTC.
pub const LOG_BASE_EPOCH_SECS: i64 = 1_767_225_600;

/// Device time epoch for SYSTEM_TIME entries: 2020-01-01 00:00:00 UTC.
pub const DEVICE_TIME_EPOCH_SECS: i64 = 1_577_836_800;

// ============================================================================
// DFU (USB Device Firmware Upgrade, DfuSe flavor)
// ============================================================================

/// DFU class requests.
pub const DFU_DNLOAD: u8 = 1;
pub const DFU_GETSTATUS: u8 = 3;
pub const DFU_CLRSTATUS: u8 = 4;

/// DfuSe command byte: set address pointer (DNLOAD block 0).
pub const DFUSE_CMD_SET_ADDRESS: u8 = 0x21;

/// DFU functional descriptor type and length.
pub const DFU_DESC_TYPE: u8 = 0x21;
pub const DFU_DESC_LEN: usize = 9;

/// First block number carrying data; blocks 0 and 1 are reserved by
/// DfuSe (0 is the command channel, 1 is unused).
pub const DFU_FIRST_DATA_BLOCK: u16 = 2;

/// Clamp bounds for the descriptor-reported transfer size.
pub const DFU_TRANSFER_SIZE_MIN: u16 = 64;
pub const DFU_TRANSFER_SIZE_MAX: u16 = 4096;

/// Upper bound on the device-reported poll timeout while busy.
pub const DFU_POLL_TIMEOUT_CAP_MS: u32 = 1000;

/// Default flash base address for flat binary images.
pub const FLASH_BASE_ADDRESS: u32 = 0x0800_0000;

/// Cadence while waiting for the DFU-mode device to enumerate.
pub const DFU_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// DFU 1.1 device states, as reported by DFU_GETSTATUS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuState {
    AppIdle = 0x00,
    AppDetach = 0x01,
    DfuIdle = 0x02,
    DfuDnloadSync = 0x03,
    DfuDnBusy = 0x04,
    DfuDnloadIdle = 0x05,
    DfuManifestSync = 0x06,
    DfuManifest = 0x07,
    DfuManifestWaitReset = 0x08,
    DfuUploadIdle = 0x09,
    DfuError = 0x0A,
}

impl DfuState {
    /// Parse a state byte from a GETSTATUS reply.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(DfuState::AppIdle),
            0x01 => Some(DfuState::AppDetach),
            0x02 => Some(DfuState::DfuIdle),
            0x03 => Some(DfuState::DfuDnloadSync),
            0x04 => Some(DfuState::DfuDnBusy),
            0x05 => Some(DfuState::DfuDnloadIdle),
            0x06 => Some(DfuState::DfuManifestSync),
            0x07 => Some(DfuState::DfuManifest),
            0x08 => Some(DfuState::DfuManifestWaitReset),
            0x09 => Some(DfuState::DfuUploadIdle),
            0x0A => Some(DfuState::DfuError),
            _ => None,
        }
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Map the firmware's PSU capability code to watts.
///
/// The firmware uses a contiguous code rather than the raw 12VHPWR
/// sense-pin pair; codes outside the table read as 0 W (unknown).
pub fn capability_watts(code: u8) -> u16 {
    match code {
        2 => 150,
        3 => 300,
        4 => 450,
        5 => 600,
        _ => 0,
    }
}

/// Check whether a VID/PID pair is the device's serial-mode identity.
pub fn is_sensor_port(vid: u16, pid: u16) -> bool {
    vid == USB_VID && pid == SERIAL_PID
}

/// Check whether a VID/PID pair is the device's DFU-mode identity.
pub fn is_dfu_device(vid: u16, pid: u16) -> bool {
    vid == USB_VID && pid == DFU_PID
}
