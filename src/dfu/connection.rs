//! DFU control-transfer plumbing and the download state machine.
//!
//! DFU requests are class requests addressed to the interface; the
//! functional-descriptor fetch is a standard request. The transfer
//! seam is the [`ControlBus`] trait so the state machine can run
//! against a scripted double in tests.

use std::time::{Duration, Instant};

use log::debug;
use nusb::{
    transfer::{ControlIn, ControlOut, ControlType, Recipient},
    MaybeFuture,
};

use crate::config::{
    DfuState, DFUSE_CMD_SET_ADDRESS, DFU_CLRSTATUS, DFU_DNLOAD, DFU_GETSTATUS,
    DFU_POLL_TIMEOUT_CAP_MS,
};
use crate::error::{DriverError, DriverResult};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(5000);

/// Hard ceiling on one PollUntilReady loop, so a device stuck in an
/// intermediate state cannot hang the programmer forever.
const POLL_DEADLINE: Duration = Duration::from_secs(30);

const GETSTATUS_LEN: u16 = 6;

/// Control transfers against one claimed USB interface.
pub(crate) trait ControlBus: Send {
    /// Class request, host to device.
    fn class_out(&self, request: u8, value: u16, data: &[u8]) -> DriverResult<()>;

    /// Class request, device to host.
    fn class_in(&self, request: u8, value: u16, length: u16) -> DriverResult<Vec<u8>>;

    /// Standard request, device to host.
    fn standard_in(&self, request: u8, value: u16, length: u16) -> DriverResult<Vec<u8>>;
}

/// The production bus over a claimed nusb interface.
pub(crate) struct NusbBus {
    interface: nusb::Interface,
}

impl NusbBus {
    pub(crate) fn new(interface: nusb::Interface) -> Self {
        NusbBus { interface }
    }
}

impl ControlBus for NusbBus {
    fn class_out(&self, request: u8, value: u16, data: &[u8]) -> DriverResult<()> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()?)
    }

    fn class_in(&self, request: u8, value: u16, length: u16) -> DriverResult<Vec<u8>> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Class,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()?)
    }

    fn standard_in(&self, request: u8, value: u16, length: u16) -> DriverResult<Vec<u8>> {
        let index = self.interface.interface_number() as u16;
        Ok(self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Standard,
                    recipient: Recipient::Interface,
                    request,
                    value,
                    index,
                    length,
                },
                CONTROL_TIMEOUT,
            )
            .wait()?)
    }
}

/// A decoded DFU_GETSTATUS reply.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DfuStatus {
    pub status: u8,
    pub poll_timeout_ms: u32,
    pub state: u8,
}

impl DfuStatus {
    /// Decode the 6-byte reply: bStatus, bwPollTimeout (3 bytes LE),
    /// bState, iString.
    fn from_raw(data: &[u8]) -> DriverResult<Self> {
        if data.len() < GETSTATUS_LEN as usize {
            return Err(DriverError::Protocol {
                reason: format!("short GETSTATUS reply: {} bytes", data.len()),
            });
        }
        Ok(DfuStatus {
            status: data[0],
            poll_timeout_ms: (data[3] as u32) << 16 | (data[2] as u32) << 8 | (data[1] as u32),
            state: data[4],
        })
    }
}

/// The DFU download state machine over some control bus.
pub(crate) struct DfuConnection<B: ControlBus> {
    bus: B,
}

impl<B: ControlBus> DfuConnection<B> {
    pub(crate) fn new(bus: B) -> Self {
        DfuConnection { bus }
    }

    #[cfg(test)]
    pub(crate) fn bus(&self) -> &B {
        &self.bus
    }

    pub(crate) fn get_status(&self) -> DriverResult<DfuStatus> {
        let raw = self.bus.class_in(DFU_GETSTATUS, 0, GETSTATUS_LEN)?;
        DfuStatus::from_raw(&raw)
    }

    pub(crate) fn clear_status(&self) -> DriverResult<()> {
        self.bus.class_out(DFU_CLRSTATUS, 0, &[])
    }

    /// Leave a stale error state behind before starting a download.
    pub(crate) fn clear_status_if_error(&self) -> DriverResult<()> {
        let status = self.get_status()?;
        if status.state == DfuState::DfuError as u8 {
            debug!("clearing stale DFU error (status 0x{:02X})", status.status);
            self.clear_status()?;
        }
        Ok(())
    }

    /// DFU_DNLOAD for one block.
    pub(crate) fn dnload(&self, block: u16, data: &[u8]) -> DriverResult<()> {
        self.bus.class_out(DFU_DNLOAD, block, data)
    }

    /// DfuSe SET_ADDRESS_POINTER: DNLOAD block 0 with the command byte
    /// and the little-endian address.
    pub(crate) fn set_address_pointer(&self, address: u32) -> DriverResult<()> {
        let mut cmd = Vec::with_capacity(5);
        cmd.push(DFUSE_CMD_SET_ADDRESS);
        cmd.extend_from_slice(&address.to_le_bytes());
        self.dnload(0, &cmd)?;
        self.poll_until_ready()
    }

    /// Poll GETSTATUS until the device settles.
    ///
    /// Busy and manifest states wait for the device-reported poll
    /// timeout (capped at one second); idle and sync states succeed; a
    /// non-zero bStatus is fatal.
    pub(crate) fn poll_until_ready(&self) -> DriverResult<()> {
        let start = Instant::now();
        loop {
            let status = self.get_status()?;
            if status.status != 0 {
                return Err(DriverError::Dfu {
                    status: status.status,
                });
            }

            match DfuState::from_byte(status.state) {
                Some(DfuState::DfuDnBusy) | Some(DfuState::DfuManifest) => {
                    let wait = status.poll_timeout_ms.min(DFU_POLL_TIMEOUT_CAP_MS);
                    std::thread::sleep(Duration::from_millis(wait as u64));
                }
                Some(DfuState::DfuDnloadIdle)
                | Some(DfuState::DfuIdle)
                | Some(DfuState::DfuManifestSync)
                | Some(DfuState::DfuManifestWaitReset) => return Ok(()),
                _ => {
                    let wait = status.poll_timeout_ms.clamp(1, 100);
                    std::thread::sleep(Duration::from_millis(wait as u64));
                }
            }

            if start.elapsed() >= POLL_DEADLINE {
                return Err(DriverError::DfuState {
                    state: status.state,
                });
            }
        }
    }
}
