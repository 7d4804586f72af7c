//! Firmware programming orchestration.
//!
//! Drives the DfuSe download sequence per load segment: clear any
//! stale error, set the address pointer, stream the data blocks, and
//! trigger manifestation with an empty download once everything is on
//! the device.

use std::time::{Duration, Instant};

use log::{debug, info};
use nusb::MaybeFuture;
use serde::Serialize;

use crate::config::{is_dfu_device, DFU_FIRST_DATA_BLOCK, DFU_SCAN_INTERVAL};
use crate::dfu::connection::NusbBus;
use crate::dfu::{ControlBus, DfuConnection, DfuDescriptor};
use crate::dfu::image::parse_firmware_image;
use crate::error::{DriverError, DriverResult};

/// GET_DESCRIPTOR standard request.
const USB_REQ_GET_DESCRIPTOR: u8 = 0x06;

/// Programming progress stages for consumer feedback.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "stage", content = "data")]
pub enum FlashStage {
    /// Parsing the firmware payload.
    ReadingImage,
    /// Positioning the DfuSe address pointer.
    SettingAddress { address: u32 },
    /// Streaming firmware blocks.
    Writing { sent: usize, total: usize },
    /// Triggering manifestation.
    Manifesting,
    /// Programming finished.
    Complete,
}

impl FlashStage {
    /// Percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            FlashStage::ReadingImage => 0.0,
            FlashStage::SettingAddress { .. } => 5.0,
            FlashStage::Writing { sent, total } => {
                if *total == 0 {
                    5.0
                } else {
                    5.0 + (*sent as f32 / *total as f32) * 90.0
                }
            }
            FlashStage::Manifesting => 97.0,
            FlashStage::Complete => 100.0,
        }
    }

    /// Human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            FlashStage::ReadingImage => "Reading firmware image...".into(),
            FlashStage::SettingAddress { address } => {
                format!("Selecting flash region 0x{:08X}...", address)
            }
            FlashStage::Writing { sent, total } => {
                let percent = if *total == 0 { 0 } else { (sent * 100) / total };
                format!("Writing firmware... {}%", percent)
            }
            FlashStage::Manifesting => "Finalizing firmware...".into(),
            FlashStage::Complete => "Firmware update complete!".into(),
        }
    }
}

/// Programmer for a device in DFU mode.
pub struct DfuProgrammer {
    connection: DfuConnection<NusbBus>,
    transfer_size: u16,
}

impl DfuProgrammer {
    /// Open the DFU-mode device (0483:DF11), claim interface 0, and
    /// read the functional descriptor.
    pub fn open() -> DriverResult<Self> {
        let info = nusb::list_devices()
            .wait()?
            .find(|d| is_dfu_device(d.vendor_id(), d.product_id()))
            .ok_or(DriverError::NoDfuDevice)?;
        info!(
            "DFU device on bus {} addr {}",
            info.bus_id(),
            info.device_address()
        );

        let device = info.open().wait()?;
        let interface = device.claim_interface(0).wait()?;
        let bus = NusbBus::new(interface);

        let raw = bus.standard_in(
            USB_REQ_GET_DESCRIPTOR,
            (crate::config::DFU_DESC_TYPE as u16) << 8,
            crate::config::DFU_DESC_LEN as u16,
        )?;
        let descriptor = DfuDescriptor::parse(&raw)?;
        let transfer_size = descriptor.clamped_transfer_size();
        debug!(
            "DFU descriptor: transfer size {} (raw {}), version 0x{:04X}",
            transfer_size,
            descriptor.transfer_size(),
            descriptor.dfu_version()
        );

        Ok(DfuProgrammer {
            connection: DfuConnection::new(bus),
            transfer_size,
        })
    }

    /// Wait for the DFU-mode device to enumerate after a bootloader
    /// handoff, then open it.
    pub fn wait_for_device(timeout: Duration) -> DriverResult<Self> {
        let start = Instant::now();
        loop {
            match Self::open() {
                Ok(programmer) => return Ok(programmer),
                Err(DriverError::NoDfuDevice) if start.elapsed() < timeout => {
                    std::thread::sleep(DFU_SCAN_INTERVAL);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Negotiated transfer size in bytes.
    pub fn transfer_size(&self) -> u16 {
        self.transfer_size
    }

    /// Program a firmware payload (ELF32 or flat binary).
    pub fn program<F>(&mut self, firmware: &[u8], on_progress: F) -> DriverResult<()>
    where
        F: Fn(FlashStage),
    {
        run_program(&self.connection, self.transfer_size, firmware, &on_progress)
    }
}

/// The download sequence against any control bus.
pub(crate) fn run_program<B: ControlBus>(
    connection: &DfuConnection<B>,
    transfer_size: u16,
    firmware: &[u8],
    on_progress: &dyn Fn(FlashStage),
) -> DriverResult<()> {
    on_progress(FlashStage::ReadingImage);
    let segments = parse_firmware_image(firmware)?;
    let total: usize = segments.iter().map(|s| s.data.len()).sum();
    info!(
        "programming {} bytes in {} segment(s), transfer size {}",
        total,
        segments.len(),
        transfer_size
    );

    let mut sent = 0usize;
    for segment in &segments {
        connection.clear_status_if_error()?;

        on_progress(FlashStage::SettingAddress {
            address: segment.address,
        });
        connection.set_address_pointer(segment.address)?;

        // Block numbering restarts per segment; 0 is the command
        // channel and 1 is unused under DfuSe.
        let mut block = DFU_FIRST_DATA_BLOCK;
        for chunk in segment.data.chunks(transfer_size as usize) {
            connection.dnload(block, chunk)?;
            connection.poll_until_ready()?;
            block += 1;
            sent += chunk.len();
            on_progress(FlashStage::Writing { sent, total });
        }
    }

    on_progress(FlashStage::Manifesting);
    connection.dnload(0, &[])?;
    connection.poll_until_ready()?;

    on_progress(FlashStage::Complete);
    info!("programming complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DfuState, DFU_DNLOAD};
    use crate::dfu::connection::tests::{BusCall, MockBus};
    use crate::dfu::image::tests::build_elf32;

    fn dnload_calls(calls: &[BusCall]) -> Vec<(u16, usize)> {
        calls
            .iter()
            .filter_map(|c| match c {
                BusCall::ClassOut {
                    request,
                    value,
                    data,
                } if *request == DFU_DNLOAD => Some((*value, data.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_flat_binary_block_sequence() {
        // 3000 bytes at transfer size 1024: blocks 2, 3, 4 carrying
        // 1024, 1024 and 952 bytes, then the empty manifest trigger.
        let bus = MockBus::new();
        bus.script_status(0, 0, DfuState::DfuError as u8); // clear-if-error probe
        let connection = DfuConnection::new(bus);
        let firmware = vec![0xFF; 3000];

        run_program(&connection, 1024, &firmware, &|_| {}).unwrap();

        let calls = connection.bus().calls.lock().unwrap();
        let dnloads = dnload_calls(&calls);
        assert_eq!(
            dnloads,
            vec![
                (0, 5),    // SET_ADDRESS_POINTER 0x08000000
                (2, 1024),
                (3, 1024),
                (4, 952),
                (0, 0), // manifest trigger
            ]
        );

        // The stale error state was cleared before downloading.
        assert!(calls
            .iter()
            .any(|c| matches!(c, BusCall::ClassOut { request, .. } if *request == crate::config::DFU_CLRSTATUS)));

        // The address command targets the flash base.
        let addr_cmd = calls
            .iter()
            .find_map(|c| match c {
                BusCall::ClassOut {
                    request,
                    value: 0,
                    data,
                } if *request == DFU_DNLOAD && !data.is_empty() => Some(data.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(addr_cmd, vec![0x21, 0x00, 0x00, 0x00, 0x08]);
    }

    #[test]
    fn test_no_clrstatus_when_state_clean() {
        let bus = MockBus::new();
        let connection = DfuConnection::new(bus);
        run_program(&connection, 1024, &[0xAA; 10], &|_| {}).unwrap();

        let calls = connection.bus().calls.lock().unwrap();
        assert!(!calls
            .iter()
            .any(|c| matches!(c, BusCall::ClassOut { request, .. } if *request == crate::config::DFU_CLRSTATUS)));
    }

    #[test]
    fn test_elf_segments_restart_block_numbering() {
        let seg_a = vec![1u8; 300];
        let seg_b = vec![2u8; 100];
        let elf = build_elf32(&[
            (0x0800_0000, 0, seg_a.as_slice()),
            (0x0800_8000, 0, seg_b.as_slice()),
        ]);

        let bus = MockBus::new();
        let connection = DfuConnection::new(bus);
        run_program(&connection, 256, &elf, &|_| {}).unwrap();

        let calls = connection.bus().calls.lock().unwrap();
        let dnloads = dnload_calls(&calls);
        assert_eq!(
            dnloads,
            vec![
                (0, 5),   // address 0x08000000
                (2, 256),
                (3, 44),
                (0, 5),   // address 0x08008000
                (2, 100),
                (0, 0), // single manifest trigger at the end
            ]
        );
    }

    #[test]
    fn test_status_error_aborts_program() {
        let bus = MockBus::new();
        bus.script_status(0, 0, DfuState::DfuIdle as u8); // clear-if-error probe
        bus.script_status(0, 0, DfuState::DfuDnloadIdle as u8); // after address
        bus.script_status(0x08, 0, DfuState::DfuError as u8); // first data block fails
        let connection = DfuConnection::new(bus);

        let result = run_program(&connection, 1024, &[0xFF; 100], &|_| {});
        assert!(matches!(result, Err(DriverError::Dfu { status: 0x08 })));
    }

    #[test]
    fn test_progress_stages_reported_in_order() {
        let bus = MockBus::new();
        let connection = DfuConnection::new(bus);
        let stages = std::sync::Mutex::new(Vec::new());

        run_program(&connection, 1024, &[0xFF; 2048], &|s| {
            stages.lock().unwrap().push(s);
        })
        .unwrap();

        let stages = stages.lock().unwrap();
        assert!(matches!(stages[0], FlashStage::ReadingImage));
        assert!(matches!(
            stages[1],
            FlashStage::SettingAddress {
                address: 0x0800_0000
            }
        ));
        assert!(matches!(
            stages[2],
            FlashStage::Writing {
                sent: 1024,
                total: 2048
            }
        ));
        assert!(matches!(stages.last(), Some(FlashStage::Complete)));

        let mut last = -1.0f32;
        for stage in stages.iter() {
            assert!(stage.percent() >= last);
            last = stage.percent();
        }
        assert_eq!(stages.last().unwrap().percent(), 100.0);
    }

    #[test]
    fn test_stage_messages() {
        assert!(FlashStage::ReadingImage.message().contains("Reading"));
        assert!(FlashStage::Complete.message().contains("complete"));
        let stage = FlashStage::Writing {
            sent: 750,
            total: 1000,
        };
        assert!(stage.message().contains("75%"));
    }
}
