//! Firmware programming over USB DFU with STMicroelectronics DfuSe
//! extensions.
//!
//! After [`DeviceSession::enter_bootloader`](crate::DeviceSession::enter_bootloader)
//! the device re-enumerates as 0483:DF11 and speaks DFU 1.1 with the
//! DfuSe address-pointer extension: DNLOAD block 0 is a command
//! channel (SET_ADDRESS_POINTER), data blocks start at 2.
//!
//! References:
//! - DFU: USB Device Firmware Upgrade Specification, Revision 1.1
//! - DfuSe: STMicroelectronics AN3156
//!
//! # Example
//!
//! ```no_run
//! use wireview_pro::dfu::DfuProgrammer;
//!
//! let firmware = std::fs::read("firmware.elf")?;
//! let mut programmer = DfuProgrammer::open()?;
//! programmer.program(&firmware, |stage| {
//!     println!("{} ({:.0}%)", stage.message(), stage.percent());
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod connection;
mod descriptor;
mod image;
mod programmer;

pub use descriptor::DfuDescriptor;
pub use image::{parse_firmware_image, LoadSegment};
pub use programmer::{DfuProgrammer, FlashStage};

pub(crate) use connection::{ControlBus, DfuConnection};
