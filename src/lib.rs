//! # WireView Pro II host driver
//!
//! Host-side driver for the Thermal Grizzly WireView Pro II
//! power/thermal telemetry device. The device exposes a virtual
//! serial port (0483:5740) for in-application operation and a DFU
//! interface (0483:DF11) for firmware programming.
//!
//! # Features
//!
//! - Device discovery by USB identity, with background supervision
//!   and automatic reconnection
//! - Serialized command/response sessions with a welcome/vendor
//!   handshake and a bounded-cadence sensor polling loop
//! - Cross-process port arbitration through a system-wide named lock
//! - Configuration and non-volatile command access
//! - Firmware programming over USB DFU (DfuSe) from ELF32 or flat
//!   binary images
//! - Offline decoding of the device's on-board flash log
//!
//! # Example
//!
//! ```no_run
//! use wireview_pro::AutoConnector;
//!
//! let connector = AutoConnector::new();
//! connector.on_data_updated(|data| {
//!     println!(
//!         "{:.1} degC in, {:.1} degC out, pin 0: {:.2} V {:.2} A",
//!         data.temp_in_c(),
//!         data.temp_out_c(),
//!         data.pin_voltages_v[0],
//!         data.pin_currents_a[0],
//!     );
//! });
//! connector.start();
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! connector.stop();
//! ```

pub mod codec;
pub mod config;
pub mod connector;
pub mod dfu;
pub mod enumerate;
pub mod error;
pub mod events;
pub mod logparse;
pub mod port;
pub mod session;

pub use codec::{
    BuildStruct, DeviceConfig, LogEntry, LogTag, PinReading, SensorStruct, UniqueId, VendorData,
    Wire,
};
pub use config::{NvmCommand, Opcode, ScreenCommand};
pub use connector::{try_connect_any, AutoConnector};
pub use dfu::{DfuProgrammer, FlashStage};
pub use enumerate::{find_devices, list_candidate_ports, SensorPortInfo};
pub use error::{DriverError, DriverResult};
pub use events::{EventBus, SubscriptionToken};
pub use logparse::{parse_log, LogRecord};
pub use port::{PortGuard, SerialIo, SharedPort};
pub use session::{DeviceData, DeviceIdentity, DeviceSession};
