//! Device session: connection lifecycle, framed command/response, and
//! the sensor polling loop.
//!
//! A session owns one [`SharedPort`]. Commands are strictly
//! serialized: the in-process port mutex keeps transactions from
//! interleaving within the process, and the system-wide lock inside
//! `SharedPort` keeps other processes off the wire. Every
//! (write opcode, read response) pair is therefore atomic on the link.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{
    BuildStruct, DeviceConfig, SensorStruct, UniqueId, VendorData, Wire,
};
use crate::config::{
    capability_watts, NvmCommand, Opcode, ScreenCommand, BOOTLOADER_SETTLE, CONFIG_FRAME_PAYLOAD,
    DEFAULT_POLL_INTERVAL_MS, NVM_MAGIC, POLL_INTERVAL_MAX_MS, POLL_INTERVAL_MIN_MS,
    POLL_JOIN_TIMEOUT, READ_EXACT_TIMEOUT, WELCOME_BANNER, WELCOME_READ_LEN,
};
use crate::error::{DriverError, DriverResult};
use crate::events::{EventBus, SubscriptionToken};
use crate::port::SharedPort;

/// Immutable identity captured during the handshake, cleared on
/// disconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Vendor/product byte pair rendered as uppercase hex ("EF05").
    pub hardware_revision: String,
    /// Firmware version reported in `VendorData`.
    pub firmware_version: u32,
    /// 96-bit unique id rendered as 24 uppercase hex characters.
    pub unique_id: String,
}

/// One decoded telemetry sample as delivered to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceData {
    pub connected: bool,
    pub hardware_revision: String,
    pub firmware_version: u32,
    /// Four temperature channels in degrees Celsius.
    pub temperatures_c: [f64; 4],
    /// Per-pin voltages in volts.
    pub pin_voltages_v: [f64; 6],
    /// Per-pin currents in amps.
    pub pin_currents_a: [f64; 6],
    /// Attached PSU capability in watts; 0 when unknown.
    pub psu_capability_w: u16,
    pub fault_status: u16,
    pub fault_log: u16,
    /// Sample time; populated for records recovered from the on-board
    /// log, `None` for live polling.
    pub timestamp: Option<DateTime<Utc>>,
}

impl DeviceData {
    /// Inlet temperature channel.
    pub fn temp_in_c(&self) -> f64 {
        self.temperatures_c[0]
    }

    /// Outlet temperature channel.
    pub fn temp_out_c(&self) -> f64 {
        self.temperatures_c[1]
    }
}

struct SessionShared {
    port: Mutex<SharedPort>,
    connected: AtomicBool,
    cancel: AtomicBool,
    poll_interval_ms: AtomicU64,
    identity: Mutex<Option<DeviceIdentity>>,
    connection_events: EventBus<bool>,
    data_events: EventBus<DeviceData>,
}

/// A command/response session with one device.
pub struct DeviceSession {
    shared: Arc<SessionShared>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DeviceSession {
    /// Create a session for the given port name. Nothing is opened
    /// until [`connect`](DeviceSession::connect).
    pub fn new(port_name: &str) -> Self {
        Self::with_port(SharedPort::new(port_name))
    }

    /// Create a session over an existing port. Used by tests to
    /// inject a mock transport.
    pub fn with_port(port: SharedPort) -> Self {
        DeviceSession {
            shared: Arc::new(SessionShared {
                port: Mutex::new(port),
                connected: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                poll_interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL_MS),
                identity: Mutex::new(None),
                connection_events: EventBus::new(),
                data_events: EventBus::new(),
            }),
            poll_thread: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Subscribe to connection state transitions.
    pub fn on_connection_changed<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.shared.connection_events.subscribe(handler)
    }

    /// Subscribe to decoded telemetry samples.
    pub fn on_data_updated<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&DeviceData) + Send + Sync + 'static,
    {
        self.shared.data_events.subscribe(handler)
    }

    /// Cancel a connection-change subscription.
    pub fn unsubscribe_connection(&self, token: SubscriptionToken) {
        self.shared.connection_events.unsubscribe(token);
    }

    /// Cancel a data subscription.
    pub fn unsubscribe_data(&self, token: SubscriptionToken) {
        self.shared.data_events.unsubscribe(token);
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    /// Whether the handshake has completed and polling is live.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Identity captured at connect, if connected.
    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock_unpoisoned(&self.shared.identity).clone()
    }

    /// Current polling interval in milliseconds.
    pub fn poll_interval_ms(&self) -> u64 {
        self.shared.poll_interval_ms.load(Ordering::SeqCst)
    }

    /// Set the polling interval, clamped to [100, 5000] ms.
    pub fn set_poll_interval(&self, ms: u64) {
        let clamped = ms.clamp(POLL_INTERVAL_MIN_MS, POLL_INTERVAL_MAX_MS);
        self.shared.poll_interval_ms.store(clamped, Ordering::SeqCst);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Open the port, run the welcome and vendor handshake, and start
    /// polling. Idempotent when already connected. A device that fails
    /// identification leaves the session disconnected without emitting
    /// any event; transport errors propagate.
    pub fn connect(&self) -> DriverResult<bool> {
        if self.is_connected() {
            return Ok(true);
        }

        let identity = {
            let mut port = lock_unpoisoned(&self.shared.port);
            match Self::handshake(&mut port) {
                Ok(identity) => identity,
                Err(DriverError::WrongDevice { reason }) => {
                    debug!("handshake rejected: {}", reason);
                    let _ = port.close();
                    return Ok(false);
                }
                Err(e) => {
                    let _ = port.close();
                    return Err(e);
                }
            }
        };

        info!(
            "connected: hw {} fw {} uid {}",
            identity.hardware_revision, identity.firmware_version, identity.unique_id
        );
        *lock_unpoisoned(&self.shared.identity) = Some(identity);
        self.shared.cancel.store(false, Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = self.shared.clone();
        let handle = thread::spawn(move || poll_loop(shared));
        *lock_unpoisoned(&self.poll_thread) = Some(handle);

        self.shared.connection_events.publish(true);
        Ok(true)
    }

    /// Welcome banner, vendor identification, unique id, and the
    /// initial screen-resume command.
    fn handshake(port: &mut SharedPort) -> DriverResult<DeviceIdentity> {
        let banner = port
            .transaction(|p| {
                p.open()?;
                p.set_rts(true)?;
                p.discard_input()?;
                p.write_all(&[Opcode::Welcome as u8])?;
                p.read_exact_within(WELCOME_READ_LEN, READ_EXACT_TIMEOUT)
            })?
            .ok_or_else(|| DriverError::WrongDevice {
                reason: "no welcome banner".to_string(),
            })?;
        let expected = WELCOME_BANNER.as_bytes();
        if banner.len() < expected.len() || &banner[..expected.len()] != expected {
            return Err(DriverError::WrongDevice {
                reason: "welcome banner mismatch".to_string(),
            });
        }

        let vendor_bytes = transact(port, Opcode::ReadVendorData, &[], VendorData::SIZE)?
            .ok_or_else(|| DriverError::WrongDevice {
                reason: "no vendor data".to_string(),
            })?;
        let vendor = VendorData::decode(&vendor_bytes)?;
        if !vendor.is_genuine() {
            return Err(DriverError::WrongDevice {
                reason: format!(
                    "vendor data {:02X}/{:02X}",
                    vendor.vendor, vendor.product
                ),
            });
        }

        let uid_bytes = transact(port, Opcode::ReadUid, &[], UniqueId::SIZE)?.ok_or_else(|| {
            DriverError::WrongDevice {
                reason: "no unique id".to_string(),
            }
        })?;
        let uid = UniqueId::decode(&uid_bytes)?;

        // Defensive and idempotent: the device may have paused its
        // display while a previous host went away.
        transact(
            port,
            Opcode::ScreenChange,
            &[ScreenCommand::ResumeUpdates as u8],
            0,
        )?;

        Ok(DeviceIdentity {
            hardware_revision: vendor.hardware_revision(),
            firmware_version: vendor.firmware_version as u32,
            unique_id: uid.hex_string(),
        })
    }

    /// Stop polling, close the port, clear identity, and emit
    /// ConnectionChanged(false). Idempotent.
    pub fn disconnect(&self) {
        self.shared.cancel.store(true, Ordering::SeqCst);

        if let Some(handle) = lock_unpoisoned(&self.poll_thread).take() {
            let deadline = Instant::now() + POLL_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("polling thread did not exit in time; abandoning");
            }
        }

        teardown(&self.shared);
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Read the firmware build string. `None` when disconnected or
    /// when the response does not arrive in time.
    pub fn read_build_string(&self) -> DriverResult<Option<String>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let mut port = lock_unpoisoned(&self.shared.port);
        match transact(&mut port, Opcode::ReadBuildInfo, &[], BuildStruct::SIZE)? {
            Some(bytes) => Ok(Some(BuildStruct::decode(&bytes)?.build_string())),
            None => Ok(None),
        }
    }

    /// Re-read the device's unique id. `None` when disconnected or on
    /// timeout; the value captured at connect stays in
    /// [`identity`](DeviceSession::identity).
    pub fn read_unique_id(&self) -> DriverResult<Option<String>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let mut port = lock_unpoisoned(&self.shared.port);
        match transact(&mut port, Opcode::ReadUid, &[], UniqueId::SIZE)? {
            Some(bytes) => Ok(Some(UniqueId::decode(&bytes)?.hex_string())),
            None => Ok(None),
        }
    }

    /// Read the packed device configuration. `None` when disconnected
    /// or when the response does not arrive in time.
    pub fn read_config(&self) -> DriverResult<Option<DeviceConfig>> {
        if !self.is_connected() {
            return Ok(None);
        }
        let mut port = lock_unpoisoned(&self.shared.port);
        match transact(&mut port, Opcode::ReadConfig, &[], DeviceConfig::SIZE)? {
            Some(bytes) => Ok(Some(DeviceConfig::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write the device configuration in 64-byte frames: opcode,
    /// offset byte, then up to 62 payload bytes per frame.
    pub fn write_config(&self, config: &DeviceConfig) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let payload = config.encode();
        let mut port = lock_unpoisoned(&self.shared.port);
        port.transaction(|p| {
            p.open()?;
            for (index, chunk) in payload.chunks(CONFIG_FRAME_PAYLOAD).enumerate() {
                let offset = index * CONFIG_FRAME_PAYLOAD;
                let mut frame = Vec::with_capacity(2 + chunk.len());
                frame.push(Opcode::WriteConfig as u8);
                frame.push(offset as u8);
                frame.extend_from_slice(chunk);
                p.write_all(&frame)?;
            }
            Ok(())
        })
    }

    /// Issue a non-volatile memory command. The magic guard bytes
    /// precede the sub-command so a corrupted frame cannot trigger a
    /// flash operation.
    pub fn nvm_cmd(&self, cmd: NvmCommand) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let mut args = Vec::with_capacity(5);
        args.extend_from_slice(&NVM_MAGIC);
        args.push(cmd as u8);
        let mut port = lock_unpoisoned(&self.shared.port);
        transact(&mut port, Opcode::NvmConfig, &args, 0)?;
        Ok(())
    }

    /// Issue a screen control command.
    pub fn screen_cmd(&self, cmd: ScreenCommand) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let mut port = lock_unpoisoned(&self.shared.port);
        transact(&mut port, Opcode::ScreenChange, &[cmd as u8], 0)?;
        Ok(())
    }

    /// Clear every latched fault bit.
    pub fn clear_faults(&self) -> DriverResult<()> {
        self.clear_faults_masked(0xFFFF, 0xFFFF)
    }

    /// Clear selected fault bits in the status and log registers.
    pub fn clear_faults_masked(&self, status_mask: u16, log_mask: u16) -> DriverResult<()> {
        if !self.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let mut args = Vec::with_capacity(4);
        args.extend_from_slice(&status_mask.to_le_bytes());
        args.extend_from_slice(&log_mask.to_le_bytes());
        let mut port = lock_unpoisoned(&self.shared.port);
        transact(&mut port, Opcode::ClearFaults, &args, 0)?;
        Ok(())
    }

    /// Ask the device to reboot into its DFU bootloader, then tear the
    /// session down. Best-effort: the device drops off the bus mid-
    /// command, so transport errors are expected and swallowed.
    pub fn enter_bootloader(&self) {
        if self.is_connected() {
            let mut port = lock_unpoisoned(&self.shared.port);
            if let Err(e) = transact(&mut port, Opcode::Bootloader, &[], 0) {
                debug!("bootloader command: {}", e);
            }
        }
        thread::sleep(BOOTLOADER_SETTLE);
        self.disconnect();
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// One serialized transaction: discard stale input, write the opcode
/// and arguments, then read the fixed-size response, all under a
/// single acquisition of the system-wide lock. A response that does
/// not complete within the deadline yields `None` rather than an
/// error; the caller decides whether to retry or skip.
fn transact(
    port: &mut SharedPort,
    opcode: Opcode,
    args: &[u8],
    response_len: usize,
) -> DriverResult<Option<Vec<u8>>> {
    port.transaction(|p| {
        p.open()?;
        p.discard_input()?;

        let mut frame = Vec::with_capacity(1 + args.len());
        frame.push(opcode as u8);
        frame.extend_from_slice(args);
        p.write_all(&frame)?;

        if response_len == 0 {
            return Ok(Some(Vec::new()));
        }
        p.read_exact_within(response_len, READ_EXACT_TIMEOUT)
    })
}

/// Close the port and flip the session to disconnected, emitting the
/// transition exactly once. Safe to call from the polling thread.
fn teardown(shared: &SessionShared) {
    {
        let mut port = lock_unpoisoned(&shared.port);
        if let Err(e) = port.close() {
            debug!("close during teardown: {}", e);
        }
    }
    *lock_unpoisoned(&shared.identity) = None;

    if shared.connected.swap(false, Ordering::SeqCst) {
        shared.connection_events.publish(false);
    }
}

fn poll_loop(shared: Arc<SessionShared>) {
    debug!("polling started");
    while !shared.cancel.load(Ordering::SeqCst) {
        let result = {
            let mut port = lock_unpoisoned(&shared.port);
            transact(&mut port, Opcode::ReadSensorValues, &[], SensorStruct::SIZE)
        };

        match result {
            Ok(Some(bytes)) => match SensorStruct::decode(&bytes) {
                Ok(sensors) => {
                    let identity = lock_unpoisoned(&shared.identity).clone();
                    shared
                        .data_events
                        .publish(map_sensors(&sensors, identity.as_ref()));
                }
                Err(e) => debug!("sensor decode failed, skipping tick: {}", e),
            },
            Ok(None) => debug!("sensor read timed out, skipping tick"),
            Err(e) => {
                warn!("polling transaction failed, disconnecting: {}", e);
                shared.cancel.store(true, Ordering::SeqCst);
                teardown(&shared);
                return;
            }
        }

        // Sleep in small slices so disconnect stays prompt even at the
        // longest polling interval.
        let interval = shared.poll_interval_ms.load(Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_millis(interval);
        while Instant::now() < deadline {
            if shared.cancel.load(Ordering::SeqCst) {
                debug!("polling cancelled");
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    debug!("polling stopped");
}

/// Map one decoded `SensorStruct` to consumer units.
fn map_sensors(sensors: &SensorStruct, identity: Option<&DeviceIdentity>) -> DeviceData {
    let mut temperatures_c = [0.0f64; 4];
    for (out, raw) in temperatures_c.iter_mut().zip(sensors.temperatures.iter()) {
        *out = *raw as f64 / 10.0;
    }
    let mut pin_voltages_v = [0.0f64; 6];
    let mut pin_currents_a = [0.0f64; 6];
    for (i, pin) in sensors.pins.iter().enumerate() {
        pin_voltages_v[i] = pin.voltage_mv as f64 / 1000.0;
        pin_currents_a[i] = pin.current_ma as f64 / 1000.0;
    }

    DeviceData {
        connected: true,
        hardware_revision: identity
            .map(|i| i.hardware_revision.clone())
            .unwrap_or_default(),
        firmware_version: identity.map(|i| i.firmware_version).unwrap_or_default(),
        temperatures_c,
        pin_voltages_v,
        pin_currents_a,
        psu_capability_w: capability_watts(sensors.hpwr_capability),
        fault_status: sensors.fault_status,
        fault_log: sensors.fault_log,
        timestamp: None,
    }
}
