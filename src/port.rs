//! Serial transport and cross-process port arbitration.
//!
//! The byte transport sits behind the [`SerialIo`] trait so sessions
//! can be exercised against a scripted mock. [`SharedPort`] layers the
//! system-wide named lock on top: every operation runs under the lock,
//! and the lock is guard-scoped so a process dying mid-transaction
//! releases it for the next acquirer.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, warn};
use serialport::SerialPort;

use crate::config::{
    BAUD_RATE, PORT_LOCK_NAME, PORT_LOCK_RETRY_INTERVAL, PORT_LOCK_TIMEOUT, SERIAL_READ_TIMEOUT,
    SERIAL_WRITE_TIMEOUT,
};
use crate::enumerate::normalize_port_name;
use crate::error::{DriverError, DriverResult};

/// Byte-oriented serial transport operations.
///
/// A read that times out returns `Ok(0)`; the caller decides whether
/// that matters.
pub trait SerialIo: Send {
    /// Read into `buf`, returning the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> DriverResult<usize>;

    /// Write the whole buffer.
    fn write_all(&mut self, data: &[u8]) -> DriverResult<()>;

    /// Flush buffered output.
    fn flush(&mut self) -> DriverResult<()>;

    /// Drop any pending input bytes.
    fn discard_input(&mut self) -> DriverResult<()>;

    /// Bytes currently waiting in the input buffer.
    fn bytes_available(&mut self) -> DriverResult<usize>;

    /// Drive the RTS line.
    fn set_rts(&mut self, level: bool) -> DriverResult<()>;
}

/// Production transport over a real serial port.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the port with the device's settings: 8N1, 115 200 baud,
    /// 1 s timeouts.
    pub fn open(port_name: &str) -> DriverResult<Self> {
        let normalized = normalize_port_name(port_name);

        let port = serialport::new(&normalized, BAUD_RATE)
            .timeout(SERIAL_READ_TIMEOUT)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .map_err(|e| DriverError::PortUnavailable {
                port: port_name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self { port })
    }
}

impl SerialIo for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> DriverResult<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(DriverError::Io(e)),
        }
    }

    fn write_all(&mut self, data: &[u8]) -> DriverResult<()> {
        use std::io::Write;
        self.port.write_all(data).map_err(DriverError::Io)
    }

    fn flush(&mut self) -> DriverResult<()> {
        use std::io::Write;
        self.port.flush().map_err(DriverError::Io)
    }

    fn discard_input(&mut self) -> DriverResult<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(DriverError::Serial)
    }

    fn bytes_available(&mut self) -> DriverResult<usize> {
        Ok(self.port.bytes_to_read().map_err(DriverError::Serial)? as usize)
    }

    fn set_rts(&mut self, level: bool) -> DriverResult<()> {
        self.port
            .write_request_to_send(level)
            .map_err(DriverError::Serial)
    }
}

// ============================================================================
// System-wide named lock
// ============================================================================

/// Guard for the system-wide port lock. Releasing happens on drop,
/// exactly once, so an acquisition recovered from a dead owner cannot
/// double-release.
#[derive(Debug)]
pub struct SystemLock {
    file: File,
}

impl SystemLock {
    /// Acquire the named lock, waiting up to `timeout`.
    ///
    /// The lock is an advisory exclusive file lock on a well-known
    /// path; the OS drops it when the owning process dies, so an
    /// abandoned lock is simply acquirable again.
    pub fn acquire(name: &str, timeout: Duration) -> DriverResult<Self> {
        let path = lock_path(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(DriverError::Io)?;

        let deadline = Instant::now() + timeout;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(SystemLock { file }),
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(PORT_LOCK_RETRY_INTERVAL);
                }
                Err(_) => {
                    warn!("port lock '{}' busy past {:?}", name, timeout);
                    return Err(DriverError::PortBusy {
                        name: name.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            }
        }
    }
}

impl Drop for SystemLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Map a lock name to its backing file in the system temp directory.
/// The Windows `Global\` namespace prefix becomes part of the stem so
/// the file name stays flat.
fn lock_path(name: &str) -> PathBuf {
    let stem: String = name
        .chars()
        .map(|c| if c == '\\' || c == '/' { '_' } else { c })
        .collect();
    std::env::temp_dir().join(format!("{}.lock", stem))
}

// ============================================================================
// SharedPort
// ============================================================================

/// A serial port arbitrated across processes.
///
/// Every public operation acquires the system-wide lock for its
/// duration; [`SharedPort::transaction`] holds one acquisition across
/// a whole write/read exchange so no other process can interleave
/// between the command and its response. In-process serialization of
/// transactions is the caller's `Mutex<SharedPort>`.
pub struct SharedPort {
    port_name: String,
    lock_name: String,
    transport: Option<Box<dyn SerialIo>>,
}

impl SharedPort {
    /// Create an unopened port for the given name, arbitrated by the
    /// default system-wide lock.
    pub fn new(port_name: &str) -> Self {
        Self::with_lock_name(port_name, PORT_LOCK_NAME)
    }

    /// Create an unopened port with a specific lock name.
    pub fn with_lock_name(port_name: &str, lock_name: &str) -> Self {
        SharedPort {
            port_name: port_name.to_string(),
            lock_name: lock_name.to_string(),
            transport: None,
        }
    }

    /// Wrap an already-open transport. Used by tests to inject a mock.
    pub fn with_transport(transport: Box<dyn SerialIo>, lock_name: &str) -> Self {
        SharedPort {
            port_name: String::new(),
            lock_name: lock_name.to_string(),
            transport: Some(transport),
        }
    }

    /// The port name this instance targets.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Whether the OS handle is currently held.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Read timeout applied to individual transport reads.
    pub fn read_timeout(&self) -> Duration {
        SERIAL_READ_TIMEOUT
    }

    /// Write timeout applied to individual transport writes.
    pub fn write_timeout(&self) -> Duration {
        SERIAL_WRITE_TIMEOUT
    }

    fn lock(&self) -> DriverResult<SystemLock> {
        SystemLock::acquire(&self.lock_name, PORT_LOCK_TIMEOUT)
    }

    /// Run a closure with the system-wide lock held throughout, so a
    /// command and its response form one atomic exchange on the wire.
    pub fn transaction<R>(
        &mut self,
        f: impl FnOnce(&mut PortGuard<'_>) -> DriverResult<R>,
    ) -> DriverResult<R> {
        let _guard = self.lock()?;
        f(&mut PortGuard { port: self })
    }

    /// Open the OS handle. Idempotent.
    pub fn open(&mut self) -> DriverResult<()> {
        let _guard = self.lock()?;
        self.open_unlocked()
    }

    /// Flush output and release the OS handle. Idempotent.
    pub fn close(&mut self) -> DriverResult<()> {
        let _guard = self.lock()?;
        self.close_unlocked()
    }

    /// Read into `buf` under the system-wide lock. A timeout inside
    /// the transport surfaces as `Ok(0)`.
    pub fn read(&mut self, buf: &mut [u8]) -> DriverResult<usize> {
        let _guard = self.lock()?;
        self.transport()?.read(buf)
    }

    /// Write the whole buffer under the system-wide lock.
    pub fn write_all(&mut self, data: &[u8]) -> DriverResult<()> {
        let _guard = self.lock()?;
        self.transport()?.write_all(data)
    }

    /// Drop pending input under the system-wide lock.
    pub fn discard_input(&mut self) -> DriverResult<()> {
        let _guard = self.lock()?;
        self.transport()?.discard_input()
    }

    /// Bytes waiting in the input buffer.
    pub fn bytes_available(&mut self) -> DriverResult<usize> {
        let _guard = self.lock()?;
        self.transport()?.bytes_available()
    }

    /// Drive the RTS line.
    pub fn set_rts(&mut self, level: bool) -> DriverResult<()> {
        let _guard = self.lock()?;
        self.transport()?.set_rts(level)
    }

    /// Read exactly `count` bytes within `deadline`, under the lock.
    pub fn read_exact_within(
        &mut self,
        count: usize,
        deadline: Duration,
    ) -> DriverResult<Option<Vec<u8>>> {
        let _guard = self.lock()?;
        self.read_exact_unlocked(count, deadline)
    }

    fn transport(&mut self) -> DriverResult<&mut Box<dyn SerialIo>> {
        self.transport.as_mut().ok_or(DriverError::NotConnected)
    }

    fn open_unlocked(&mut self) -> DriverResult<()> {
        if self.transport.is_some() {
            return Ok(());
        }
        debug!("opening {}", self.port_name);
        let transport = SerialTransport::open(&self.port_name)?;
        self.transport = Some(Box::new(transport));
        Ok(())
    }

    fn close_unlocked(&mut self) -> DriverResult<()> {
        if let Some(mut transport) = self.transport.take() {
            debug!("closing {}", self.port_name);
            transport.flush()?;
        }
        Ok(())
    }

    fn read_exact_unlocked(
        &mut self,
        count: usize,
        deadline: Duration,
    ) -> DriverResult<Option<Vec<u8>>> {
        let transport = self.transport()?;
        let start = Instant::now();
        let mut out = Vec::with_capacity(count);
        let mut chunk = [0u8; 256];

        while out.len() < count {
            if start.elapsed() >= deadline {
                debug!("read_exact timed out: wanted {}, got {}", count, out.len());
                return Ok(None);
            }
            if transport.bytes_available()? == 0 {
                std::thread::sleep(Duration::from_millis(2));
                continue;
            }
            let want = (count - out.len()).min(chunk.len());
            let n = transport.read(&mut chunk[..want])?;
            if n > 0 {
                out.extend_from_slice(&chunk[..n]);
            }
        }
        Ok(Some(out))
    }
}

/// Port operations inside one acquisition of the system-wide lock.
/// Obtained through [`SharedPort::transaction`].
pub struct PortGuard<'a> {
    port: &'a mut SharedPort,
}

impl PortGuard<'_> {
    /// Open the OS handle if it is not already held.
    pub fn open(&mut self) -> DriverResult<()> {
        self.port.open_unlocked()
    }

    /// Flush output and release the OS handle.
    pub fn close(&mut self) -> DriverResult<()> {
        self.port.close_unlocked()
    }

    /// Drop pending input bytes.
    pub fn discard_input(&mut self) -> DriverResult<()> {
        self.port.transport()?.discard_input()
    }

    /// Write the whole buffer.
    pub fn write_all(&mut self, data: &[u8]) -> DriverResult<()> {
        self.port.transport()?.write_all(data)
    }

    /// Drive the RTS line.
    pub fn set_rts(&mut self, level: bool) -> DriverResult<()> {
        self.port.transport()?.set_rts(level)
    }

    /// Read exactly `count` bytes within `deadline`; `Ok(None)` when
    /// the deadline elapses first.
    pub fn read_exact_within(
        &mut self,
        count: usize,
        deadline: Duration,
    ) -> DriverResult<Option<Vec<u8>>> {
        self.port.read_exact_unlocked(count, deadline)
    }
}

impl Drop for SharedPort {
    fn drop(&mut self) {
        // Release the OS handle without re-acquiring the named lock; a
        // dying owner must not block on its own arbitration.
        if let Some(mut transport) = self.transport.take() {
            let _ = transport.flush();
        }
    }
}
