//! Background supervision: detect the device and keep a session alive.
//!
//! The supervisor wakes every second; when no session is connected it
//! walks the candidate ports and takes the first one that completes
//! the handshake. Sessions that fail are torn down and the next
//! candidate is tried. All failures are swallowed — the supervisor
//! retries forever until stopped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::{
    CONNECTOR_POLL_MAX_MS, CONNECTOR_POLL_MIN_MS, DEFAULT_POLL_INTERVAL_MS, SUPERVISOR_INTERVAL,
    SUPERVISOR_JOIN_TIMEOUT,
};
use crate::enumerate::list_candidate_ports;
use crate::events::{EventBus, SubscriptionToken};
use crate::session::{DeviceData, DeviceSession};

struct ConnectorShared {
    stop: AtomicBool,
    poll_interval_ms: AtomicU64,
    session: Mutex<Option<Arc<DeviceSession>>>,
    connection_events: EventBus<bool>,
    data_events: EventBus<DeviceData>,
}

/// Supervisor that owns at most one live [`DeviceSession`] and
/// republishes its event streams.
pub struct AutoConnector {
    shared: Arc<ConnectorShared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AutoConnector {
    /// Create a stopped connector.
    pub fn new() -> Self {
        AutoConnector {
            shared: Arc::new(ConnectorShared {
                stop: AtomicBool::new(false),
                poll_interval_ms: AtomicU64::new(DEFAULT_POLL_INTERVAL_MS),
                session: Mutex::new(None),
                connection_events: EventBus::new(),
                data_events: EventBus::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    /// Start the supervisor thread. Idempotent while running.
    pub fn start(&self) {
        let mut guard = self.supervisor.lock().unwrap_or_else(|p| p.into_inner());
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = self.shared.clone();
        *guard = Some(thread::spawn(move || supervise(shared)));
        info!("supervisor started");
    }

    /// Stop the supervisor, waiting up to 500 ms for it to exit, and
    /// dispose any live session.
    pub fn stop(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            let deadline = Instant::now() + SUPERVISOR_JOIN_TIMEOUT;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("supervisor did not exit in time; abandoning");
            }
        }

        let session = self
            .shared
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(session) = session {
            session.disconnect();
        }
        info!("supervisor stopped");
    }

    /// Whether a session is currently connected.
    pub fn is_connected(&self) -> bool {
        self.shared
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    /// Current polling interval in milliseconds.
    pub fn poll_interval_ms(&self) -> u64 {
        self.shared.poll_interval_ms.load(Ordering::SeqCst)
    }

    /// Set the polling interval, clamped to [50, 5000] ms, and forward
    /// it to the live session (which applies its own floor).
    pub fn set_poll_interval(&self, ms: u64) {
        let clamped = ms.clamp(CONNECTOR_POLL_MIN_MS, CONNECTOR_POLL_MAX_MS);
        self.shared.poll_interval_ms.store(clamped, Ordering::SeqCst);
        if let Some(session) = self
            .shared
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            session.set_poll_interval(clamped);
        }
    }

    /// Subscribe to the unified connection stream.
    pub fn on_connection_changed<F>(&self, handler: F) -> SubscriptionToken
    where
        F: Fn(&bool) + Send + Sync + 'static,
    {
        self.shared.connection_events.subscribe(handler)
    }

    /// Subscribe to the unified telemetry stream.
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
}

impl Default for AutoConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AutoConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Try each candidate port in order; the first session that completes
/// the handshake wins. Failed candidates are torn down on the spot.
pub fn try_connect_any(ports: &[String]) -> Option<DeviceSession> {
    for port in ports {
        let session = DeviceSession::new(port);
        match session.connect() {
            Ok(true) => {
                info!("connected on {}", port);
                return Some(session);
            }
            Ok(false) => debug!("{}: not our device", port),
            Err(e) => debug!("{}: connect failed: {}", port, e),
        }
    }
    None
}

fn supervise(shared: Arc<ConnectorShared>) {
    while !shared.stop.load(Ordering::SeqCst) {
        let live = shared
            .session
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false);

        if !live {
            // Drop any dead session before scanning again.
            shared
                .session
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take();

            for port in list_candidate_ports() {
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                let session = Arc::new(DeviceSession::new(&port));
                attach_forwarders(&shared, &session);
                session.set_poll_interval(shared.poll_interval_ms.load(Ordering::SeqCst));

                match session.connect() {
                    Ok(true) => {
                        info!("supervisor connected on {}", port);
                        *shared.session.lock().unwrap_or_else(|p| p.into_inner()) =
                            Some(session);
                        break;
                    }
                    Ok(false) => debug!("{}: not our device", port),
                    Err(e) => debug!("{}: connect failed: {}", port, e),
                }
            }
        }

        let deadline = Instant::now() + SUPERVISOR_INTERVAL;
        while Instant::now() < deadline {
            if shared.stop.load(Ordering::SeqCst) {
                return;
            }
            thread::sleep(Duration::from_millis(20));
        }
    }
}

/// Republish a session's event streams onto the connector's unified
/// streams. Attached before `connect` so the initial transition is
/// never missed.
fn attach_forwarders(shared: &Arc<ConnectorShared>, session: &DeviceSession) {
    let connection_out = shared.connection_events.clone();
    session.on_connection_changed(move |connected| {
        connection_out.publish(*connected);
    });
    let data_out = shared.data_events.clone();
    session.on_data_updated(move |data| {
        data_out.publish(data.clone());
    });
}
