//! Request bridge between a USB gadget transport and a userspace daemon.
//!
//! The gadget transport calls [`Bridge::submit_transfer`] for every host block
//! access. Each access becomes one or more requests in a bounded queue that a
//! single daemon drains through a [`DeviceFile`], the bridge's character
//! device: read a header, stream the payload, write response data, then signal
//! [`DeviceFile::block_done`]. The producer call returns once every request it
//! queued has been completed, or fails with [`BridgeError::SessionAborted`] if
//! the daemon goes away first.

mod batch;
mod config;
mod device;
mod error;
mod metrics;
mod notify;
mod producer;
mod queue;
mod session;
mod worker;

pub use batch::{InvalidateReason, PreloadWindow};
pub use config::BridgeConfig;
pub use device::DeviceFile;
pub use error::{BridgeError, Result};
pub use notify::{AsyncNotify, SignalChannel};
pub use producer::TransferBuf;
pub use session::{MessagePart, SessionStatus};
pub use worker::{Transfer, TransferTicket, TransferWorker};

use anyscreen_proto::{RequestType, DEVICE_NAME};
use session::{lock, wait, Session};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use tracing::{debug, info};

#[derive(Default)]
struct Registration {
    session: Option<Arc<Session>>,
    ready: bool,
    /// Bumped on every release so readiness waiters notice the session they saw went away.
    releases: u64,
    /// Producers parked until the daemon is ready.
    waiting: usize,
}

impl Registration {
    fn holds(&self, session: &Arc<Session>) -> bool {
        self.session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }
}

/// Snapshot of the bridge for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BridgeStatus {
    pub open: bool,
    pub daemon_ready: bool,
    pub producers_waiting: usize,
    pub session: Option<SessionStatus>,
}

/// The bridge device. Lives for as long as the gadget function is bound.
pub struct Bridge {
    config: BridgeConfig,
    available: AtomicBool,
    registration: Mutex<Registration>,
    readiness: Condvar,
    next_session_id: AtomicU64,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        debug!(?config, device = DEVICE_NAME, "bridge created");
        Ok(Self {
            config,
            available: AtomicBool::new(true),
            registration: Mutex::new(Registration::default()),
            readiness: Condvar::new(),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Open the device for the daemon. Fails with [`BridgeError::Busy`] while another
    /// handle is open; otherwise starts a fresh session with an empty queue.
    pub fn open(self: &Arc<Self>) -> Result<DeviceFile> {
        if self
            .available
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!(device = DEVICE_NAME, "device already open, returning busy");
            return Err(BridgeError::Busy);
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, self.config));
        {
            let mut registration = lock(&self.registration);
            registration.session = Some(Arc::clone(&session));
            registration.ready = false;
        }
        info!(device = DEVICE_NAME, session = id, "device opened");
        Ok(DeviceFile::new(Arc::clone(self), session))
    }

    /// Producer entry point: service one host block access.
    ///
    /// Blocks until the daemon is ready and has completed every request the
    /// access was split into. Callers that must not block use a
    /// [`TransferWorker`] instead.
    pub fn submit_transfer(&self, address: u64, buffer: TransferBuf<'_>) -> Result<()> {
        if buffer.is_empty() {
            return Err(BridgeError::InvalidTransfer("empty transfer"));
        }
        let address = usize::try_from(address)
            .map_err(|_| BridgeError::InvalidTransfer("address exceeds native word"))?;
        let session = self.wait_for_daemon()?;
        session.submit(address, buffer).inspect_err(|err| {
            debug!(session = session.id(), address, %err, "transfer failed");
        })
    }

    /// Same as [`Bridge::submit_transfer`] for callers that carry a request type code.
    pub fn submit(&self, address: u64, kind: RequestType, buf: &mut [u8]) -> Result<()> {
        let buffer = match kind {
            RequestType::Read => TransferBuf::Read(buf),
            RequestType::Write => TransferBuf::Write(buf),
            RequestType::None => return Err(BridgeError::InvalidTransfer("request type none")),
        };
        self.submit_transfer(address, buffer)
    }

    pub fn status(&self) -> BridgeStatus {
        let registration = lock(&self.registration);
        BridgeStatus {
            open: registration.session.is_some(),
            daemon_ready: registration.ready,
            producers_waiting: registration.waiting,
            session: registration.session.as_ref().map(|session| session.status()),
        }
    }

    fn wait_for_daemon(&self) -> Result<Arc<Session>> {
        let mut registration = lock(&self.registration);
        let releases = registration.releases;
        let mut waited = false;
        let result = loop {
            if registration.ready {
                if let Some(session) = &registration.session {
                    if waited {
                        debug!(session = session.id(), "daemon connected");
                    }
                    break Ok(Arc::clone(session));
                }
            }
            if registration.releases != releases {
                debug!("daemon wait ended by release");
                break Err(BridgeError::SessionAborted);
            }
            if !waited {
                debug!("waiting for daemon");
                waited = true;
                registration.waiting += 1;
            }
            registration = wait(&self.readiness, registration);
        };
        if waited {
            registration.waiting -= 1;
        }
        result
    }

    pub(crate) fn mark_ready(&self, session: &Arc<Session>) {
        let mut registration = lock(&self.registration);
        if !registration.holds(session) {
            return;
        }
        if !registration.ready {
            info!(session = session.id(), "daemon ready");
        }
        registration.ready = true;
        self.readiness.notify_all();
    }

    pub(crate) fn deregister(&self, session: &Arc<Session>) {
        let mut registration = lock(&self.registration);
        if !registration.holds(session) {
            return;
        }
        registration.session = None;
        registration.ready = false;
        registration.releases += 1;
        self.readiness.notify_all();
    }

    pub(crate) fn free(&self) {
        self.available.store(true, Ordering::Release);
    }
}
