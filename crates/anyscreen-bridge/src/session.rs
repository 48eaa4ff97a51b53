//! State owned by one open of the device, shared between the daemon's file
//! handle and producer calls.

use crate::batch::{BatchCache, PreloadWindow};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::metrics;
use crate::notify::AsyncNotify;
use crate::queue::{Completion, Request, RequestQueue};
use anyscreen_proto::{Header, HEADER_LEN};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Which part of the current request the next device read returns.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessagePart {
    #[default]
    Header,
    Data,
}

impl MessagePart {
    fn as_str(self) -> &'static str {
        match self {
            MessagePart::Header => "header",
            MessagePart::Data => "data",
        }
    }
}

impl fmt::Display for MessagePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a session, for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub id: u64,
    pub queued: usize,
    pub bound: Option<Header>,
    pub part: MessagePart,
    pub window: PreloadWindow,
    pub batch_valid: bool,
    pub batch_size: usize,
    pub block_pointer: usize,
    pub notifications_armed: bool,
    pub aborted: bool,
    /// Producer calls currently inside the session, queued or waiting for a slot.
    pub in_flight: usize,
}

pub(crate) struct SessionState {
    pub(crate) queue: RequestQueue,
    pub(crate) cache: BatchCache,
    bound: bool,
    part: MessagePart,
    notifier: Option<Arc<dyn AsyncNotify>>,
    notifications_suppressed: bool,
    pub(crate) aborted: bool,
    in_flight: usize,
    next_seq: u64,
    completions: HashMap<u64, Completion>,
}

impl SessionState {
    fn new(config: &BridgeConfig) -> Self {
        Self {
            queue: RequestQueue::new(config.queue_capacity, config.max_chunk),
            cache: BatchCache::new(config.block_size, config.max_blocks),
            bound: false,
            part: MessagePart::Header,
            notifier: None,
            notifications_suppressed: false,
            aborted: false,
            in_flight: 0,
            next_seq: 0,
            completions: HashMap::new(),
        }
    }

    /// Bind the oldest request as current if nothing is bound yet.
    fn bind_front(&mut self) {
        if !self.bound && !self.queue.is_empty() {
            self.bound = true;
            if let Some(req) = self.queue.front() {
                trace!(seq = req.seq(), kind = %req.kind(), "bound request");
            }
        }
    }

    fn current(&self) -> Option<&Request> {
        if self.bound { self.queue.front() } else { None }
    }

    fn current_mut(&mut self) -> Option<&mut Request> {
        if self.bound {
            self.queue.front_mut()
        } else {
            None
        }
    }

    fn has_work(&self) -> bool {
        self.bound || !self.queue.is_empty()
    }

    fn signal(&self) {
        if let Some(notifier) = &self.notifier {
            notifier.notify();
        }
    }

    /// Edge-triggered notification: only the first queued request after re-arming signals.
    pub(crate) fn activate(&mut self) {
        if !self.notifications_suppressed {
            debug!("signalling pending requests");
            self.notifications_suppressed = true;
            self.signal();
        }
    }
}

pub(crate) struct Session {
    id: u64,
    pub(crate) config: BridgeConfig,
    pub(crate) state: Mutex<SessionState>,
    /// Signalled when a queue slot frees up.
    pub(crate) space: Condvar,
    /// Signalled when a request completes.
    pub(crate) completed: Condvar,
    /// Signalled when the last in-flight producer leaves an aborted session.
    idle: Condvar,
    /// Held by reads served from the preload batch so one refill is in flight at a time.
    pub(crate) producer: Mutex<()>,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

/// Marks a producer call as in flight until dropped.
pub(crate) struct InFlight<'a> {
    session: &'a Session,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.session.state);
        state.in_flight -= 1;
        if state.in_flight == 0 && state.aborted {
            self.session.idle.notify_all();
        }
    }
}

impl Session {
    pub(crate) fn new(id: u64, config: BridgeConfig) -> Self {
        Self {
            id,
            config,
            state: Mutex::new(SessionState::new(&config)),
            space: Condvar::new(),
            completed: Condvar::new(),
            idle: Condvar::new(),
            producer: Mutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Register a producer call; refused once the session is aborted.
    pub(crate) fn enter(&self) -> Result<InFlight<'_>> {
        let mut state = lock(&self.state);
        if state.aborted {
            debug!(session = self.id, "producer refused by aborted session");
            return Err(BridgeError::SessionAborted);
        }
        state.in_flight += 1;
        Ok(InFlight { session: self })
    }

    /// Wait until the request `seq` has been signalled done by the daemon.
    pub(crate) fn wait_completion(&self, seq: u64) -> Result<Completion> {
        let mut state = lock(&self.state);
        loop {
            if let Some(completion) = state.completions.remove(&seq) {
                return Ok(completion);
            }
            if state.aborted {
                debug!(session = self.id, seq, "completion wait ended by abort");
                return Err(BridgeError::SessionAborted);
            }
            state = wait(&self.completed, state);
        }
    }

    /// Claim a queue slot, waiting for space, and fill it while the lock is held.
    pub(crate) fn enqueue<F>(&self, fill: F) -> Result<u64>
    where
        F: FnOnce(&mut Request, u64, &mut BatchCache),
    {
        let mut guard = lock(&self.state);
        loop {
            if guard.aborted {
                debug!(session = self.id, "queue wait ended by abort");
                return Err(BridgeError::SessionAborted);
            }
            if !guard.queue.is_full() {
                break;
            }
            trace!(session = self.id, queued = guard.queue.size(), "queue full, waiting for space");
            guard = wait(&self.space, guard);
        }
        let state = &mut *guard;
        let seq = state.next_seq;
        let req = state.queue.try_insert().ok_or(BridgeError::QueueFull)?;
        fill(req, seq, &mut state.cache);
        state.next_seq += 1;
        trace!(seq, queued = state.queue.size(), "request queued");
        metrics::record_queue_depth(state.queue.size());
        state.activate();
        Ok(seq)
    }

    pub(crate) fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut state = lock(&self.state);
        let part = state.part;
        match part {
            MessagePart::Header => {
                state.bind_front();
                if buf.len() != HEADER_LEN {
                    warn!(len = buf.len(), expected = HEADER_LEN, "illegal header read size");
                    return Err(BridgeError::ProtocolMisuse("header read must be exactly one header"));
                }
                let header = state.current().map(Request::header).unwrap_or(Header::NONE);
                buf.copy_from_slice(&header.encode());
                if state.bound {
                    state.part = MessagePart::Data;
                }
                trace!(kind = %header.kind, address = header.address, len = header.length, "read header");
                Ok(HEADER_LEN)
            }
            MessagePart::Data => {
                let req = state
                    .current_mut()
                    .ok_or(BridgeError::ProtocolMisuse("data read without a bound request"))?;
                let count = req.read_payload(buf);
                trace!(seq = req.seq(), count, remaining = req.remaining(), "read data");
                if req.is_complete() {
                    trace!(seq = req.seq(), "request payload drained");
                }
                Ok(count)
            }
        }
    }

    pub(crate) fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut state = lock(&self.state);
        let req = state
            .current_mut()
            .ok_or(BridgeError::ProtocolMisuse("write without a bound request"))?;
        let count = req.write_payload(buf);
        trace!(seq = req.seq(), count, remaining = req.remaining(), "write data");
        Ok(count)
    }

    pub(crate) fn block_done(&self) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.bound {
            warn!(session = self.id, "block done without a bound request");
            return Err(BridgeError::ProtocolMisuse("block done without a bound request"));
        }
        let completion = state
            .queue
            .remove_front()
            .ok_or(BridgeError::ProtocolMisuse("block done on an empty queue"))?;
        if completion.short_by > 0 {
            debug!(
                seq = completion.seq,
                kind = %completion.kind,
                short_by = completion.short_by,
                "request completed before its payload was fully transferred"
            );
        }
        trace!(seq = completion.seq, queued = state.queue.size(), "block done");
        metrics::record_queue_depth(state.queue.size());
        state.bound = false;
        state.part = MessagePart::Header;
        state.completions.insert(completion.seq, completion);
        drop(state);
        self.completed.notify_all();
        self.space.notify_all();
        Ok(())
    }

    pub(crate) fn has_pending_request(&self) -> bool {
        let mut state = lock(&self.state);
        if !state.bound && !state.queue.is_empty() {
            state.bind_front();
            state.part = MessagePart::Header;
        }
        state.bound
    }

    /// The daemon stops polling: re-signal if work is pending, otherwise re-arm.
    pub(crate) fn disable_poll(&self) {
        let mut state = lock(&self.state);
        if state.has_work() {
            debug!("poll disabled with work pending, signalling");
            state.notifications_suppressed = true;
            state.signal();
        } else {
            debug!("poll disabled, notifications re-armed");
            state.notifications_suppressed = false;
        }
    }

    /// The daemon polls on its own; suppress notifications until it stops.
    pub(crate) fn enable_poll(&self) {
        debug!("poll enabled, notifications suppressed");
        lock(&self.state).notifications_suppressed = true;
    }

    pub(crate) fn set_notifier(&self, notifier: Option<Arc<dyn AsyncNotify>>) {
        debug!(registered = notifier.is_some(), "async notification registration");
        lock(&self.state).notifier = notifier;
    }

    pub(crate) fn with_cache<R>(&self, f: impl FnOnce(&mut BatchCache) -> R) -> R {
        f(&mut lock(&self.state).cache)
    }

    /// Fail every blocked producer and wait for in-flight calls to leave.
    pub(crate) fn abort(&self) {
        let mut state = lock(&self.state);
        if !state.aborted {
            state.aborted = true;
            let pending = state.queue.size();
            debug!(session = self.id, pending, in_flight = state.in_flight, "aborting session");
            metrics::session_aborted(pending);
        }
        self.space.notify_all();
        self.completed.notify_all();
        while state.in_flight > 0 {
            state = wait(&self.idle, state);
        }
        debug!(session = self.id, "session drained");
    }

    pub(crate) fn status(&self) -> SessionStatus {
        let state = lock(&self.state);
        SessionStatus {
            id: self.id,
            queued: state.queue.size(),
            bound: state.current().map(Request::header),
            part: state.part,
            window: state.cache.window(),
            batch_valid: state.cache.is_valid(),
            batch_size: state.cache.batch_size(),
            block_pointer: state.cache.block_pointer(),
            notifications_armed: !state.notifications_suppressed,
            aborted: state.aborted,
            in_flight: state.in_flight,
        }
    }
}
