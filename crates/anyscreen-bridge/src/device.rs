//! The daemon's handle on the bridge: the character-device file operations.

use crate::Bridge;
use crate::error::{BridgeError, Result};
use crate::notify::AsyncNotify;
use crate::session::{Session, SessionStatus};
use anyscreen_proto::{Header, IoctlCode, HEADER_LEN};
use std::io;
use std::sync::Arc;
use tracing::{info, trace, warn};

/// An open instance of the device. Only one exists per [`Bridge`] at a time.
///
/// Dropping the handle releases the device like [`DeviceFile::release`].
pub struct DeviceFile {
    bridge: Arc<Bridge>,
    session: Arc<Session>,
    released: bool,
}

impl DeviceFile {
    pub(crate) fn new(bridge: Arc<Bridge>, session: Arc<Session>) -> Self {
        Self {
            bridge,
            session,
            released: false,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.session.id()
    }

    /// Header state: `buf` must be exactly [`HEADER_LEN`] bytes. Data state:
    /// streams the bound request's payload.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        self.session.read(buf)
    }

    /// Read and decode a header. Only valid in header state.
    pub fn read_header(&self) -> Result<Header> {
        let mut buf = [0u8; HEADER_LEN];
        self.session.read(&mut buf)?;
        Ok(Header::decode(buf)?)
    }

    /// Deliver response payload for the bound request.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        self.session.write(buf)
    }

    /// Raw ioctl entry point. Returns the operation's result value.
    pub fn ioctl(&self, code: u32, arg: usize) -> Result<usize> {
        let code = IoctlCode::try_from(code).map_err(|err| {
            warn!(%err, "invalid ioctl");
            BridgeError::ProtocolMisuse("unknown ioctl code")
        })?;
        if code.takes_argument() {
            trace!(?code, arg, "ioctl");
        } else {
            trace!(?code, "ioctl");
        }
        match code {
            IoctlCode::BlockDone => self.block_done()?,
            IoctlCode::SetInBlock => self.set_in_block(arg),
            IoctlCode::SetOutBlock1 => self.set_out_block1(arg),
            IoctlCode::SetOutBlock2 => self.set_out_block2(arg),
            IoctlCode::EnterPreload => self.enter_preload(),
            IoctlCode::SetBatchSize => self.set_batch_size(arg)?,
            IoctlCode::EnableImplicitAck => self.enable_implicit_ack(),
            IoctlCode::Ready => self.ready(),
            IoctlCode::HasPendingRequest => return Ok(usize::from(self.has_pending_request())),
            IoctlCode::DisablePoll => self.disable_poll(),
            IoctlCode::EnablePoll => self.enable_poll(),
        }
        Ok(0)
    }

    /// Mark the daemon as connected and release producers waiting for it.
    pub fn ready(&self) {
        self.bridge.mark_ready(&self.session);
    }

    /// Complete the bound request and wake its producer.
    pub fn block_done(&self) -> Result<()> {
        self.session.block_done()
    }

    pub fn set_in_block(&self, address: usize) {
        self.session.with_cache(|cache| cache.set_in_block(address));
    }

    pub fn set_out_block1(&self, address: usize) {
        self.session.with_cache(|cache| cache.set_out_block1(address));
    }

    pub fn set_out_block2(&self, address: usize) {
        self.session.with_cache(|cache| cache.set_out_block2(address));
    }

    pub fn enter_preload(&self) {
        self.session.with_cache(|cache| cache.enter_preload());
    }

    pub fn set_batch_size(&self, blocks: usize) -> Result<()> {
        self.session.with_cache(|cache| cache.set_batch_size(blocks))
    }

    pub fn enable_implicit_ack(&self) {
        self.session.with_cache(|cache| cache.enable_implicit_ack());
    }

    /// Bind the oldest request if none is bound and report whether one is.
    pub fn has_pending_request(&self) -> bool {
        self.session.has_pending_request()
    }

    pub fn disable_poll(&self) {
        self.session.disable_poll();
    }

    pub fn enable_poll(&self) {
        self.session.enable_poll();
    }

    /// Register (or with `None`, remove) the async notification sink.
    ///
    /// The sink is invoked with the session lock held and must not call back
    /// into the device.
    pub fn fasync(&self, notifier: Option<Arc<dyn AsyncNotify>>) {
        self.session.set_notifier(notifier);
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Abort the session, fail blocked producers, and free the device for the next open.
    pub fn release(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        info!(session = self.session.id(), "releasing device");
        self.bridge.deregister(&self.session);
        self.session.abort();
        self.bridge.free();
        info!(session = self.session.id(), "device released");
    }
}

impl Drop for DeviceFile {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl io::Read for &DeviceFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(DeviceFile::read(self, buf)?)
    }
}

impl io::Write for &DeviceFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(DeviceFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
