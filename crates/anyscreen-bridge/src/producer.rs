//! Producer side: turns host block accesses into requests and waits for the
//! daemon to service them.

use crate::error::{BridgeError, Result};
use crate::metrics;
use crate::session::{lock, Session};
use anyscreen_proto::RequestType;
use std::time::Instant;
use tracing::{debug, trace};

/// Caller buffer for one host block access; the variant carries the direction.
#[derive(Debug)]
pub enum TransferBuf<'a> {
    /// Host read: the daemon's data is copied into the buffer.
    Read(&'a mut [u8]),
    /// Host write: the buffer is handed to the daemon.
    Write(&'a [u8]),
}

impl TransferBuf<'_> {
    pub fn kind(&self) -> RequestType {
        match self {
            TransferBuf::Read(_) => RequestType::Read,
            TransferBuf::Write(_) => RequestType::Write,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TransferBuf::Read(buf) => buf.len(),
            TransferBuf::Write(buf) => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Session {
    /// Service one host access end to end. Blocks until the daemon has handled it.
    pub(crate) fn submit(&self, address: usize, buffer: TransferBuf<'_>) -> Result<()> {
        let _in_flight = self.enter()?;
        let kind = buffer.kind();
        let len = buffer.len();
        let started = Instant::now();
        trace!(session = self.id(), %kind, address, len, "transfer");

        match buffer {
            TransferBuf::Write(data) => self.submit_write(address, data)?,
            TransferBuf::Read(out) => {
                let refill = lock(&self.producer);
                let cached = self.with_cache(|cache| {
                    let serves = cache.serves(address);
                    if serves {
                        cache.observe_read(address);
                    }
                    serves
                });
                if cached {
                    self.read_cached(address, out)?;
                } else {
                    drop(refill);
                    self.read_direct(address, out)?;
                }
            }
        }

        metrics::observe_transfer(kind, len, started.elapsed());
        Ok(())
    }

    fn submit_write(&self, mut address: usize, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(self.config.max_chunk) {
            let queued = Instant::now();
            let seq = self.enqueue(|req, seq, cache| {
                cache.observe_write(address, chunk);
                req.stage_write(seq, address, chunk);
            })?;
            self.wait_completion(seq)?;
            metrics::observe_request(RequestType::Write, chunk.len(), queued.elapsed());
            address += chunk.len() / self.config.block_size;
        }
        Ok(())
    }

    fn read_direct(&self, address: usize, out: &mut [u8]) -> Result<()> {
        let queued = Instant::now();
        let response = vec![0u8; out.len()];
        let seq = self.enqueue(move |req, seq, _| req.prepare_read(seq, address, response))?;
        let completion = self.wait_completion(seq)?;
        let response = completion
            .response
            .ok_or(BridgeError::ProtocolMisuse("read completed without a response buffer"))?;
        out.copy_from_slice(&response[..out.len()]);
        metrics::observe_request(RequestType::Read, out.len(), queued.elapsed());
        Ok(())
    }

    /// Serve a read from the preload batch, refilling it first if needed.
    /// Callers hold `producer` so one refill is in flight at a time.
    fn read_cached(&self, address: usize, out: &mut [u8]) -> Result<()> {
        if !self.with_cache(|cache| cache.is_valid()) {
            let queued = Instant::now();
            let seq = self.enqueue(|req, seq, cache| {
                req.prepare_read(seq, address, cache.begin_refill());
            })?;
            debug!(seq, address, bytes = self.config.batch_bytes(), "refilling batch");
            let completion = self.wait_completion(seq)?;
            let storage = completion.response.unwrap_or_default();
            metrics::observe_request(RequestType::Read, storage.len(), queued.elapsed());
            self.with_cache(|cache| cache.finish_refill(storage));
        }

        let exhausted = {
            let mut state = lock(&self.state);
            if state.aborted {
                debug!(session = self.id(), address, "cached read ended by abort");
                return Err(BridgeError::SessionAborted);
            }
            state.cache.copy_out(out)
        };
        if exhausted {
            trace!(address, "batch exhausted");
        }
        Ok(())
    }
}
