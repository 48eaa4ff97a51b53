//! Handoff from contexts that must not block to a thread that may.
//!
//! The gadget's transfer-complete path cannot wait on the daemon, so it posts
//! the access here and gets a [`TransferTicket`] back. One worker thread
//! submits posted transfers to the [`Bridge`] in order.

use crate::Bridge;
use crate::error::{BridgeError, Result};
use crate::producer::TransferBuf;
use anyscreen_proto::RequestType;
use async_channel::{Receiver, Sender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, trace, warn, Level};

/// One host block access owned by the worker while it is serviced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transfer {
    pub address: u64,
    pub kind: RequestType,
    /// Write payload, or for reads a buffer sized to the access that comes back filled.
    pub data: Vec<u8>,
}

impl Transfer {
    pub fn read(address: u64, len: usize) -> Self {
        Self {
            address,
            kind: RequestType::Read,
            data: vec![0; len],
        }
    }

    pub fn write(address: u64, data: Vec<u8>) -> Self {
        Self {
            address,
            kind: RequestType::Write,
            data,
        }
    }
}

type Reply = Result<Transfer>;

struct Job {
    transfer: Transfer,
    reply: Sender<Reply>,
}

/// Completion handle for a posted transfer.
pub struct TransferTicket {
    rx: Receiver<Reply>,
}

impl TransferTicket {
    /// Block until the transfer finished. Read data is in the returned transfer.
    pub fn wait(self) -> Result<Transfer> {
        self.rx
            .recv_blocking()
            .map_err(|_| BridgeError::WorkerStopped)?
    }

    pub async fn completed(self) -> Result<Transfer> {
        self.rx.recv().await.map_err(|_| BridgeError::WorkerStopped)?
    }

    /// Non-blocking poll; `None` while the transfer is still being serviced.
    pub fn try_result(&self) -> Option<Result<Transfer>> {
        match self.rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(BridgeError::WorkerStopped)),
        }
    }
}

pub struct TransferWorker {
    tx: Sender<Job>,
    thread: Option<JoinHandle<()>>,
}

impl TransferWorker {
    /// Start the worker thread with room for `capacity` posted transfers.
    pub fn spawn(bridge: Arc<Bridge>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(BridgeError::Config("transfer worker capacity must be non-zero".into()));
        }
        let (tx, rx) = async_channel::bounded::<Job>(capacity);
        let span = tracing::span!(Level::INFO, "anyscreen-transfer");
        let thread = std::thread::Builder::new()
            .name("anyscreen-transfer".into())
            .spawn(move || {
                let _enter = span.enter();
                info!("transfer worker starting");
                while let Ok(Job { transfer, reply }) = rx.recv_blocking() {
                    let result = service(&bridge, transfer);
                    if let Err(err) = reply.send_blocking(result) {
                        trace!("transfer reply receiver dropped: {}", err);
                    }
                }
                info!("transfer worker shutting down");
            })?;
        Ok(Self {
            tx,
            thread: Some(thread),
        })
    }

    /// Queue a transfer without blocking.
    pub fn post(&self, transfer: Transfer) -> Result<TransferTicket> {
        let (reply, rx) = async_channel::bounded(1);
        match self.tx.try_send(Job { transfer, reply }) {
            Ok(()) => Ok(TransferTicket { rx }),
            Err(TrySendError::Full(_)) => {
                debug!("transfer worker backlog full");
                Err(BridgeError::WorkerBusy)
            }
            Err(TrySendError::Closed(_)) => Err(BridgeError::WorkerStopped),
        }
    }

    /// Transfers posted but not yet picked up by the worker thread.
    pub fn backlog(&self) -> usize {
        self.tx.len()
    }

    /// Stop accepting transfers and wait for the thread to finish the ones already posted.
    pub fn shutdown(mut self) {
        self.tx.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("transfer worker panicked");
            }
        }
    }
}

impl Drop for TransferWorker {
    fn drop(&mut self) {
        self.tx.close();
    }
}

fn service(bridge: &Bridge, mut transfer: Transfer) -> Reply {
    let buffer = match transfer.kind {
        RequestType::Read => TransferBuf::Read(&mut transfer.data),
        RequestType::Write => TransferBuf::Write(&transfer.data),
        RequestType::None => return Err(BridgeError::InvalidTransfer("request type none")),
    };
    bridge.submit_transfer(transfer.address, buffer)?;
    Ok(transfer)
}
