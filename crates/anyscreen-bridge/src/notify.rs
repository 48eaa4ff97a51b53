//! Asynchronous "work pending" notification towards the daemon (the SIGIO analogue).

use async_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

/// Sink registered through `DeviceFile::fasync`.
pub trait AsyncNotify: Send + Sync {
    /// Signal that requests are pending. Must not block.
    fn notify(&self);
}

impl<F> AsyncNotify for F
where
    F: Fn() + Send + Sync,
{
    fn notify(&self) {
        self()
    }
}

/// Coalescing notification channel: at most one signal is buffered.
#[derive(Clone)]
pub struct SignalChannel {
    tx: Sender<()>,
}

impl SignalChannel {
    /// Create a notifier and the receiver the daemon waits on.
    pub fn channel() -> (Self, Receiver<()>) {
        let (tx, rx) = async_channel::bounded(1);
        (Self { tx }, rx)
    }
}

impl AsyncNotify for SignalChannel {
    fn notify(&self) {
        match self.tx.try_send(()) {
            Ok(()) => {}
            Err(TrySendError::Full(())) => trace!("signal already pending"),
            Err(TrySendError::Closed(())) => trace!("signal receiver dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn signals_coalesce() {
        let (notifier, rx) = SignalChannel::channel();
        notifier.notify();
        notifier.notify();
        assert_eq!(rx.len(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closures_are_notifiers() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let notifier: Arc<dyn AsyncNotify> = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        notifier.notify();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
