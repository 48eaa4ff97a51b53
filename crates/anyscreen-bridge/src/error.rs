use anyscreen_proto::ProtoError;

/// Errors returned by the bridge to producers and to the daemon's file handle.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The request queue has no free slot. Producers wait instead of surfacing this.
    #[error("request queue full")]
    QueueFull,
    /// The daemon released the device while the call was in flight.
    #[error("session aborted")]
    SessionAborted,
    /// Another daemon already holds the device open.
    #[error("device busy")]
    Busy,
    /// The daemon used the device outside of the request protocol.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(&'static str),
    /// Batch size outside `1..=max`.
    #[error("invalid batch size {requested}, expected 1..={max}")]
    InvalidBatchSize { requested: usize, max: usize },
    /// The producer asked for a transfer the bridge cannot express.
    #[error("invalid transfer: {0}")]
    InvalidTransfer(&'static str),
    /// The transfer worker's handoff channel is full.
    #[error("transfer worker busy")]
    WorkerBusy,
    /// The transfer worker has shut down.
    #[error("transfer worker stopped")]
    WorkerStopped,
    #[error("protocol error: {0}")]
    Proto(#[from] ProtoError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// errno reported through the character-device surface.
    pub fn errno(&self) -> i32 {
        match self {
            BridgeError::QueueFull | BridgeError::WorkerBusy => libc::EAGAIN,
            BridgeError::Busy => libc::EBUSY,
            BridgeError::SessionAborted
            | BridgeError::ProtocolMisuse(_)
            | BridgeError::Proto(_) => libc::EIO,
            BridgeError::InvalidBatchSize { .. }
            | BridgeError::InvalidTransfer(_)
            | BridgeError::Config(_) => libc::EINVAL,
            BridgeError::WorkerStopped => libc::ESHUTDOWN,
            BridgeError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Whether the error ends the producer call for good rather than being waited out.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BridgeError::QueueFull | BridgeError::WorkerBusy)
    }
}

impl From<BridgeError> for std::io::Error {
    fn from(err: BridgeError) -> Self {
        let errno = err.errno();
        std::io::Error::new(
            std::io::Error::from_raw_os_error(errno).kind(),
            err,
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
