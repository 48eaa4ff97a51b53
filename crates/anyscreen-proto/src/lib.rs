#![no_std]

use core::{fmt, mem::size_of};

/// Name under which the bridge's character device is registered.
pub const DEVICE_NAME: &str = "ccanyscrn";
/// Number of bytes in one header word (a native `unsigned long`).
pub const WORD_LEN: usize = size_of::<usize>();
/// Number of bytes in an encoded [`Header`].
pub const HEADER_LEN: usize = 3 * WORD_LEN;
/// Block size used for address arithmetic unless configured otherwise.
pub const DEFAULT_BLOCK_SIZE: usize = 512;
/// Number of blocks held by the batch cache unless configured otherwise.
pub const DEFAULT_MAX_BLOCKS: usize = 128;
/// Number of request slots in the queue unless configured otherwise.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;
/// Largest write chunk staged into a single request.
pub const DEFAULT_MAX_CHUNK: usize = 4096;
/// Leading bytes of a cache read that, when all zero, mark an exhausted batch.
pub const EMPTY_BATCH_SENTINEL_LEN: usize = 4;

/// Packet flag: data is acknowledged, the next batch may be produced.
pub const PACKET_ACK: u8 = 0x80;
/// Packet type: the previous batch must be produced again.
pub const PACKET_NACK: u8 = 4;

/// Errors surfaced while decoding protocol values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// Header carried an unknown request type.
    InvalidRequestType(usize),
    /// ioctl code is not part of the protocol.
    InvalidIoctl(u32),
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidRequestType(kind) => write!(f, "invalid request type {kind}"),
            ProtoError::InvalidIoctl(code) => write!(f, "invalid ioctl code {code:#x}"),
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

impl core::error::Error for ProtoError {}

/// Result alias for protocol parsing operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Direction of a host block access.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum RequestType {
    /// No request is bound; only ever seen in headers.
    #[default]
    None = 0,
    /// Host reads from the virtual media; the daemon supplies the data.
    Read = 1,
    /// Host writes to the virtual media; the daemon consumes the data.
    Write = 2,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::None => "none",
            RequestType::Read => "read",
            RequestType::Write => "write",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<usize> for RequestType {
    type Error = ProtoError;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            other => Err(ProtoError::InvalidRequestType(other)),
        }
    }
}

impl From<RequestType> for usize {
    fn from(kind: RequestType) -> Self {
        kind as usize
    }
}

/// Fixed-size header returned by a header-state read of the device.
///
/// Layout is three native-endian words: `[type, address, length]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub kind: RequestType,
    pub address: usize,
    pub length: usize,
}

impl Header {
    /// Header reported when no request is bound.
    pub const NONE: Header = Header::new(RequestType::None, 0, 0);

    pub const fn new(kind: RequestType, address: usize, length: usize) -> Self {
        Self {
            kind,
            address,
            length,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == RequestType::None
    }

    pub fn encode(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..WORD_LEN].copy_from_slice(&usize::from(self.kind).to_ne_bytes());
        buf[WORD_LEN..2 * WORD_LEN].copy_from_slice(&self.address.to_ne_bytes());
        buf[2 * WORD_LEN..].copy_from_slice(&self.length.to_ne_bytes());
        buf
    }

    pub fn decode(bytes: [u8; HEADER_LEN]) -> Result<Self> {
        let kind = RequestType::try_from(read_word(&bytes, 0))?;
        let address = read_word(&bytes, 1);
        let length = read_word(&bytes, 2);
        if kind == RequestType::None && (address != 0 || length != 0) {
            return Err(ProtoError::InvalidValue("empty header must be zeroed"));
        }
        Ok(Self {
            kind,
            address,
            length,
        })
    }
}

impl TryFrom<&[u8]> for Header {
    type Error = ProtoError;

    fn try_from(value: &[u8]) -> Result<Self> {
        if value.len() != HEADER_LEN {
            return Err(ProtoError::InvalidLength {
                expected: HEADER_LEN,
                actual: value.len(),
            });
        }
        let mut buf = [0u8; HEADER_LEN];
        buf.copy_from_slice(value);
        Self::decode(buf)
    }
}

fn read_word(bytes: &[u8; HEADER_LEN], index: usize) -> usize {
    let mut word = [0u8; WORD_LEN];
    word.copy_from_slice(&bytes[index * WORD_LEN..(index + 1) * WORD_LEN]);
    usize::from_ne_bytes(word)
}

/// ioctl operations understood by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum IoctlCode {
    BlockDone = 0xad1,
    SetInBlock = 0xad2,
    SetOutBlock1 = 0xad3,
    SetOutBlock2 = 0xad4,
    EnterPreload = 0xad5,
    SetBatchSize = 0xad6,
    EnableImplicitAck = 0xad8,
    Ready = 0xad9,
    HasPendingRequest = 0xada,
    DisablePoll = 0xadb,
    EnablePoll = 0xadc,
}

impl IoctlCode {
    /// Whether the operation consumes the ioctl argument.
    pub fn takes_argument(self) -> bool {
        matches!(
            self,
            IoctlCode::SetInBlock
                | IoctlCode::SetOutBlock1
                | IoctlCode::SetOutBlock2
                | IoctlCode::SetBatchSize
        )
    }
}

impl TryFrom<u32> for IoctlCode {
    type Error = ProtoError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0xad1 => Ok(Self::BlockDone),
            0xad2 => Ok(Self::SetInBlock),
            0xad3 => Ok(Self::SetOutBlock1),
            0xad4 => Ok(Self::SetOutBlock2),
            0xad5 => Ok(Self::EnterPreload),
            0xad6 => Ok(Self::SetBatchSize),
            0xad8 => Ok(Self::EnableImplicitAck),
            0xad9 => Ok(Self::Ready),
            0xada => Ok(Self::HasPendingRequest),
            0xadb => Ok(Self::DisablePoll),
            0xadc => Ok(Self::EnablePoll),
            other => Err(ProtoError::InvalidIoctl(other)),
        }
    }
}

impl From<IoctlCode> for u32 {
    fn from(code: IoctlCode) -> Self {
        code as u32
    }
}

/// Packet types carried in the first byte of host writes to the in-block region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    NoData = 0,
    DataPacket = 1,
    Mark = 2,
    Init = 3,
    Nack = PACKET_NACK,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value & !PACKET_ACK {
            0 => Ok(Self::NoData),
            1 => Ok(Self::DataPacket),
            2 => Ok(Self::Mark),
            3 => Ok(Self::Init),
            PACKET_NACK => Ok(Self::Nack),
            _ => Err(ProtoError::InvalidValue("packet type")),
        }
    }
}

/// Acknowledgement carried by a host write, as seen by the batch cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acknowledgement {
    /// The current batch was consumed; fetch the next one.
    Ack,
    /// The current batch was rejected; fetch it again.
    Nack,
}

impl Acknowledgement {
    /// Classify the leading byte of a write chunk.
    ///
    /// The ACK bit wins over the packet type; NACK must match exactly.
    pub fn from_packet_byte(byte: u8) -> Option<Self> {
        if byte & PACKET_ACK != 0 {
            Some(Self::Ack)
        } else if byte == PACKET_NACK {
            Some(Self::Nack)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Acknowledgement::Ack => "ack",
            Acknowledgement::Nack => "nack",
        }
    }
}

/// Whether a block copied out of the batch cache marks the batch as exhausted.
pub fn is_empty_batch_sentinel(block: &[u8]) -> bool {
    block.len() >= EMPTY_BATCH_SENTINEL_LEN
        && block[..EMPTY_BATCH_SENTINEL_LEN].iter().all(|&b| b == 0)
}
