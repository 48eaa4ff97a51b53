//! Fixed-capacity ring of in-flight requests.
//!
//! The ring is only ever touched while the session lock is held; it does no
//! synchronization of its own.

use anyscreen_proto::{Header, RequestType};
use std::cmp;

/// Where a request's payload bytes live.
#[derive(Debug)]
enum Payload {
    /// The slot's private staging buffer.
    Staging,
    /// A buffer owned by the request that is handed back to the producer on completion.
    Response(Vec<u8>),
}

/// One in-flight transfer descriptor.
#[derive(Debug)]
pub struct Request {
    seq: u64,
    kind: RequestType,
    address: usize,
    length: usize,
    cursor: usize,
    payload: Payload,
    staging: Vec<u8>,
}

impl Request {
    fn with_staging(staging_len: usize) -> Self {
        Self {
            seq: 0,
            kind: RequestType::None,
            address: 0,
            length: 0,
            cursor: 0,
            payload: Payload::Staging,
            staging: Vec::with_capacity(staging_len),
        }
    }

    /// Fill the request with a write chunk copied into the slot's staging buffer.
    pub fn stage_write(&mut self, seq: u64, address: usize, data: &[u8]) {
        self.staging.clear();
        self.staging.extend_from_slice(data);
        self.seq = seq;
        self.kind = RequestType::Write;
        self.address = address;
        self.length = data.len();
        self.cursor = 0;
        self.payload = Payload::Staging;
    }

    /// Turn the request into a read whose response lands in `buffer`.
    pub fn prepare_read(&mut self, seq: u64, address: usize, buffer: Vec<u8>) {
        self.seq = seq;
        self.kind = RequestType::Read;
        self.address = address;
        self.length = buffer.len();
        self.cursor = 0;
        self.payload = Payload::Response(buffer);
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn kind(&self) -> RequestType {
        self.kind
    }

    /// Bytes still to be transferred.
    pub fn remaining(&self) -> usize {
        self.length
    }

    pub fn is_complete(&self) -> bool {
        self.length == 0
    }

    pub fn header(&self) -> Header {
        Header::new(self.kind, self.address, self.length)
    }

    /// Copy payload bytes out to the daemon, advancing the cursor.
    pub fn read_payload(&mut self, out: &mut [u8]) -> usize {
        let count = cmp::min(out.len(), self.length);
        let start = self.cursor;
        out[..count].copy_from_slice(&self.buffer()[start..start + count]);
        self.advance(count);
        count
    }

    /// Copy daemon bytes into the payload, advancing the cursor.
    pub fn write_payload(&mut self, data: &[u8]) -> usize {
        let count = cmp::min(data.len(), self.length);
        let start = self.cursor;
        self.buffer_mut()[start..start + count].copy_from_slice(&data[..count]);
        self.advance(count);
        count
    }

    fn advance(&mut self, count: usize) {
        self.cursor += count;
        self.length -= count;
    }

    fn buffer(&self) -> &[u8] {
        match &self.payload {
            Payload::Staging => &self.staging,
            Payload::Response(buf) => buf,
        }
    }

    fn buffer_mut(&mut self) -> &mut [u8] {
        match &mut self.payload {
            Payload::Staging => &mut self.staging,
            Payload::Response(buf) => buf,
        }
    }

    fn finish(&mut self) -> Completion {
        let response = match std::mem::replace(&mut self.payload, Payload::Staging) {
            Payload::Response(buf) => Some(buf),
            Payload::Staging => None,
        };
        let completion = Completion {
            seq: self.seq,
            kind: self.kind,
            short_by: self.length,
            response,
        };
        self.kind = RequestType::None;
        self.length = 0;
        self.cursor = 0;
        completion
    }
}

/// What the producer gets back once the daemon signals a request done.
#[derive(Debug)]
pub struct Completion {
    pub seq: u64,
    pub kind: RequestType,
    /// Bytes the daemon never transferred before signalling done.
    pub short_by: usize,
    pub response: Option<Vec<u8>>,
}

/// Ring buffer of request slots.
///
/// `last == None` encodes an empty ring, so `first == last` unambiguously means full.
#[derive(Debug)]
pub struct RequestQueue {
    slots: Vec<Request>,
    first: usize,
    last: Option<usize>,
}

impl RequestQueue {
    /// Allocate `capacity` slots, each with a staging buffer of `staging_len` bytes.
    pub fn new(capacity: usize, staging_len: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Request::with_staging(staging_len))
            .collect();
        Self {
            slots,
            first: 0,
            last: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn size(&self) -> usize {
        match self.last {
            None => 0,
            Some(last) if last == self.first => self.capacity(),
            Some(last) if last > self.first => last - self.first,
            Some(last) => last + self.capacity() - self.first,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.size() >= self.capacity()
    }

    /// Claim the next free slot, or `None` when the ring is full.
    pub fn try_insert(&mut self) -> Option<&mut Request> {
        if self.is_full() {
            return None;
        }
        let index = self.last.unwrap_or(self.first);
        self.last = Some((index + 1) % self.capacity());
        Some(&mut self.slots[index])
    }

    /// Oldest outstanding request.
    pub fn front(&self) -> Option<&Request> {
        (!self.is_empty()).then(|| &self.slots[self.first])
    }

    pub fn front_mut(&mut self) -> Option<&mut Request> {
        if self.is_empty() {
            return None;
        }
        Some(&mut self.slots[self.first])
    }

    /// Release the oldest slot, returning what its producer is waiting for.
    pub fn remove_front(&mut self) -> Option<Completion> {
        if self.is_empty() {
            return None;
        }
        let completion = self.slots[self.first].finish();
        self.first = (self.first + 1) % self.capacity();
        if Some(self.first) == self.last {
            self.last = None;
        }
        Some(completion)
    }
}
