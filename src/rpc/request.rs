//! Owned client request payloads and the pool they are allocated from.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::utils::CurpError;

use bytes::{BufMut, Bytes, BytesMut};

use serde::{Deserialize, Serialize};

/// Asynchrony flag carried in the first byte of every client request.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[repr(u8)]
pub enum Asynchrony {
    /// Regular request; the node syncs before replying.
    Sync = 0,

    /// Unsynced request; the node may reply before replication.
    Async = 1,

    /// Resent unsynced request after a suspected node crash.
    Retry = 2,
}

impl TryFrom<u8> for Asynchrony {
    type Error = CurpError;

    fn try_from(b: u8) -> Result<Self, CurpError> {
        match b {
            0 => Ok(Asynchrony::Sync),
            1 => Ok(Asynchrony::Async),
            2 => Ok(Asynchrony::Retry),
            _ => Err(CurpError::msg(format!("invalid asynchrony byte {}", b))),
        }
    }
}

/// Exclusively owned request payload. Deliberately not `Clone`: whoever
/// holds it is responsible for handing it back to its `RequestPool`.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientRequest {
    /// Decoded form of the flag byte, kept in step with `data[0]`.
    flag: Asynchrony,

    /// Flag byte followed by the request body.
    data: BytesMut,
}

impl ClientRequest {
    /// Wraps a raw buffer, checking that it begins with a valid asynchrony
    /// flag.
    pub fn from_bytes(data: BytesMut) -> Result<Self, CurpError> {
        match data.first() {
            Some(&b) => {
                let flag = Asynchrony::try_from(b)?;
                Ok(ClientRequest { flag, data })
            }
            None => Err(CurpError::msg("empty client request buffer")),
        }
    }

    /// Gets the asynchrony flag of the request.
    pub fn asynchrony(&self) -> Asynchrony {
        self.flag
    }

    /// Flags the request as a retry so that the receiving node can process
    /// it during recovery and detect duplicates.
    pub fn mark_retry(&mut self) {
        self.flag = Asynchrony::Retry;
        self.data[0] = Asynchrony::Retry as u8;
    }

    /// Gets the request body following the flag byte.
    pub fn body(&self) -> &[u8] {
        &self.data[1..]
    }

    /// Total length on the wire, flag byte included.
    pub fn wire_len(&self) -> usize {
        self.data.len()
    }

    /// Copies the payload into an immutable buffer for sending; ownership of
    /// `self` stays with the caller.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Consumes the handle, giving back the underlying buffer.
    pub fn into_inner(self) -> BytesMut {
        self.data
    }
}

/// Allocator collaborator that reclaims request payloads.
pub trait RequestPool: Send + Sync {
    /// Takes back a payload. Called exactly once per owned request.
    fn free(&self, req: ClientRequest);
}

/// Simple recycling `RequestPool` keeping a free-list of buffers.
#[derive(Debug, Default)]
pub struct BufferPool {
    /// Recycled buffers ready for reuse.
    free_list: Mutex<Vec<BytesMut>>,

    /// Number of requests handed out so far.
    allocated: AtomicUsize,

    /// Number of requests given back so far.
    freed: AtomicUsize,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Default::default()
    }

    /// Allocates a request with the given flag and body.
    pub fn alloc(&self, asynchrony: Asynchrony, body: &[u8]) -> ClientRequest {
        let mut data = self
            .free_list
            .lock()
            .ok()
            .and_then(|mut list| list.pop())
            .unwrap_or_default();
        data.reserve(1 + body.len());
        data.put_u8(asynchrony as u8);
        data.put_slice(body);

        self.allocated.fetch_add(1, Ordering::AcqRel);
        ClientRequest {
            flag: asynchrony,
            data,
        }
    }

    /// Number of requests allocated and not yet freed.
    pub fn outstanding(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
            - self.freed.load(Ordering::Acquire)
    }

    /// Number of requests freed so far.
    pub fn num_freed(&self) -> usize {
        self.freed.load(Ordering::Acquire)
    }
}

impl RequestPool for BufferPool {
    fn free(&self, req: ClientRequest) {
        let mut data = req.into_inner();
        data.clear();
        if let Ok(mut list) = self.free_list.lock() {
            list.push(data);
        }
        self.freed.fetch_add(1, Ordering::AcqRel);
    }
}
