//! Channel Access frame header and parsing.

use bytes::{Bytes, BytesMut};
use zerocopy::byteorder::big_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::{Error, Result};

/// Payload alignment boundary.
pub const CA_ALIGNTO: usize = 8;

/// Align a length to the CA payload boundary.
#[inline]
pub const fn ca_align(len: usize) -> usize {
    (len + CA_ALIGNTO - 1) & !(CA_ALIGNTO - 1)
}

/// Size of the fixed frame header.
pub const CA_HDR_LEN: usize = std::mem::size_of::<CaHdr>();

/// Size of the large-payload annex that follows the header when either
/// 16-bit field carries the sentinel.
pub const CA_ANNEX_LEN: usize = std::mem::size_of::<CaHdrAnnex>();

/// Sentinel in the 16-bit size or count field selecting the annex.
pub const LARGE_SENTINEL: u16 = 0xffff;

/// Default server TCP/search port.
pub const DEFAULT_SERVER_PORT: u16 = 5064;

/// Largest search datagram assembled per round.
pub const MAX_UDP_SEND: usize = 1024;

/// Base inbound frame budget; also the floor for the configured maximum.
pub const MAX_TCP_BASE: u32 = 0x4000;

/// Minor protocol revision spoken by this client (major is always 4).
pub const MINOR_VERSION: u16 = 11;

/// Peer speaks at least version 4.1 (sends access rights).
pub const fn v41_ok(minor: u16) -> bool {
    minor >= 1
}

/// Peer speaks at least version 4.2 (acknowledges channel claims).
pub const fn v42_ok(minor: u16) -> bool {
    minor >= 2
}

/// Peer speaks at least version 4.4 (claims carry the channel name,
/// acks carry the SID).
pub const fn v44_ok(minor: u16) -> bool {
    minor >= 4
}

/// Fixed frame header. All fields network byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CaHdr {
    /// Command code.
    pub command: U16,
    /// Payload size in bytes, or [`LARGE_SENTINEL`].
    pub payload_size: U16,
    /// Payload data type.
    pub data_type: U16,
    /// Element count, or [`LARGE_SENTINEL`].
    pub count: U16,
    /// First command parameter (CID, SID or status, per command).
    pub param1: U32,
    /// Second command parameter (CID, IOID or rights, per command).
    pub param2: U32,
}

impl CaHdr {
    /// Parse a header from the front of a buffer.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: CA_HDR_LEN,
                actual: data.len(),
            })
    }

    /// Whether an 8-byte annex with the true size and count follows.
    pub fn needs_annex(&self) -> bool {
        self.payload_size.get() == LARGE_SENTINEL || self.count.get() == LARGE_SENTINEL
    }

    /// Convert header to bytes.
    pub fn as_bytes(&self) -> &[u8] {
        <Self as IntoBytes>::as_bytes(self)
    }
}

/// Large-payload annex: true size and count as 32-bit values.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CaHdrAnnex {
    /// True payload size in bytes.
    pub payload_size: U32,
    /// True element count.
    pub count: U32,
}

impl CaHdrAnnex {
    /// Parse an annex from the front of a buffer.
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        Self::ref_from_prefix(data)
            .map(|(r, _)| r)
            .map_err(|_| Error::Truncated {
                expected: CA_ANNEX_LEN,
                actual: data.len(),
            })
    }
}

/// A parsed header in host order, annex already folded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: u16,
    pub payload_size: u32,
    pub data_type: u16,
    pub count: u32,
    pub param1: u32,
    pub param2: u32,
}

impl Header {
    /// Fold a fixed header without an annex.
    pub fn small(hdr: &CaHdr) -> Self {
        Self {
            command: hdr.command.get(),
            payload_size: hdr.payload_size.get() as u32,
            data_type: hdr.data_type.get(),
            count: hdr.count.get() as u32,
            param1: hdr.param1.get(),
            param2: hdr.param2.get(),
        }
    }

    /// Fold a fixed header with its annex.
    pub fn large(hdr: &CaHdr, annex: &CaHdrAnnex) -> Self {
        Self {
            command: hdr.command.get(),
            payload_size: annex.payload_size.get(),
            data_type: hdr.data_type.get(),
            count: annex.count.get(),
            param1: hdr.param1.get(),
            param2: hdr.param2.get(),
        }
    }
}

/// Command codes dispatched between client and server.
pub struct Command;

impl Command {
    /// Minor protocol version exchange.
    pub const VERSION: u16 = 0;
    /// Subscription update (server → client) or subscribe (client → server).
    pub const EVENT_ADD: u16 = 1;
    /// Cancel a subscription.
    pub const EVENT_CANCEL: u16 = 2;
    /// Legacy read.
    pub const READ: u16 = 3;
    /// Fire-and-forget write.
    pub const WRITE: u16 = 4;
    pub const SNAPSHOT: u16 = 5;
    /// Name search (UDP request and reply).
    pub const SEARCH: u16 = 6;
    pub const BUILD: u16 = 7;
    pub const EVENTS_OFF: u16 = 8;
    pub const EVENTS_ON: u16 = 9;
    pub const READ_SYNC: u16 = 10;
    /// Error carrier: embedded request header plus context string.
    pub const ERROR: u16 = 11;
    /// Release a server-side channel.
    pub const CLEAR_CHANNEL: u16 = 12;
    /// Server beacon (UDP).
    pub const RSRV_IS_UP: u16 = 13;
    /// Negative search reply.
    pub const NOT_FOUND: u16 = 14;
    /// Read with completion notification.
    pub const READ_NOTIFY: u16 = 15;
    pub const READ_BUILD: u16 = 16;
    pub const REPEATER_CONFIRM: u16 = 17;
    /// Channel claim (client → server) and its acknowledgement.
    pub const CLAIM_CIU: u16 = 18;
    /// Write with completion notification.
    pub const WRITE_NOTIFY: u16 = 19;
    /// Client user name, sent after connect.
    pub const CLIENT_NAME: u16 = 20;
    /// Client host name, sent after connect.
    pub const HOST_NAME: u16 = 21;
    /// Access rights update (server → client).
    pub const ACCESS_RIGHTS: u16 = 22;
    /// Liveness probe and its reply.
    pub const ECHO: u16 = 23;
    pub const REPEATER_REGISTER: u16 = 24;
    pub const SIGNAL: u16 = 25;
    /// Claim failed; verify and disconnect the channel.
    pub const CLAIM_CIU_FAILED: u16 = 26;
    /// Server-initiated channel disconnect.
    pub const SERVER_DISCONN: u16 = 27;

    /// One past the highest dispatched command code.
    pub const LIMIT: u16 = 28;
}

/// Access-rights bits carried in ACCESS_RIGHTS param2.
pub const RIGHT_READ: u32 = 0x1;
pub const RIGHT_WRITE: u32 = 0x2;

/// Search request data-type field: reply even when the PV is unknown.
pub const SEARCH_DO_REPLY: u16 = 10;
/// Search request data-type field: stay silent when the PV is unknown.
pub const SEARCH_DONT_REPLY: u16 = 5;

/// Subscription event-mask bits.
pub mod dbe {
    /// Value changes beyond the dead band.
    pub const VALUE: u32 = 0x1;
    /// Value changes beyond the archival dead band.
    pub const LOG: u32 = 0x2;
    /// Alarm state changes.
    pub const ALARM: u32 = 0x4;
}

/// Builder for one outbound frame.
///
/// Sizes and counts that fit 16 bits go in the fixed header; anything
/// larger moves both into the annex with the sentinel in the fixed
/// fields. Payloads are zero-padded to the alignment boundary and the
/// size field includes the padding.
#[derive(Debug, Clone)]
pub struct FrameBuilder {
    command: u16,
    data_type: u16,
    count: u32,
    param1: u32,
    param2: u32,
    payload: Vec<u8>,
}

impl FrameBuilder {
    /// Start a frame for the given command.
    pub fn new(command: u16) -> Self {
        Self {
            command,
            data_type: 0,
            count: 0,
            param1: 0,
            param2: 0,
            payload: Vec::new(),
        }
    }

    pub fn data_type(mut self, data_type: u16) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    pub fn param1(mut self, param1: u32) -> Self {
        self.param1 = param1;
        self
    }

    pub fn param2(mut self, param2: u32) -> Self {
        self.param2 = param2;
        self
    }

    /// Append raw payload bytes.
    pub fn payload_bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Append a NUL-terminated string payload.
    pub fn payload_str(mut self, s: &str) -> Self {
        self.payload.extend_from_slice(s.as_bytes());
        self.payload.push(0);
        self
    }

    /// Finalize into wire bytes.
    pub fn finish(self) -> Bytes {
        let padded = ca_align(self.payload.len());
        let large =
            padded >= LARGE_SENTINEL as usize || self.count >= LARGE_SENTINEL as u32;

        let mut buf = BytesMut::with_capacity(CA_HDR_LEN + CA_ANNEX_LEN + padded);
        let hdr = CaHdr {
            command: U16::new(self.command),
            payload_size: U16::new(if large { LARGE_SENTINEL } else { padded as u16 }),
            data_type: U16::new(self.data_type),
            count: U16::new(if large { LARGE_SENTINEL } else { self.count as u16 }),
            param1: U32::new(self.param1),
            param2: U32::new(self.param2),
        };
        buf.extend_from_slice(hdr.as_bytes());
        if large {
            let annex = CaHdrAnnex {
                payload_size: U32::new(padded as u32),
                count: U32::new(self.count),
            };
            buf.extend_from_slice(annex.as_bytes());
        }
        buf.extend_from_slice(&self.payload);
        buf.resize(buf.len() + (padded - self.payload.len()), 0);
        buf.freeze()
    }
}

/// Iterator over the frames packed into one datagram.
///
/// Datagram frames never use the large-payload annex.
pub struct DatagramIter<'a> {
    data: &'a [u8],
}

impl<'a> DatagramIter<'a> {
    /// Create a new frame iterator.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for DatagramIter<'a> {
    type Item = Result<(Header, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < CA_HDR_LEN {
            return None;
        }

        let hdr = match CaHdr::from_bytes(self.data) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        let header = Header::small(hdr);

        let total = CA_HDR_LEN + header.payload_size as usize;
        if header.payload_size as usize % CA_ALIGNTO != 0 || total > self.data.len() {
            return Some(Err(Error::InvalidFrame(format!(
                "datagram frame with bad payload size {}",
                header.payload_size
            ))));
        }

        let payload = &self.data[CA_HDR_LEN..total];
        self.data = &self.data[total..];

        Some(Ok((header, payload)))
    }
}
