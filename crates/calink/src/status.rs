//! Channel Access status codes.
//!
//! A status packs a message number and a severity into one 16-bit value
//! (`(message << 3) | severity`), which is the form carried on the wire
//! in error frames and in the status field of completion responses.
//! Server-originated statuses are passed through to user callbacks
//! unchanged, even when the message number is not one this crate knows.

use std::fmt;

/// Severity of a [`Status`], stored in its low three bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Success,
    Error,
    Info,
    Fatal,
}

impl Severity {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x7 {
            0 => Severity::Warning,
            1 => Severity::Success,
            2 => Severity::Error,
            3 => Severity::Info,
            _ => Severity::Fatal,
        }
    }

    /// Display name used in diagnostics.
    pub fn label(self) -> &'static str {
        match self {
            Severity::Warning => "Warning",
            Severity::Success => "Success",
            Severity::Error => "Error",
            Severity::Info => "Info",
            Severity::Fatal => "Fatal",
        }
    }
}

const fn defmsg(msg: u16, severity: u16) -> u16 {
    (msg << 3) | severity
}

const SEV_WARNING: u16 = 0;
const SEV_SUCCESS: u16 = 1;
const SEV_ERROR: u16 = 2;
const SEV_FATAL: u16 = 4;

/// A Channel Access status value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(u16);

impl Status {
    /// Operation completed normally.
    pub const NORMAL: Status = Status(defmsg(0, SEV_SUCCESS));
    /// Unable to allocate memory.
    pub const ALLOCMEM: Status = Status(defmsg(1, SEV_ERROR));
    /// Data transfer larger than the configured maximum.
    pub const TOLARGE: Status = Status(defmsg(2, SEV_WARNING));
    /// Data type out of range or mismatched.
    pub const BADTYPE: Status = Status(defmsg(3, SEV_ERROR));
    /// Channel priority out of range.
    pub const BADPRIORITY: Status = Status(defmsg(4, SEV_ERROR));
    /// Invalid string (empty channel name).
    pub const BADSTR: Status = Status(defmsg(5, SEV_ERROR));
    /// Unknown channel identifier.
    pub const BADCHID: Status = Status(defmsg(6, SEV_ERROR));
    /// Virtual circuit disconnect.
    pub const DISCONN: Status = Status(defmsg(7, SEV_WARNING));
    /// Channel was destroyed while IO was outstanding.
    pub const CHANDESTROY: Status = Status(defmsg(8, SEV_WARNING));
    /// Internal failure.
    pub const INTERNAL: Status = Status(defmsg(9, SEV_FATAL));
    /// Read request failed at the server.
    pub const GETFAIL: Status = Status(defmsg(10, SEV_ERROR));
    /// Write request failed at the server.
    pub const PUTFAIL: Status = Status(defmsg(11, SEV_ERROR));
    /// Subscription request failed at the server.
    pub const ADDFAIL: Status = Status(defmsg(12, SEV_ERROR));
    /// The same process variable is hosted by more than one server.
    pub const DBLCHNL: Status = Status(defmsg(13, SEV_WARNING));
    /// Operation attempted on an unconnected channel.
    pub const DISCONNCHID: Status = Status(defmsg(14, SEV_ERROR));
    /// Circuit stopped responding to liveness probes.
    pub const UNRESPTMO: Status = Status(defmsg(15, SEV_WARNING));

    /// Reconstruct a status from a wire value, preserving unknown codes.
    pub fn from_raw(raw: u32) -> Status {
        Status(raw as u16)
    }

    /// The wire representation.
    pub fn raw(self) -> u16 {
        self.0
    }

    /// Message number (the identity of the condition, severity stripped).
    pub fn message_number(self) -> u16 {
        self.0 >> 3
    }

    pub fn severity(self) -> Severity {
        Severity::from_bits(self.0)
    }

    /// True for statuses whose severity carries the success bit
    /// (success and info).
    pub fn is_success(self) -> bool {
        self.0 & 0x1 != 0
    }

    /// Human-readable condition text.
    pub fn message(self) -> &'static str {
        match self.message_number() {
            0 => "Normal successful completion",
            1 => "Unable to allocate memory",
            2 => "The requested data transfer is greater than EPICS_CA_MAX_ARRAY_BYTES",
            3 => "The data type specified is invalid",
            4 => "Invalid channel priority",
            5 => "Invalid string",
            6 => "Invalid channel identifier",
            7 => "Virtual circuit disconnect",
            8 => "The channel was destroyed",
            9 => "Channel Access internal failure",
            10 => "Channel read request failed",
            11 => "Channel write request failed",
            12 => "Channel subscription request failed",
            13 => "The requested PV was found to exist in more than one server",
            14 => "The channel is disconnected",
            15 => "Virtual circuit unresponsive",
            _ => "Unknown status code",
        }
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Status({}, {}, \"{}\")",
            self.message_number(),
            self.severity().label(),
            self.message()
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}
