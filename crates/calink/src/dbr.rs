//! Typed payloads and the network-to-host converter table.
//!
//! Payloads travel as arrays of one of seven primitive types, big-endian
//! on the wire. Decoding dispatches through a fixed table indexed by the
//! wire data-type code; a code outside the table is a `BADTYPE`
//! condition, never a parse panic.

use bytes::{BufMut, Bytes, BytesMut};

use crate::status::Status;
use crate::wire::ca_align;

/// Fixed cell size of a string element on the wire.
pub const MAX_STRING_SIZE: usize = 40;

/// Wire data-type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DbrType {
    String = 0,
    Short = 1,
    Float = 2,
    Enum = 3,
    Char = 4,
    Long = 5,
    Double = 6,
}

impl DbrType {
    /// Decode a wire data-type code.
    pub fn from_raw(raw: u16) -> Option<Self> {
        match raw {
            0 => Some(Self::String),
            1 => Some(Self::Short),
            2 => Some(Self::Float),
            3 => Some(Self::Enum),
            4 => Some(Self::Char),
            5 => Some(Self::Long),
            6 => Some(Self::Double),
            _ => None,
        }
    }

    /// Size of one element on the wire.
    pub fn element_size(self) -> usize {
        match self {
            Self::String => MAX_STRING_SIZE,
            Self::Short | Self::Enum => 2,
            Self::Float => 4,
            Self::Char => 1,
            Self::Long => 4,
            Self::Double => 8,
        }
    }
}

/// A decoded payload value.
#[derive(Debug, Clone, PartialEq)]
pub enum Dbr {
    String(Vec<String>),
    Short(Vec<i16>),
    Float(Vec<f32>),
    Enum(Vec<u16>),
    Char(Vec<u8>),
    Long(Vec<i32>),
    Double(Vec<f64>),
}

impl Dbr {
    /// Single-element double, the most common PV shape.
    pub fn double(v: f64) -> Self {
        Self::Double(vec![v])
    }

    /// Single-element long.
    pub fn long(v: i32) -> Self {
        Self::Long(vec![v])
    }

    /// The wire type of this value.
    pub fn data_type(&self) -> DbrType {
        match self {
            Self::String(_) => DbrType::String,
            Self::Short(_) => DbrType::Short,
            Self::Float(_) => DbrType::Float,
            Self::Enum(_) => DbrType::Enum,
            Self::Char(_) => DbrType::Char,
            Self::Long(_) => DbrType::Long,
            Self::Double(_) => DbrType::Double,
        }
    }

    /// Element count.
    pub fn count(&self) -> u32 {
        (match self {
            Self::String(v) => v.len(),
            Self::Short(v) => v.len(),
            Self::Float(v) => v.len(),
            Self::Enum(v) => v.len(),
            Self::Char(v) => v.len(),
            Self::Long(v) => v.len(),
            Self::Double(v) => v.len(),
        }) as u32
    }

    /// Scalar double view, converting numeric types.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Short(v) => v.first().map(|&x| x as f64),
            Self::Float(v) => v.first().map(|&x| x as f64),
            Self::Enum(v) => v.first().map(|&x| x as f64),
            Self::Char(v) => v.first().map(|&x| x as f64),
            Self::Long(v) => v.first().map(|&x| x as f64),
            Self::Double(v) => v.first().copied(),
            Self::String(_) => None,
        }
    }

    /// Encode into wire form, zero-padded to the payload boundary.
    pub fn encode(&self) -> Bytes {
        let count = self.count() as usize;
        let raw = count * self.data_type().element_size();
        let mut buf = BytesMut::with_capacity(ca_align(raw));
        match self {
            Self::String(v) => {
                for s in v {
                    let mut cell = [0u8; MAX_STRING_SIZE];
                    let n = s.len().min(MAX_STRING_SIZE - 1);
                    cell[..n].copy_from_slice(&s.as_bytes()[..n]);
                    buf.put_slice(&cell);
                }
            }
            Self::Short(v) => v.iter().for_each(|x| buf.put_i16(*x)),
            Self::Float(v) => v.iter().for_each(|x| buf.put_f32(*x)),
            Self::Enum(v) => v.iter().for_each(|x| buf.put_u16(*x)),
            Self::Char(v) => buf.put_slice(v),
            Self::Long(v) => v.iter().for_each(|x| buf.put_i32(*x)),
            Self::Double(v) => v.iter().for_each(|x| buf.put_f64(*x)),
        }
        buf.resize(ca_align(raw), 0);
        buf.freeze()
    }
}

type Decoder = fn(u32, &[u8]) -> Result<Dbr, Status>;

fn take<const N: usize>(body: &[u8], i: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&body[i * N..(i + 1) * N]);
    out
}

fn decode_string(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let cell = &body[i * MAX_STRING_SIZE..(i + 1) * MAX_STRING_SIZE];
        let end = cell.iter().position(|&b| b == 0).unwrap_or(cell.len());
        out.push(String::from_utf8_lossy(&cell[..end]).into_owned());
    }
    Ok(Dbr::String(out))
}

fn decode_short(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    Ok(Dbr::Short(
        (0..count as usize).map(|i| i16::from_be_bytes(take(body, i))).collect(),
    ))
}

fn decode_float(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    Ok(Dbr::Float(
        (0..count as usize).map(|i| f32::from_be_bytes(take(body, i))).collect(),
    ))
}

fn decode_enum(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    Ok(Dbr::Enum(
        (0..count as usize).map(|i| u16::from_be_bytes(take(body, i))).collect(),
    ))
}

fn decode_char(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    Ok(Dbr::Char(body[..count as usize].to_vec()))
}

fn decode_long(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    Ok(Dbr::Long(
        (0..count as usize).map(|i| i32::from_be_bytes(take(body, i))).collect(),
    ))
}

fn decode_double(count: u32, body: &[u8]) -> Result<Dbr, Status> {
    Ok(Dbr::Double(
        (0..count as usize).map(|i| f64::from_be_bytes(take(body, i))).collect(),
    ))
}

// Indexed by the wire data-type code.
const DECODERS: [Decoder; 7] = [
    decode_string,
    decode_short,
    decode_float,
    decode_enum,
    decode_char,
    decode_long,
    decode_double,
];

/// Decode a payload from its wire representation.
///
/// Returns `BADTYPE` when the type code is out of range or the body is
/// shorter than the declared element count requires.
pub fn decode(data_type: u16, count: u32, body: &[u8]) -> Result<Dbr, Status> {
    if data_type as usize >= DECODERS.len() {
        return Err(Status::BADTYPE);
    }
    let ty = DbrType::from_raw(data_type).ok_or(Status::BADTYPE)?;
    if body.len() < count as usize * ty.element_size() {
        return Err(Status::BADTYPE);
    }
    DECODERS[data_type as usize](count, body)
}
