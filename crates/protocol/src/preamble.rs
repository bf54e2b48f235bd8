// Copyright 2025-2026 CEMAXECUTER LLC

use std::fmt;
use std::io::{self, Cursor, Write};

use byteorder::{NativeEndian, ReadBytesExt, WriteBytesExt};

/// Serialized preamble length in bytes.
pub const PREAMBLE_SIZE: usize = 12;

/// Byte-order marker as written by a native-endian producer.
pub const ORDER_MARKER: u16 = 0xAA55;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },
    #[error("byte-swapped frame (order marker 0x{0:04x}); conversion is not supported")]
    ByteSwapped(u16),
    #[error("bad payload offset {0} (preamble is {PREAMBLE_SIZE} bytes)")]
    BadOffset(u16),
    #[error("payload is {actual} bytes but preamble declares {declared}")]
    ExtentMismatch { declared: u32, actual: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u16),
}

/// Message kind carried in the preamble `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameKind {
    /// Short-cadence averaged spectrum.
    Update = 1,
    /// Long-cadence reduction of update spectra.
    Sample = 2,
}

impl FrameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameKind::Update => "update",
            FrameKind::Sample => "sample",
        }
    }
}

impl TryFrom<u16> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Update),
            2 => Ok(FrameKind::Sample),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed header in front of every binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub order: u16,
    pub offset: u16,
    pub extent: u32,
    pub kind: u16,
    pub flags: u16,
}

impl Preamble {
    pub fn new(kind: FrameKind, extent: u32) -> Self {
        Self {
            order: ORDER_MARKER,
            offset: PREAMBLE_SIZE as u16,
            extent,
            kind: kind as u16,
            flags: 0,
        }
    }

    pub fn is_byte_swapped(&self) -> bool {
        self.order != ORDER_MARKER
    }

    pub fn write<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_u16::<NativeEndian>(self.order)?;
        w.write_u16::<NativeEndian>(self.offset)?;
        w.write_u32::<NativeEndian>(self.extent)?;
        w.write_u16::<NativeEndian>(self.kind)?;
        w.write_u16::<NativeEndian>(self.flags)?;
        Ok(())
    }

    /// Parse the first [`PREAMBLE_SIZE`] bytes of `data` without validating
    /// the fields.
    pub fn read(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < PREAMBLE_SIZE {
            return Err(FrameError::Truncated {
                len: data.len(),
                needed: PREAMBLE_SIZE,
            });
        }
        let mut cur = Cursor::new(&data[..PREAMBLE_SIZE]);
        let field = |r: io::Result<u16>| r.unwrap_or_default();
        let order = field(cur.read_u16::<NativeEndian>());
        let offset = field(cur.read_u16::<NativeEndian>());
        let extent = cur.read_u32::<NativeEndian>().unwrap_or_default();
        let kind = field(cur.read_u16::<NativeEndian>());
        let flags = field(cur.read_u16::<NativeEndian>());
        Ok(Self {
            order,
            offset,
            extent,
            kind,
            flags,
        })
    }
}

/// A decoded frame borrowing its payload from the input bytes.
#[derive(Debug, Clone, Copy)]
pub struct Frame<'a> {
    pub preamble: Preamble,
    pub kind: FrameKind,
    pub payload: &'a [u8],
}

impl Frame<'_> {
    /// Payload interpreted as native-endian `f32` magnitudes. Trailing bytes
    /// that do not form a whole value are ignored.
    pub fn values(&self) -> Vec<f32> {
        self.payload
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }
}

/// Build one frame: preamble followed by `payload`.
pub fn encode_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PREAMBLE_SIZE + payload.len());
    let preamble = Preamble::new(kind, payload.len() as u32);
    // Writing into a Vec cannot fail.
    let _ = preamble.write(&mut out);
    out.extend_from_slice(payload);
    out
}

/// Build a frame whose payload is the native-endian encoding of `values`.
pub fn encode_spectrum(kind: FrameKind, values: &[f32]) -> Vec<u8> {
    let extent = values.len() * 4;
    let mut out = Vec::with_capacity(PREAMBLE_SIZE + extent);
    let _ = Preamble::new(kind, extent as u32).write(&mut out);
    for &v in values {
        let _ = out.write_f32::<NativeEndian>(v);
    }
    out
}

/// Validate and split a received frame.
pub fn decode_frame(data: &[u8]) -> Result<Frame<'_>, FrameError> {
    let preamble = Preamble::read(data)?;
    if preamble.is_byte_swapped() {
        return Err(FrameError::ByteSwapped(preamble.order));
    }
    let offset = preamble.offset as usize;
    if offset < PREAMBLE_SIZE {
        return Err(FrameError::BadOffset(preamble.offset));
    }
    if data.len() < offset {
        return Err(FrameError::Truncated {
            len: data.len(),
            needed: offset,
        });
    }
    let kind = FrameKind::try_from(preamble.kind)?;
    let payload = &data[offset..];
    if payload.len() != preamble.extent as usize {
        return Err(FrameError::ExtentMismatch {
            declared: preamble.extent,
            actual: payload.len(),
        });
    }
    Ok(Frame {
        preamble,
        kind,
        payload,
    })
}
