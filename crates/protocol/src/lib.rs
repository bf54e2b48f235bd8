// Copyright 2025-2026 CEMAXECUTER LLC

//! Wire format shared by the spectrum daemon and its clients.
//!
//! Every binary message is a fixed 12-byte [`Preamble`] followed by
//! `extent` bytes of native-endian `f32` magnitudes. Text messages carry
//! the calibration [`Command`]s.

pub mod command;
pub mod preamble;

pub use command::Command;
pub use preamble::{
    decode_frame, encode_frame, encode_spectrum, Frame, FrameError, FrameKind, Preamble,
    ORDER_MARKER, PREAMBLE_SIZE,
};
