//! Fixed-point number formats used by the DE1 firmware.
//!
//! The DE1 packs most physical quantities into one or two bytes using a
//! family of unsigned fixed-point encodings named `U<width>P<fractional
//! bits>`, plus one odd duck: `F8_1_7`, a duration format with a one-bit
//! exponent and a seven-bit mantissa.
//!
//! Decoders take the raw integer already extracted from the payload;
//! endianness handling for multi-byte fields lives with the callers (see
//! [`read_u16_be`] and friends). Encoders clamp out-of-range inputs to the
//! nearest representable value and never fail. All lossy rounding is
//! half-to-even.

use crate::error::{BridgeError, Result};

/// Decode a plain unsigned byte (U8P0).
#[must_use]
pub fn decode_u8p0(raw: u8) -> f64 {
    f64::from(raw)
}

/// Encode U8P0, clamping to 0–255.
#[must_use]
pub fn encode_u8p0(value: f64) -> u8 {
    clamp_round(value, 255.0) as u8
}

/// Decode a byte holding value × 2 (U8P1).
#[must_use]
pub fn decode_u8p1(raw: u8) -> f64 {
    f64::from(raw) / 2.0
}

/// Encode U8P1 (value × 2), clamping to the representable 0–127.5 range.
#[must_use]
pub fn encode_u8p1(value: f64) -> u8 {
    clamp_round(value * 2.0, 255.0) as u8
}

/// Decode a byte holding value × 16 (U8P4).
#[must_use]
pub fn decode_u8p4(raw: u8) -> f64 {
    f64::from(raw) / 16.0
}

/// Encode U8P4 (value × 16), clamping to the representable 0–15.9375 range.
#[must_use]
pub fn encode_u8p4(value: f64) -> u8 {
    clamp_round(value * 16.0, 255.0) as u8
}

/// Decode a 16-bit value holding value × 256 (U16P8).
#[must_use]
pub fn decode_u16p8(raw: u16) -> f64 {
    f64::from(raw) / 256.0
}

/// Encode U16P8 (value × 256), clamping to the representable 0–255.996 range.
#[must_use]
pub fn encode_u16p8(value: f64) -> u16 {
    clamp_round(value * 256.0, 65_535.0) as u16
}

/// Decode a 10-bit value carried in a u16 (U10P0); the upper six bits are
/// masked off.
#[must_use]
pub fn decode_u10p0(raw: u16) -> u16 {
    raw & 0x3FF
}

/// Encode U10P0, clamping to 0–1023.
#[must_use]
pub fn encode_u10p0(value: f64) -> u16 {
    clamp_round(value, 1023.0) as u16
}

/// Decode the F8_1_7 duration format into seconds.
///
/// High bit set: the low seven bits are tenths of a second (0–12.7 s).
/// High bit clear: the low seven bits are whole seconds (0–127 s).
#[must_use]
pub fn decode_f8_1_7(raw: u8) -> f64 {
    if raw & 0x80 != 0 {
        f64::from(raw & 0x7F) / 10.0
    } else {
        f64::from(raw)
    }
}

/// Encode seconds into F8_1_7, selecting the representation with the least
/// loss: tenths up to 12.7 s, whole seconds above, clamped at 127 s.
#[must_use]
pub fn encode_f8_1_7(seconds: f64) -> u8 {
    let seconds = seconds.max(0.0);
    if seconds <= 12.7 {
        0x80 | (clamp_round(seconds * 10.0, 127.0) as u8)
    } else {
        clamp_round(seconds, 127.0) as u8
    }
}

fn clamp_round(value: f64, max: f64) -> u32 {
    value.round_ties_even().clamp(0.0, max) as u32
}

/// Read a big-endian u16 at `offset`, returning the value and the offset
/// just past it.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] if fewer than two bytes remain.
pub fn read_u16_be(buf: &[u8], offset: usize) -> Result<(u16, usize)> {
    ensure_len(buf, offset, 2)?;
    let value = (u16::from(buf[offset]) << 8) | u16::from(buf[offset + 1]);
    Ok((value, offset + 2))
}

/// Read a big-endian 24-bit integer at `offset`, returning the value and
/// the offset just past it.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] if fewer than three bytes remain.
pub fn read_u24_be(buf: &[u8], offset: usize) -> Result<(u32, usize)> {
    ensure_len(buf, offset, 3)?;
    let value = (u32::from(buf[offset]) << 16)
        | (u32::from(buf[offset + 1]) << 8)
        | u32::from(buf[offset + 2]);
    Ok((value, offset + 3))
}

/// Read a big-endian u32 at `offset`, returning the value and the offset
/// just past it.
///
/// # Errors
///
/// Returns [`BridgeError::ShortBuffer`] if fewer than four bytes remain.
pub fn read_u32_be(buf: &[u8], offset: usize) -> Result<(u32, usize)> {
    ensure_len(buf, offset, 4)?;
    let value = (u32::from(buf[offset]) << 24)
        | (u32::from(buf[offset + 1]) << 16)
        | (u32::from(buf[offset + 2]) << 8)
        | u32::from(buf[offset + 3]);
    Ok((value, offset + 4))
}

/// Write a 24-bit integer as three big-endian bytes.
#[must_use]
pub fn u24_be_bytes(value: u32) -> [u8; 3] {
    [
        ((value >> 16) & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        (value & 0xFF) as u8,
    ]
}

fn ensure_len(buf: &[u8], offset: usize, width: usize) -> Result<()> {
    if buf.len() < offset + width {
        return Err(BridgeError::ShortBuffer {
            needed: offset + width,
            got: buf.len(),
        });
    }
    Ok(())
}
