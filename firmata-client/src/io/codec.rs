//! Byte codecs used to carry 8-bit values over a channel reserving the high bit for framing.
//!
//! Two representations coexist in Firmata:
//! - the "7-bit pair" form: every byte (or 14-bit value) is split in two 7-bit halves, LSB first.
//! - the bit-packed form (`Encoder7Bit` in the firmware): a stream of 8-bit bytes is re-packed so
//!   that every 7 bits of payload occupy one wire byte.

/// Re-packs an 8-bit byte sequence into 7-bit-safe wire bytes.
///
/// Input byte `i` contributes its bits to wire byte `floor(8i/7)` (low bits) and bridges into the
/// next wire byte when the 8-bit boundary is crossed: `n` bytes produce `ceil(8n/7)` wire bytes.
pub fn to_wire_safe(bytes: &[u8]) -> Vec<u8> {
    let mut wire = Vec::with_capacity((bytes.len() * 8).div_ceil(7));
    let mut shift = 0;
    let mut previous = 0u8;
    for &byte in bytes {
        if shift == 0 {
            wire.push(byte & 0x7F);
            shift += 1;
            previous = byte >> 7;
        } else {
            wire.push(((byte << shift) & 0x7F) | previous);
            if shift == 6 {
                wire.push(byte >> 1);
                shift = 0;
            } else {
                shift += 1;
                previous = byte >> (8 - shift);
            }
        }
    }
    if shift > 0 {
        wire.push(previous);
    }
    wire
}

/// Exact inverse of [`to_wire_safe`]: `n` wire bytes decode into `floor(7n/8)` bytes.
pub fn from_wire_safe(wire: &[u8]) -> Vec<u8> {
    let len = wire.len() * 7 / 8;
    (0..len)
        .map(|i| {
            let bit = i * 8;
            let position = bit / 7;
            let shift = bit % 7;
            (wire[position] >> shift) | (wire[position + 1] << (7 - shift))
        })
        .collect()
}

/// Splits a byte into its low 7 bits and its high bit (in bit 0 of the second byte).
pub fn pack_7bit_pair(byte: u8) -> (u8, u8) {
    (byte & 0x7F, (byte >> 7) & 0x7F)
}

/// Joins a 7-bit pair into a byte. Bits above bit 0 of `msb` do not fit and are ignored.
pub fn unpack_7bit_pair(lsb: u8, msb: u8) -> u8 {
    (lsb & 0x7F) | ((msb & 0x01) << 7)
}

/// Splits a 14-bit value into its two 7-bit halves (LSB first).
pub fn split_14bit(value: u16) -> (u8, u8) {
    ((value & 0x7F) as u8, ((value >> 7) & 0x7F) as u8)
}

/// Joins two 7-bit halves (LSB first) into a 14-bit value.
pub fn join_14bit(lsb: u8, msb: u8) -> u16 {
    (lsb as u16 & 0x7F) | ((msb as u16 & 0x7F) << 7)
}

/// Decodes a string sent as 7-bit pairs (firmware name, STRING_DATA).
///
/// An odd-length input is zero-padded before decoding.
pub fn decode_ascii_pairs(bytes: &[u8]) -> String {
    bytes
        .chunks(2)
        .map(|pair| unpack_7bit_pair(pair[0], pair.get(1).copied().unwrap_or(0)) as char)
        .collect()
}

/// Encodes a string as 7-bit pairs, one pair per UTF-8 byte.
pub fn encode_ascii_pairs(text: &str) -> Vec<u8> {
    text.bytes()
        .flat_map(|byte| {
            let (lsb, msb) = pack_7bit_pair(byte);
            [lsb, msb]
        })
        .collect()
}
