// SPDX-FileCopyrightText: Copyright (c) 2017-2025 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte level helpers shared by the serial and socket codecs.

use std::fmt::Write as _;

use bytes::BytesMut;

use crate::error::ProtocolError;

pub mod command;
pub mod rtu;

/// Size of the CRC trailer of an RTU frame.
pub const CRC_SIZE: usize = 2;

#[allow(clippy::cast_possible_truncation)]
fn u16_len(len: usize) -> u16 {
    // This type conversion should always be safe, because either
    // the caller is responsible to pass a valid usize or the
    // possible values are limited by the protocol.
    debug_assert!(len <= u16::MAX.into());
    len as u16
}

#[allow(clippy::cast_possible_truncation)]
fn u8_len(len: usize) -> u8 {
    debug_assert!(len <= u8::MAX.into());
    len as u8
}

const CRC_TABLE: [u16; 256] = crc_table();

const fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-16 of a Modbus RTU frame.
///
/// The result is ordered the way it goes on the wire: high byte first.
#[must_use]
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = 0xFFFF_u16;
    for byte in data {
        crc = (crc >> 8) ^ CRC_TABLE[usize::from((crc ^ u16::from(*byte)) & 0xFF)];
    }
    crc.swap_bytes()
}

/// Appends the CRC of `buf`, high byte first.
pub fn append_crc(buf: &mut BytesMut) {
    let crc = crc16(buf);
    buf.extend_from_slice(&crc.to_be_bytes());
}

/// Validates the trailing CRC of a received frame.
#[must_use]
pub fn check_crc(frame: &[u8]) -> bool {
    if frame.len() < CRC_SIZE {
        return false;
    }
    let (payload, trailer) = frame.split_at(frame.len() - CRC_SIZE);
    crc16(payload).to_be_bytes() == trailer
}

/// Lower case hex digits without separators.
#[must_use]
pub fn encode_hex(data: &[u8]) -> String {
    let mut hex = String::with_capacity(data.len() * 2);
    for byte in data {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Parses pairs of hex digits into bytes.
///
/// Odd length input and non-hex characters are rejected.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, ProtocolError> {
    let text = text.trim();
    if text.len() % 2 != 0 {
        return Err(ProtocolError::InvalidHex(format!(
            "odd number of digits ({})",
            text.len()
        )));
    }
    text.as_bytes()
        .chunks(2)
        .map(|pair| {
            if !pair.iter().all(u8::is_ascii_hexdigit) {
                return Err(ProtocolError::InvalidHex(
                    String::from_utf8_lossy(pair).into_owned(),
                ));
            }
            let digits = std::str::from_utf8(pair)
                .map_err(|err| ProtocolError::InvalidHex(err.to_string()))?;
            u8::from_str_radix(digits, 16).map_err(|err| ProtocolError::InvalidHex(err.to_string()))
        })
        .collect()
}

/// Space separated hex dump used in debug logs.
pub(crate) fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{byte:02x}");
    }
    out
}
