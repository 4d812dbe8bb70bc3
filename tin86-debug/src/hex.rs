// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::str;

use byteorder::{ByteOrder, LittleEndian};

/// Encodes bytes as uppercase hex pairs, the way gdb packets carry binary data.
pub fn encode(bytes: &[u8]) -> String {
    let mut text = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        text.push_str(&format!("{:02X}", byte));
    }
    text
}

/// Decodes a string of hex pairs. Odd length or a stray digit yields `None`.
pub fn decode(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 {
        return None;
    }
    let mut bytes = Vec::with_capacity(text.len() / 2);
    for pair in text.as_bytes().chunks(2) {
        let pair = match str::from_utf8(pair) {
            Ok(pair) => pair,
            Err(_) => return None,
        };
        match u8::from_str_radix(pair, 16) {
            Ok(byte) => bytes.push(byte),
            Err(_) => return None,
        }
    }
    Some(bytes)
}

/// Parses an unprefixed hex number as sent in gdb packet arguments.
pub fn parse_u32(text: &str) -> Option<u32> {
    u32::from_str_radix(text, 16).ok()
}

/// Formats a 32-bit value in the little endian byte order gdb expects
/// for register contents.
pub fn format_hex32(value: u32) -> String {
    let mut buffer = [0u8; 4];
    LittleEndian::write_u32(&mut buffer, value);
    encode(&buffer)
}

pub fn format_hex8(value: u8) -> String {
    format!("{:02X}", value)
}
