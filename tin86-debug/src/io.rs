// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::io;
use std::io::{BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};

use super::hex;

/// Wire transport for one gdb client.
///
/// Reads are owned by the session thread. Writes go through a cloneable
/// handle so breakpoint callbacks running on the machine thread can push
/// stop replies into the same stream.
pub struct GdbIo {
    reader: BufReader<TcpStream>,
    writer: GdbWriter,
    raw_command: Vec<u8>,
}

impl GdbIo {
    pub fn new(stream: TcpStream) -> io::Result<GdbIo> {
        let writer = GdbWriter::new(stream.try_clone()?);
        Ok(GdbIo {
            reader: BufReader::new(stream),
            writer,
            raw_command: Vec::new(),
        })
    }

    pub fn writer(&self) -> &GdbWriter {
        &self.writer
    }

    /// Bytes of the last frame as read from the wire, up to and including
    /// the '#' terminator. Commands carrying raw binary data are re-parsed
    /// from this buffer since the payload string is lossy.
    pub fn raw_command(&self) -> &[u8] {
        &self.raw_command
    }

    /// Reads the next command payload. `None` means the client hung up.
    pub fn read_command(&mut self) -> io::Result<Option<String>> {
        read_packet(&mut self.reader, &mut self.raw_command)
    }
}

#[derive(Clone)]
pub struct GdbWriter {
    stream: Arc<Mutex<TcpStream>>,
}

impl GdbWriter {
    fn new(stream: TcpStream) -> GdbWriter {
        GdbWriter {
            stream: Arc::new(Mutex::new(stream)),
        }
    }

    /// Writes a prebuilt reply. An empty reply puts nothing on the wire,
    /// which is how unsupported commands are answered.
    pub fn send_response(&self, response: &str) -> io::Result<()> {
        if response.is_empty() {
            return Ok(());
        }
        debug!(target: "gdb", "Sending response {:?}", response);
        let mut stream = self.stream.lock().unwrap();
        stream.write_all(response.as_bytes())?;
        stream.flush()
    }
}

/// Frames `data` as an acknowledged reply: `+$<data>#<checksum>` where the
/// checksum is the byte sum of the data modulo 256 in two hex digits.
pub fn generate_response(data: &str) -> String {
    let mut checksum: u8 = 0;
    for byte in data.bytes() {
        checksum = checksum.wrapping_add(byte);
    }
    format!("+${}#{:02X}", data, checksum)
}

/// Frames a human readable message as hex encoded console output.
pub fn generate_message_response(message: &str) -> String {
    let text = format!("{}\n", message);
    generate_response(&hex::encode(text.as_bytes()))
}

/// The reply for commands this server does not implement: nothing at all.
/// Distinct from `generate_response("")` which still sends an empty frame.
pub fn generate_unsupported_response() -> String {
    String::new()
}

fn read_packet<R: Read>(reader: &mut R, raw_command: &mut Vec<u8>) -> io::Result<Option<String>> {
    raw_command.clear();
    let mut payload = Vec::new();
    loop {
        let mut byte = [0u8; 1];
        if reader.read(&mut byte)? == 0 {
            return Ok(None);
        }
        let chr = byte[0];
        raw_command.push(chr);
        if chr == 0x03 && raw_command.len() == 1 {
            // gdb interrupts a running target with a bare 0x03, no frame.
            return Ok(Some("\u{3}".to_string()));
        }
        if chr == b'#' {
            // Two checksum characters follow the frame. They are consumed
            // without being verified.
            for _ in 0..2 {
                if reader.read(&mut byte)? == 0 {
                    break;
                }
            }
            break;
        }
        payload.push(chr);
    }
    Ok(Some(extract_payload(&payload)))
}

/// Strips the leading acknowledgement and frame start so only the command
/// itself is left: everything after '$' if present, otherwise everything
/// after '+', otherwise the whole buffer.
fn extract_payload(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    if let Some(start) = text.find('$') {
        text[start + 1..].to_string()
    } else if let Some(start) = text.find('+') {
        text[start + 1..].to_string()
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn read(wire: &[u8]) -> (Option<String>, Vec<u8>) {
        let mut cursor = Cursor::new(wire.to_vec());
        let mut raw = Vec::new();
        let payload = read_packet(&mut cursor, &mut raw).unwrap();
        (payload, raw)
    }

    #[test]
    fn read_packet_strips_ack_and_frame() {
        let (payload, raw) = read(b"+$g#67");
        assert_eq!(Some("g".to_string()), payload);
        assert_eq!(b"+$g#".to_vec(), raw);
    }

    #[test]
    fn read_packet_without_ack() {
        let (payload, _) = read(b"$m100,2#5C");
        assert_eq!(Some("m100,2".to_string()), payload);
    }

    #[test]
    fn incoming_checksum_is_consumed_but_not_verified() {
        let (payload, _) = read(b"+$g#00");
        assert_eq!(Some("g".to_string()), payload);
    }

    #[test]
    fn read_packet_keeps_raw_bytes_through_terminator() {
        let (_, raw) = read(b"+$qSearch:memory:0;8000;\xeb\xfe#AA");
        assert_eq!(b'#', *raw.last().unwrap());
        assert!(raw.windows(2).any(|w| w == [0xeb, 0xfe]));
    }

    #[test]
    fn read_packet_reports_disconnect() {
        let (payload, _) = read(b"");
        assert_eq!(None, payload);
    }

    #[test]
    fn bare_interrupt_byte_is_its_own_command() {
        let (payload, _) = read(&[0x03]);
        assert_eq!(Some("\u{3}".to_string()), payload);
    }

    #[test]
    fn response_checksum_is_byte_sum_mod_256() {
        assert_eq!("+$#00", generate_response(""));
        assert_eq!("+$OK#9A", generate_response("OK"));
        assert_eq!("+$S05#B8", generate_response("S05"));
    }

    #[test]
    fn response_checksum_wraps_past_255() {
        let response = generate_response(&"a".repeat(255));
        assert_eq!(true, response.ends_with("#9F"));
        assert_eq!(260, response.len());
    }

    #[test]
    fn message_response_is_hex_encoded_with_newline() {
        assert_eq!(
            generate_response("68690A"),
            generate_message_response("hi")
        );
    }

    #[test]
    fn unsupported_response_is_empty() {
        assert_eq!("", generate_unsupported_response());
    }
}
