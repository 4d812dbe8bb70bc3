// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use tin86_core::factory::PortDevice;

/// I/O port the console output device listens on, following the debug
/// port convention used by PC emulators.
pub const CONSOLE_PORT: u16 = 0x00e9;

/// Line buffered console output. Bytes written to the port are echoed
/// to stdout, carriage returns are dropped. Reads report an idle bus.
pub struct ConsoleDevice {
    line: Vec<u8>,
}

impl ConsoleDevice {
    pub fn new() -> Self {
        ConsoleDevice { line: Vec::new() }
    }

    fn flush_line(&mut self) {
        if !self.line.is_empty() {
            println!("{}", String::from_utf8_lossy(&self.line));
            self.line.clear();
        }
    }
}

impl PortDevice for ConsoleDevice {
    fn read_byte(&mut self, _port: u16) -> u8 {
        0xff
    }

    fn write_byte(&mut self, _port: u16, value: u8) {
        match value {
            0x0a => self.flush_line(),
            0x0d => (),
            _ => self.line.push(value),
        }
    }
}

impl Drop for ConsoleDevice {
    fn drop(&mut self) {
        self.flush_line();
    }
}
