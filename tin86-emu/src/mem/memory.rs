// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use byteorder::{ByteOrder, LittleEndian};

use crate::system::BreakPointHolder;

// Design:
//   Guest RAM is a flat byte array covering the real mode address space.
//   Reads past the end return 0xFF like a floating bus, writes past the
//   end are dropped. Data accesses consult the attached watchpoint
//   holders; instruction fetch goes through inspect_byte which does not,
//   so a read watchpoint never fires on its own code bytes.

pub struct PhysicalMemory {
    data: Vec<u8>,
    read_breakpoints: BreakPointHolder,
    write_breakpoints: BreakPointHolder,
}

impl PhysicalMemory {
    pub fn new(
        capacity: usize,
        read_breakpoints: BreakPointHolder,
        write_breakpoints: BreakPointHolder,
    ) -> Self {
        PhysicalMemory {
            data: vec![0x00; capacity],
            read_breakpoints,
            write_breakpoints,
        }
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    fn read_data(&self, address: u32) -> u8 {
        match self.data.get(address as usize) {
            Some(value) => *value,
            None => 0xff,
        }
    }

    fn write_data(&mut self, address: u32, value: u8) {
        match self.data.get_mut(address as usize) {
            Some(cell) => *cell = value,
            None => debug!(
                target: "mem",
                "Dropped write of {:02X} to out of range address {:05X}",
                value, address
            ),
        }
    }

    /// Read a byte without consulting watchpoints. Instruction fetch and
    /// debugger inspection go through here.
    pub fn inspect_byte(&self, address: u32) -> Option<u8> {
        self.data.get(address as usize).cloned()
    }

    pub fn get_byte(&self, address: u32) -> u8 {
        self.read_breakpoints.trigger_matching(u64::from(address));
        self.read_data(address)
    }

    pub fn get_word(&self, address: u32) -> u16 {
        self.read_breakpoints.trigger_matching(u64::from(address));
        self.read_breakpoints.trigger_matching(u64::from(address) + 1);
        let start = address as usize;
        match self.data.get(start..start.wrapping_add(2)) {
            Some(slice) => LittleEndian::read_u16(slice),
            None => {
                u16::from(self.read_data(address.wrapping_add(1))) << 8
                    | u16::from(self.read_data(address))
            }
        }
    }

    pub fn get_dword(&self, address: u32) -> u32 {
        for offset in 0..4 {
            self.read_breakpoints
                .trigger_matching(u64::from(address) + offset);
        }
        let start = address as usize;
        match self.data.get(start..start.wrapping_add(4)) {
            Some(slice) => LittleEndian::read_u32(slice),
            None => {
                let mut value = 0;
                for offset in (0..4).rev() {
                    value = value << 8 | u32::from(self.read_data(address.wrapping_add(offset)));
                }
                value
            }
        }
    }

    pub fn set_byte(&mut self, address: u32, value: u8) {
        self.write_breakpoints.trigger_matching(u64::from(address));
        self.write_data(address, value);
    }

    pub fn set_word(&mut self, address: u32, value: u16) {
        self.write_breakpoints.trigger_matching(u64::from(address));
        self.write_breakpoints.trigger_matching(u64::from(address) + 1);
        let start = address as usize;
        match self.data.get_mut(start..start.wrapping_add(2)) {
            Some(slice) => LittleEndian::write_u16(slice, value),
            None => {
                self.write_data(address, value as u8);
                self.write_data(address.wrapping_add(1), (value >> 8) as u8);
            }
        }
    }

    pub fn set_dword(&mut self, address: u32, value: u32) {
        for offset in 0..4 {
            self.write_breakpoints
                .trigger_matching(u64::from(address) + offset);
        }
        let start = address as usize;
        match self.data.get_mut(start..start.wrapping_add(4)) {
            Some(slice) => LittleEndian::write_u32(slice, value),
            None => {
                for offset in 0..4 {
                    self.write_data(address.wrapping_add(offset), (value >> (offset * 8)) as u8);
                }
            }
        }
    }

    /// Bulk store used by the program loader and the debugger. Watchpoints
    /// are not consulted.
    pub fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), String> {
        let start = address as usize;
        let end = start.wrapping_add(bytes.len());
        if end < start || end > self.data.len() {
            return Err(format!(
                "write of {} bytes at {:05X} exceeds memory size {}",
                bytes.len(),
                address,
                self.data.len()
            ));
        }
        self.data[start..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Scan [start, end) for the first occurrence of pattern. The window is
    /// clamped to the memory size.
    pub fn search(&self, start: u32, end: u32, pattern: &[u8]) -> Option<u32> {
        if pattern.is_empty() {
            return None;
        }
        for address in start..end {
            let begin = address as usize;
            let finish = begin + pattern.len();
            if finish > self.data.len() {
                return None;
            }
            if &self.data[begin..finish] == pattern {
                return Some(address);
            }
        }
        None
    }
}
