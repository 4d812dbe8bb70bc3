// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use tin86_emu::system::MachineHandle;

use super::hex;
use super::io;

pub struct MemoryHandler {
    machine: MachineHandle,
}

impl MemoryHandler {
    pub fn new(machine: MachineHandle) -> Self {
        MemoryHandler { machine }
    }

    /// `m addr,length`. The length defaults to one byte and reads are
    /// clipped at the end of physical memory.
    pub fn read(&self, content: &str) -> String {
        let mut parts = content.split(',');
        let address = parts.next().and_then(hex::parse_u32);
        let length = match parts.next() {
            Some(text) => hex::parse_u32(text),
            None => Some(1),
        };
        match (address, length) {
            (Some(address), Some(length)) => {
                let vm = self.machine.get_vm();
                let vm = vm.lock().unwrap();
                let memory = vm.get_memory();
                let mut data = String::with_capacity(length as usize * 2);
                for i in 0..u64::from(length) {
                    let read_address = u64::from(address) + i;
                    if read_address >= u64::from(memory.size()) {
                        break;
                    }
                    if let Some(byte) = memory.inspect_byte(read_address as u32) {
                        data.push_str(&hex::format_hex8(byte));
                    }
                }
                io::generate_response(&data)
            }
            _ => {
                error!(target: "gdb", "Memory read with unparseable arguments {}", content);
                io::generate_unsupported_response()
            }
        }
    }

    /// `M addr,length:data`. E01 when the length does not match the data,
    /// E02 when the write would run past the end of memory.
    pub fn write(&self, content: &str) -> String {
        match self.try_write(content) {
            Some(response) => response,
            None => {
                error!(target: "gdb", "Memory write with unparseable arguments {}", content);
                io::generate_unsupported_response()
            }
        }
    }

    fn try_write(&self, content: &str) -> Option<String> {
        let comma = content.find(',')?;
        let colon = content.find(':')?;
        if colon < comma {
            return None;
        }
        let address = hex::parse_u32(&content[..comma])?;
        let length = hex::parse_u32(&content[comma + 1..colon])?;
        let data = hex::decode(&content[colon + 1..])?;
        if length as usize != data.len() {
            return Some(io::generate_response("E01"));
        }
        let vm = self.machine.get_vm();
        let mut vm = vm.lock().unwrap();
        match vm.get_memory_mut().write_bytes(address, &data) {
            Ok(()) => Some(io::generate_response("OK")),
            Err(error) => {
                error!(target: "gdb", "{}", error);
                Some(io::generate_response("E02"))
            }
        }
    }

    /// `qSearch:memory:start;end;pattern`. Answers `1,` plus the byte
    /// swapped address of the first match, or `0` when there is none.
    pub fn search(&self, content: &str, raw_command: &[u8]) -> String {
        match self.try_search(content, raw_command) {
            Some(response) => response,
            None => {
                error!(target: "gdb", "Memory search with unparseable arguments {}", content);
                io::generate_unsupported_response()
            }
        }
    }

    fn try_search(&self, content: &str, raw_command: &[u8]) -> Option<String> {
        const PREFIX: &str = "Search:memory:";
        let params_text = content.get(PREFIX.len()..)?;
        let mut params = params_text.split(';');
        let start_text = params.next()?;
        let end_text = params.next()?;
        let start = hex::parse_u32(start_text)?;
        let end = hex::parse_u32(end_text)?;
        // The pattern is raw binary so it is cut from the frame bytes, not
        // the payload string: "+$q", the prefix, both parameters and their
        // two ';' separators sit ahead of it, the '#' terminator behind it.
        let pattern_start = 3 + PREFIX.len() + 2 + start_text.len() + end_text.len();
        if raw_command.len() < pattern_start + 1 {
            return None;
        }
        let pattern = &raw_command[pattern_start..raw_command.len() - 1];
        let vm = self.machine.get_vm();
        let vm = vm.lock().unwrap();
        match vm.get_memory().search(start, end, pattern) {
            Some(address) => {
                Some(io::generate_response(&format!("1,{}", hex::format_hex32(address))))
            }
            None => Some(io::generate_response("0")),
        }
    }
}
