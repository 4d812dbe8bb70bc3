// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use byteorder::{ByteOrder, LittleEndian};
use tin86_emu::cpu::{Reg, SegReg};
use tin86_emu::system::{MachineHandle, VirtualMachine};

use super::hex;
use super::io;

/// Slots in the gdb i386 register file: 0-7 general registers, 8 program
/// counter, 9 flags, 10-15 segment registers.
const REGISTER_COUNT: usize = 16;

pub struct RegisterHandler {
    machine: MachineHandle,
}

impl RegisterHandler {
    pub fn new(machine: MachineHandle) -> Self {
        RegisterHandler { machine }
    }

    pub fn read_all(&self) -> String {
        let vm = self.machine.get_vm();
        let vm = vm.lock().unwrap();
        let mut data = String::with_capacity(REGISTER_COUNT * 8);
        for index in 0..REGISTER_COUNT {
            data.push_str(&hex::format_hex32(read_register(&vm, index)));
        }
        io::generate_response(&data)
    }

    pub fn read_one(&self, content: &str) -> String {
        match hex::parse_u32(content) {
            Some(index) => {
                let vm = self.machine.get_vm();
                let vm = vm.lock().unwrap();
                io::generate_response(&hex::format_hex32(read_register(&vm, index as usize)))
            }
            None => {
                error!(target: "gdb", "Register read with unparseable index {}", content);
                io::generate_unsupported_response()
            }
        }
    }

    pub fn write_all(&self, content: &str) -> String {
        let data = match hex::decode(content) {
            Some(data) => data,
            None => {
                error!(target: "gdb", "Register file write with unparseable data");
                return io::generate_unsupported_response();
            }
        };
        let vm = self.machine.get_vm();
        let mut vm = vm.lock().unwrap();
        for (index, chunk) in data.chunks(4).enumerate() {
            if chunk.len() == 4 {
                write_register(&mut vm, index, LittleEndian::read_u32(chunk) as u16);
            }
        }
        io::generate_response("OK")
    }

    pub fn write_one(&self, content: &str) -> String {
        let mut parts = content.splitn(2, '=');
        let index = parts.next().and_then(hex::parse_u32);
        let value = parts.next().and_then(hex::parse_u32);
        match (index, value) {
            (Some(index), Some(value)) => {
                let vm = self.machine.get_vm();
                let mut vm = vm.lock().unwrap();
                write_register(&mut vm, index as usize, value.swap_bytes() as u16);
                io::generate_response("OK")
            }
            _ => {
                error!(target: "gdb", "Register write with unparseable arguments {}", content);
                io::generate_unsupported_response()
            }
        }
    }
}

/// Reads one register slot. The program counter slot reports the physical
/// CS:IP address so gdb can place its next fetch; slots past the register
/// file read as zero.
fn read_register(vm: &VirtualMachine, index: usize) -> u32 {
    let processor = vm.get_processor();
    match index {
        0..=7 => processor.get_register(Reg::word(index as u8)),
        8 => processor.fetch_address(),
        9 => processor.flags.value(),
        10..=15 => u32::from(processor.get_segment(segment_register(index))),
        _ => 0,
    }
}

/// Writes one register slot. The program counter slot only updates IP,
/// writes past the register file are acknowledged and dropped.
fn write_register(vm: &mut VirtualMachine, index: usize, value: u16) {
    let processor = vm.get_processor_mut();
    match index {
        0..=7 => processor.set_register(Reg::word(index as u8), u32::from(value)),
        8 => processor.set_ip(value),
        9 => processor.flags.set_word(value),
        10..=15 => processor.set_segment(segment_register(index), value),
        _ => {}
    }
}

/// gdb orders the segment slots CS, SS, DS, ES, FS, GS.
fn segment_register(index: usize) -> SegReg {
    match index {
        10 => SegReg::CS,
        11 => SegReg::SS,
        12 => SegReg::DS,
        13 => SegReg::ES,
        14 => SegReg::FS,
        15 => SegReg::GS,
        _ => panic!("invalid segment slot {}", index),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tin86_core::util::SegmentedAddress;
    use tin86_emu::system::Machine;

    fn handler() -> RegisterHandler {
        let mut machine = Machine::build(0x2000);
        machine
            .load_program("test", &[0x90], SegmentedAddress::new(0x0100, 0x0100))
            .unwrap();
        RegisterHandler::new(machine.debug_handle())
    }

    #[test]
    fn program_counter_slot_reads_physical_address() {
        let handler = handler();
        assert_eq!(io::generate_response("00110000"), handler.read_one("8"));
    }

    #[test]
    fn program_counter_slot_round_trips_when_cs_is_zero() {
        let handler = handler();
        {
            let vm = handler.machine.get_vm();
            let mut vm = vm.lock().unwrap();
            vm.get_processor_mut().set_segment(SegReg::CS, 0x0000);
        }
        assert_eq!(io::generate_response("OK"), handler.write_one("8=50010000"));
        assert_eq!(io::generate_response("50010000"), handler.read_one("8"));
    }

    #[test]
    fn segment_slots_follow_gdb_order() {
        let handler = handler();
        {
            let vm = handler.machine.get_vm();
            let mut vm = vm.lock().unwrap();
            let processor = vm.get_processor_mut();
            processor.set_segment(SegReg::SS, 0x0200);
            processor.set_segment(SegReg::DS, 0x0300);
            processor.set_segment(SegReg::ES, 0x0400);
            processor.set_segment(SegReg::FS, 0x0500);
            processor.set_segment(SegReg::GS, 0x0600);
        }
        assert_eq!(io::generate_response(&hex::format_hex32(0x0100)), handler.read_one("a"));
        assert_eq!(io::generate_response(&hex::format_hex32(0x0200)), handler.read_one("b"));
        assert_eq!(io::generate_response(&hex::format_hex32(0x0300)), handler.read_one("c"));
        assert_eq!(io::generate_response(&hex::format_hex32(0x0400)), handler.read_one("d"));
        assert_eq!(io::generate_response(&hex::format_hex32(0x0500)), handler.read_one("e"));
        assert_eq!(io::generate_response(&hex::format_hex32(0x0600)), handler.read_one("f"));
    }

    #[test]
    fn write_one_takes_little_endian_values() {
        let handler = handler();
        assert_eq!(io::generate_response("OK"), handler.write_one("0=34120000"));
        let vm = handler.machine.get_vm();
        let vm = vm.lock().unwrap();
        assert_eq!(0x1234, vm.get_processor().get_register(Reg::AX));
    }

    #[test]
    fn register_file_round_trips_through_write_all() {
        let handler = handler();
        let values: [u16; 16] = [
            0x1111, 0x2222, 0x3333, 0x4444, 0x5555, 0x6666, 0x7777, 0x8888, 0x0150, 0x0246,
            0x0100, 0x0210, 0x0320, 0x0430, 0x0540, 0x0650,
        ];
        let mut content = String::new();
        for value in values.iter() {
            content.push_str(&hex::format_hex32(u32::from(*value)));
        }
        assert_eq!(io::generate_response("OK"), handler.write_all(&content));
        for index in 0..16 {
            if index == 8 {
                continue;
            }
            let expected = io::generate_response(&hex::format_hex32(u32::from(values[index])));
            assert_eq!(expected, handler.read_one(&format!("{:x}", index)), "slot {}", index);
        }
        // The program counter slot reads back as a physical address built
        // from the CS and IP that were just written.
        assert_eq!(io::generate_response(&hex::format_hex32(0x1150)), handler.read_one("8"));
    }

    #[test]
    fn slots_past_the_register_file_read_zero_and_ignore_writes() {
        let handler = handler();
        assert_eq!(io::generate_response("OK"), handler.write_one("10=01000000"));
        assert_eq!(io::generate_response("00000000"), handler.read_one("10"));
    }

    #[test]
    fn unparseable_arguments_are_unsupported() {
        let handler = handler();
        assert_eq!("", handler.read_one("zz"));
        assert_eq!("", handler.write_one("0"));
        assert_eq!("", handler.write_all("xy"));
    }
}
