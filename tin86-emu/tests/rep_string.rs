// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::sync::{Arc, Mutex};

use tin86_core::factory::PortDevice;
use tin86_core::util::{new_shared, to_physical};
use tin86_emu::cpu::{Flow, Processor, Reg};
use tin86_emu::io::PortDispatcher;
use tin86_emu::mem::PhysicalMemory;
use tin86_emu::system::{BreakPointHolder, VirtualMachine};

struct Recorder {
    writes: Arc<Mutex<Vec<u8>>>,
}

impl PortDevice for Recorder {
    fn read_byte(&mut self, _port: u16) -> u8 {
        0
    }

    fn write_byte(&mut self, _port: u16, value: u8) {
        self.writes.lock().unwrap().push(value);
    }
}

fn setup(program: &[u8]) -> (VirtualMachine, Arc<Mutex<Vec<u8>>>) {
    let writes = Arc::new(Mutex::new(Vec::new()));
    let memory = PhysicalMemory::new(0x4000, BreakPointHolder::new(), BreakPointHolder::new());
    let mut ports = PortDispatcher::new();
    ports.register(
        0x00e9,
        new_shared(Recorder {
            writes: writes.clone(),
        }),
    );
    let mut vm = VirtualMachine::new(Processor::new(), memory, ports);
    vm.load_program(program, 0x0100, 0x0100).unwrap();
    vm
        .get_processor_mut()
        .set_register(Reg::DX, 0x00e9);
    (vm, writes)
}

#[test]
fn rep_outsb_with_count_3_writes_3_bytes() {
    // F3 6E is REP OUTSB.
    let (mut vm, writes) = setup(&[0xf3, 0x6e, 0xf4]);
    vm.get_memory_mut()
        .write_bytes(to_physical(0x0100, 0x0200), &[0x41, 0x42, 0x43])
        .unwrap();
    vm.get_processor_mut().set_register(Reg::SI, 0x0200);
    vm.get_processor_mut().set_register(Reg::CX, 3);
    // Three iterations rewind onto the same instruction, the fourth step
    // observes the exhausted counter and falls through.
    assert_eq!(Flow::Rewind, vm.step().unwrap());
    assert_eq!(0x0100, vm.get_processor().ip());
    assert_eq!(Flow::Rewind, vm.step().unwrap());
    assert_eq!(Flow::Rewind, vm.step().unwrap());
    assert_eq!(Flow::Next, vm.step().unwrap());
    assert_eq!(vec![0x41, 0x42, 0x43], *writes.lock().unwrap());
    assert_eq!(0, vm.get_processor().get_register(Reg::CX));
    assert_eq!(0x0203, vm.get_processor().get_register(Reg::SI));
    assert_eq!(0x0102, vm.get_processor().ip());
}

#[test]
fn rep_outsb_with_count_0_does_nothing() {
    let (mut vm, writes) = setup(&[0xf3, 0x6e, 0xf4]);
    vm.get_processor_mut().set_register(Reg::SI, 0x0200);
    vm.get_processor_mut().set_register(Reg::CX, 0);
    assert_eq!(Flow::Next, vm.step().unwrap());
    assert!(writes.lock().unwrap().is_empty());
    assert_eq!(0x0200, vm.get_processor().get_register(Reg::SI));
    assert_eq!(0x0102, vm.get_processor().ip());
}

#[test]
fn outsb_without_prefix_runs_exactly_once() {
    // 6E is OUTSB with no repeat prefix; CX is not consulted.
    let (mut vm, writes) = setup(&[0x6e, 0xf4]);
    vm.get_memory_mut()
        .write_bytes(to_physical(0x0100, 0x0200), &[0x55])
        .unwrap();
    vm.get_processor_mut().set_register(Reg::SI, 0x0200);
    vm.get_processor_mut().set_register(Reg::CX, 5);
    assert_eq!(Flow::Next, vm.step().unwrap());
    assert_eq!(vec![0x55], *writes.lock().unwrap());
    assert_eq!(5, vm.get_processor().get_register(Reg::CX));
    assert_eq!(0x0201, vm.get_processor().get_register(Reg::SI));
}

#[test]
fn direction_flag_walks_the_source_backwards() {
    let (mut vm, writes) = setup(&[0xf3, 0x6e, 0xf4]);
    vm.get_memory_mut()
        .write_bytes(to_physical(0x0100, 0x0200), &[0x41, 0x42, 0x43])
        .unwrap();
    vm.get_processor_mut().flags.set_direction(true);
    vm.get_processor_mut().set_register(Reg::SI, 0x0202);
    vm.get_processor_mut().set_register(Reg::CX, 3);
    for _ in 0..4 {
        vm.step().unwrap();
    }
    assert_eq!(vec![0x43, 0x42, 0x41], *writes.lock().unwrap());
    assert_eq!(0x01ff, vm.get_processor().get_register(Reg::SI));
}

#[test]
fn rep_movsb_copies_through_ip_rewind() {
    let (mut vm, _writes) = setup(&[0xf3, 0xa4, 0xf4]);
    vm.get_memory_mut()
        .write_bytes(to_physical(0x0100, 0x0200), b"knock")
        .unwrap();
    vm.get_processor_mut().set_register(Reg::SI, 0x0200);
    vm.get_processor_mut().set_register(Reg::DI, 0x0300);
    vm.get_processor_mut().set_register(Reg::CX, 5);
    let mut steps = 0;
    loop {
        let flow = vm.step().unwrap();
        steps += 1;
        if flow == Flow::Next {
            break;
        }
        // Every rewind lands back on the prefix byte.
        assert_eq!(0x0100, vm.get_processor().ip());
    }
    assert_eq!(6, steps);
    assert_eq!(6, vm.get_cycles());
    let base = to_physical(0x0100, 0x0300);
    for (i, expected) in b"knock".iter().enumerate() {
        assert_eq!(*expected, vm.get_memory().get_byte(base + i as u32));
    }
}
