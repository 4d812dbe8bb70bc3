// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tin86_core::util::{to_physical, SegmentedAddress};
use tin86_emu::cpu::Reg;
use tin86_emu::system::{BreakPoint, BreakPointType, Machine, MachineHandle};

fn machine_with_program(program: &[u8]) -> Machine {
    let mut machine = Machine::build(0x8000);
    machine
        .load_program("test.com", program, SegmentedAddress::new(0x0100, 0x0100))
        .unwrap();
    machine
}

fn spin_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..2000 {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    false
}

fn pausing_breakpoint(
    handle: &MachineHandle,
    bp_type: BreakPointType,
    address: u64,
    one_shot: bool,
    hits: &Arc<AtomicUsize>,
) -> BreakPoint {
    let pause_handler = handle.get_pause_handler();
    let counter = hits.clone();
    BreakPoint::new(
        bp_type,
        address,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            pause_handler.request_pause();
        }),
        one_shot,
    )
}

#[test]
fn halt_stops_a_spinning_machine() {
    // EB FE jumps to itself.
    let mut machine = machine_with_program(&[0xeb, 0xfe]);
    let handle = machine.debug_handle();
    let runner = thread::spawn(move || machine.run());
    thread::sleep(Duration::from_millis(10));
    handle.halt();
    assert_eq!(Ok(0), runner.join().unwrap());
}

#[test]
fn execution_breakpoint_parks_before_the_instruction_runs() {
    // MOV AX, 0x4C07; INT 0x21
    let mut machine = machine_with_program(&[0xb8, 0x07, 0x4c, 0xcd, 0x21]);
    let handle = machine.debug_handle();
    let hits = Arc::new(AtomicUsize::new(0));
    let entry = u64::from(to_physical(0x0100, 0x0100));
    let breakpoint =
        pausing_breakpoint(&handle, BreakPointType::Execution, entry, false, &hits);
    handle
        .get_breakpoints()
        .toggle_breakpoint(Some(&breakpoint), true);
    let runner = thread::spawn(move || machine.run());
    let pause_handler = handle.get_pause_handler();
    assert!(spin_until(|| pause_handler.is_paused()));
    assert_eq!(1, hits.load(Ordering::SeqCst));
    // Parked ahead of the entry instruction: AX still holds its reset value.
    assert_eq!(0, handle.get_vm().lock().unwrap().get_processor().get_register(Reg::AX));
    // The debugger removes the breakpoint before resuming, like gdb does.
    handle
        .get_breakpoints()
        .toggle_breakpoint(Some(&breakpoint), false);
    pause_handler.request_resume();
    assert_eq!(Ok(7), runner.join().unwrap());
}

#[test]
fn one_shot_step_retires_exactly_one_instruction() {
    // NOP; JMP back to the NOP, so the machine never exits on its own.
    let mut machine = machine_with_program(&[0x90, 0xeb, 0xfd]);
    let handle = machine.debug_handle();
    let pause_handler = handle.get_pause_handler();
    let runner = thread::spawn(move || machine.run());
    pause_handler.request_pause_and_wait();
    let start_cycles = handle.get_vm().lock().unwrap().get_cycles();
    let hits = Arc::new(AtomicUsize::new(0));
    let step_handler = pause_handler.clone();
    let counter = hits.clone();
    let breakpoint = BreakPoint::unconditional(
        BreakPointType::Execution,
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            step_handler.request_pause();
        }),
        true,
    );
    handle
        .get_breakpoints()
        .toggle_breakpoint(Some(&breakpoint), true);
    pause_handler.request_resume();
    assert!(spin_until(|| pause_handler.is_paused()));
    assert_eq!(1, hits.load(Ordering::SeqCst));
    assert_eq!(
        start_cycles + 1,
        handle.get_vm().lock().unwrap().get_cycles()
    );
    handle.halt();
    assert_eq!(Ok(0), runner.join().unwrap());
}

#[test]
fn cycle_breakpoint_stops_at_the_target_count() {
    let mut machine = machine_with_program(&[0x90, 0x90, 0x90, 0xcd, 0x20]);
    let handle = machine.debug_handle();
    let hits = Arc::new(AtomicUsize::new(0));
    let breakpoint = pausing_breakpoint(&handle, BreakPointType::Cycles, 2, true, &hits);
    handle
        .get_breakpoints()
        .toggle_breakpoint(Some(&breakpoint), true);
    let pause_handler = handle.get_pause_handler();
    let runner = thread::spawn(move || machine.run());
    assert!(spin_until(|| pause_handler.is_paused()));
    assert_eq!(2, handle.get_vm().lock().unwrap().get_cycles());
    pause_handler.request_resume();
    assert_eq!(Ok(0), runner.join().unwrap());
    assert_eq!(1, hits.load(Ordering::SeqCst));
}

#[test]
fn write_watchpoint_counts_stores_to_its_address() {
    // C7 06 00 02 34 12 is MOV word [0x0200], 0x1234; then INT 0x20.
    let mut machine = machine_with_program(&[0xc7, 0x06, 0x00, 0x02, 0x34, 0x12, 0xcd, 0x20]);
    let handle = machine.debug_handle();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let breakpoint = BreakPoint::new(
        BreakPointType::Write,
        u64::from(to_physical(0x0100, 0x0200)),
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
        false,
    );
    handle
        .get_breakpoints()
        .toggle_breakpoint(Some(&breakpoint), true);
    let exit = machine.run();
    assert_eq!(Ok(0), exit);
    assert_eq!(1, hits.load(Ordering::SeqCst));
    assert_eq!(
        0x1234,
        handle
            .get_vm()
            .lock()
            .unwrap()
            .get_memory()
            .get_word(to_physical(0x0100, 0x0200))
    );
}
