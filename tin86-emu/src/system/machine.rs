// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tin86_core::factory::{EventListener, MachineEvent, MachineState, PortDevice};
use tin86_core::util::{new_shared, SegmentedAddress, Shared};

use crate::cpu::{Flow, Processor};
use crate::io::PortDispatcher;
use crate::mem::PhysicalMemory;
use crate::system::{BreakPointHolder, MachineBreakpoints, PauseHandler, VirtualMachine};

// Design:
//   The run loop checks breakpoints against the upcoming fetch address
//   and the retired instruction count before executing, then honors a
//   pending pause, then steps. Checking first means an execution
//   breakpoint on the entry point fires before its instruction runs and
//   a single step breakpoint stops after exactly one more instruction.
//   The machine lock is held only across a step, never while parked, so
//   a debugger can inspect state while the machine is paused.

pub struct Machine {
    // Components
    vm: Shared<VirtualMachine>,
    breakpoints: MachineBreakpoints,
    pause_handler: PauseHandler,
    // Runtime State
    halt: Arc<AtomicBool>,
    state: MachineState,
    listeners: Vec<EventListener>,
    program_loaded: bool,
}

/// Cloneable view of the shared machine internals handed to the debug
/// server and other controller threads.
#[derive(Clone)]
pub struct MachineHandle {
    vm: Shared<VirtualMachine>,
    breakpoints: MachineBreakpoints,
    pause_handler: PauseHandler,
    halt: Arc<AtomicBool>,
}

impl Machine {
    pub fn build(memory_size: usize) -> Machine {
        let pause_handler = PauseHandler::new();
        let memory_read = BreakPointHolder::new();
        let memory_write = BreakPointHolder::new();
        let breakpoints = MachineBreakpoints::new(
            pause_handler.clone(),
            memory_read.clone(),
            memory_write.clone(),
        );
        let memory = PhysicalMemory::new(memory_size, memory_read, memory_write);
        let vm = VirtualMachine::new(Processor::new(), memory, PortDispatcher::new());
        Machine {
            vm: new_shared(vm),
            breakpoints,
            pause_handler,
            halt: Arc::new(AtomicBool::new(false)),
            state: MachineState::NoProgram,
            listeners: Vec::new(),
            program_loaded: false,
        }
    }

    pub fn debug_handle(&self) -> MachineHandle {
        MachineHandle {
            vm: self.vm.clone(),
            breakpoints: self.breakpoints.clone(),
            pause_handler: self.pause_handler.clone(),
            halt: self.halt.clone(),
        }
    }

    pub fn add_listener(&mut self, listener: EventListener) {
        self.listeners.push(listener);
    }

    pub fn register_device(&mut self, port: u16, device: Shared<dyn PortDevice>) {
        self.vm.lock().unwrap().get_ports_mut().register(port, device);
    }

    pub fn load_program(
        &mut self,
        name: &str,
        image: &[u8],
        entry: SegmentedAddress,
    ) -> Result<(), String> {
        self.vm
            .lock()
            .unwrap()
            .load_program(image, entry.segment, entry.offset)?;
        self.program_loaded = true;
        info!(
            target: "machine",
            "Loaded {} ({} bytes) at {}",
            name,
            image.len(),
            entry
        );
        let event = MachineEvent::ProcessChanged(name.to_string());
        self.notify(&event);
        Ok(())
    }

    /// Run until the program exits, the machine is halted from another
    /// thread, or an instruction fails to decode.
    pub fn run(&mut self) -> Result<u8, String> {
        if !self.program_loaded {
            return Err("no program loaded".to_string());
        }
        self.set_state(MachineState::Running);
        let exit_code = loop {
            if self.halt.load(Ordering::Relaxed) {
                break 0;
            }
            let (fetch_address, cycles) = {
                let vm = self.vm.lock().unwrap();
                (vm.get_processor().fetch_address(), vm.get_cycles())
            };
            self.breakpoints.check_execution(u64::from(fetch_address));
            self.breakpoints.check_cycles(cycles);
            if self.pause_handler.is_pause_requested() {
                self.set_state(MachineState::Paused);
                self.pause_handler.wait_if_paused();
                if self.halt.load(Ordering::Relaxed) {
                    break 0;
                }
                self.set_state(MachineState::Running);
            }
            let flow = self.vm.lock().unwrap().step();
            match flow {
                Ok(Flow::Exit(code)) => break code,
                Ok(_) => {}
                Err(error) => {
                    let message = format!("execution error: {}", error);
                    error!(target: "machine", "{}", message);
                    self.set_state(MachineState::Error);
                    let event = MachineEvent::Error(message.clone());
                    self.notify(&event);
                    self.breakpoints.on_machine_stop();
                    return Err(message);
                }
            }
        };
        info!(target: "machine", "Program exited with code {}", exit_code);
        self.set_state(MachineState::ProgramExited);
        self.breakpoints.on_machine_stop();
        Ok(exit_code)
    }

    fn set_state(&mut self, state: MachineState) {
        if self.state != state {
            info!(target: "machine", "State {:?} -> {:?}", self.state, state);
            self.state = state;
            let event = MachineEvent::StateChanged(state);
            self.notify(&event);
        }
    }

    fn notify(&mut self, event: &MachineEvent) {
        for listener in self.listeners.iter_mut() {
            listener(event);
        }
    }
}

impl MachineHandle {
    pub fn get_vm(&self) -> Shared<VirtualMachine> {
        self.vm.clone()
    }

    pub fn get_breakpoints(&self) -> MachineBreakpoints {
        self.breakpoints.clone()
    }

    pub fn get_pause_handler(&self) -> PauseHandler {
        self.pause_handler.clone()
    }

    /// Stop the run loop. Wakes the machine if it is parked so the halt
    /// is observed promptly.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::Relaxed);
        self.pause_handler.request_resume();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn machine_with_program(program: &[u8]) -> Machine {
        let mut machine = Machine::build(0x4000);
        machine
            .load_program("test.com", program, SegmentedAddress::new(0x0100, 0x0100))
            .unwrap();
        machine
    }

    #[test]
    fn run_without_program_fails() {
        let mut machine = Machine::build(0x1000);
        assert!(machine.run().is_err());
    }

    #[test]
    fn run_to_dos_exit_reports_the_code() {
        // MOV AX, 0x4C07; INT 0x21
        let mut machine = machine_with_program(&[0xb8, 0x07, 0x4c, 0xcd, 0x21]);
        assert_eq!(Ok(7), machine.run());
    }

    #[test]
    fn run_emits_lifecycle_events() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let mut machine = Machine::build(0x4000);
        machine.add_listener(Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
        }));
        machine
            .load_program("hello.com", &[0xcd, 0x20], SegmentedAddress::new(0x0100, 0x0100))
            .unwrap();
        machine.run().unwrap();
        let events = events.lock().unwrap();
        assert_eq!(
            MachineEvent::ProcessChanged("hello.com".to_string()),
            events[0]
        );
        assert_eq!(
            MachineEvent::StateChanged(MachineState::Running),
            events[1]
        );
        assert_eq!(
            MachineEvent::StateChanged(MachineState::ProgramExited),
            events[2]
        );
    }

    #[test]
    fn decode_failure_surfaces_an_error_event() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        // 0F is not a valid opcode here.
        let mut machine = machine_with_program(&[0x0f]);
        machine.add_listener(Box::new(move |event| {
            if let MachineEvent::Error(message) = event {
                sink.lock().unwrap().push(message.clone());
            }
        }));
        assert!(machine.run().is_err());
        assert_eq!(1, events.lock().unwrap().len());
    }
}
