// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use tin86_core::util::to_physical;
use tin86_emu::cpu::{Reg, SegReg};
use tin86_emu::mem::PhysicalMemory;
use tin86_emu::system::{BreakPoint, BreakPointFn, BreakPointType, MachineHandle};

use super::hex;
use super::io;

const VALID_RETURN_TYPES: &str = "NEAR, FAR, INTERRUPT, MACHINE";

/// Interpretation of the word on top of the stack for `peekRet`.
enum ReturnType {
    Near,
    Far,
    Interrupt,
    Machine,
}

/// Console style commands tunneled through `qRcmd`, reachable from gdb as
/// `monitor <command>`.
pub struct MonitorHandler {
    machine: MachineHandle,
    on_reached: BreakPointFn,
}

impl MonitorHandler {
    pub fn new(machine: MachineHandle, on_reached: BreakPointFn) -> Self {
        MonitorHandler {
            machine,
            on_reached,
        }
    }

    /// `qRcmd,hex`. The payload is a hex encoded console command.
    pub fn handle(&self, content: &str) -> String {
        let mut parts = content.splitn(2, ',');
        let _ = parts.next();
        let encoded = match parts.next() {
            Some(encoded) => encoded,
            None => return io::generate_response(""),
        };
        let bytes = match hex::decode(encoded) {
            Some(bytes) => bytes,
            None => {
                error!(target: "gdb", "Monitor command with broken hex encoding {}", encoded);
                return io::generate_unsupported_response();
            }
        };
        let text = String::from_utf8_lossy(&bytes).to_string();
        let args: Vec<&str> = text.split(' ').collect();
        self.execute(&args)
    }

    fn execute(&self, args: &[&str]) -> String {
        match args[0].to_lowercase().as_str() {
            "help" => self.help(""),
            "state" => self.state(),
            "breakstop" => self.break_stop(),
            "callstack" => io::generate_unsupported_response(),
            "peekret" => self.peek_return(args),
            "breakcycles" => self.break_cycles(args),
            "breakcsip" => self.break_cs_ip(args),
            _ => self.invalid_command(args[0]),
        }
    }

    fn help(&self, additional: &str) -> String {
        io::generate_message_response(&format!(
            "{}\nSupported custom commands:\
             \n -help: display this\
             \n - breakCycles <number of cycles to wait before break>: breaks after the given number of cycles is reached\
             \n - breakCsIp <number for CS, number for IP>: breaks once CS and IP match and before the instruction is executed\
             \n - breakStop: setups a breakpoint when machine shuts down\
             \n - callStack: dumps the callstack to see in which function you are in the VM.\
             \n - peekRet<optional type>: displays the return address of the current function as stored in the stack in RAM. If a parameter is provided, dump the return on the stack as if the return was one of the provided type. Valid values are: {}\
             \n - state: displays the state of the machine\n",
            additional, VALID_RETURN_TYPES
        ))
    }

    fn invalid_command(&self, command: &str) -> String {
        self.help(&format!("Invalid command {}\n", command))
    }

    fn state(&self) -> String {
        let vm = self.machine.get_vm();
        let vm = vm.lock().unwrap();
        let processor = vm.get_processor();
        let message = format!(
            "Cycles={} CS:IP=0x{:X}:0x{:X}/0x{:X} AX=0x{:X} BX=0x{:X} CX=0x{:X} DX=0x{:X} \
             SI=0x{:X} DI=0x{:X} BP=0x{:X} SP=0x{:X} SS=0x{:X} DS=0x{:X} ES=0x{:X} FS=0x{:X} \
             GS=0x{:X} flags=0x{:X}",
            vm.get_cycles(),
            processor.get_segment(SegReg::CS),
            processor.ip(),
            processor.fetch_address(),
            processor.get_register(Reg::AX),
            processor.get_register(Reg::BX),
            processor.get_register(Reg::CX),
            processor.get_register(Reg::DX),
            processor.get_register(Reg::SI),
            processor.get_register(Reg::DI),
            processor.get_register(Reg::BP),
            processor.get_register(Reg::SP),
            processor.get_segment(SegReg::SS),
            processor.get_segment(SegReg::DS),
            processor.get_segment(SegReg::ES),
            processor.get_segment(SegReg::FS),
            processor.get_segment(SegReg::GS),
            processor.flags.value(),
        );
        io::generate_message_response(&message)
    }

    fn break_stop(&self) -> String {
        let breakpoint =
            BreakPoint::unconditional(BreakPointType::MachineStop, self.on_reached.clone(), false);
        self.machine
            .get_breakpoints()
            .toggle_breakpoint(Some(&breakpoint), true);
        io::generate_message_response("Breakpoint added for end of execution.")
    }

    fn break_cycles(&self, args: &[&str]) -> String {
        if args.len() != 2 {
            return self.invalid_command("breakCycles can only work with one argument.");
        }
        match args[1].parse::<u64>() {
            Ok(cycles) => {
                let current = {
                    let vm = self.machine.get_vm();
                    let vm = vm.lock().unwrap();
                    vm.get_cycles()
                };
                let target = current + cycles;
                let breakpoint =
                    BreakPoint::new(BreakPointType::Cycles, target, self.on_reached.clone(), true);
                self.machine
                    .get_breakpoints()
                    .toggle_breakpoint(Some(&breakpoint), true);
                io::generate_message_response(&format!(
                    "Breakpoint added for cycles. Current cycles is {}. Will wait for {}. \
                     Will stop at {}",
                    current, cycles, target
                ))
            }
            Err(_) => self.invalid_command(&format!(
                "breakCycles argument needs to be a number. You gave {}",
                args[1]
            )),
        }
    }

    fn break_cs_ip(&self, args: &[&str]) -> String {
        if args.len() != 3 {
            return self.invalid_command("breakCsIp can only work with two arguments.");
        }
        match (hex::parse_u32(args[1]), hex::parse_u32(args[2])) {
            (Some(cs), Some(ip)) => {
                let address = to_physical(cs as u16, ip as u16);
                let breakpoint = BreakPoint::new(
                    BreakPointType::Execution,
                    u64::from(address),
                    self.on_reached.clone(),
                    false,
                );
                self.machine
                    .get_breakpoints()
                    .toggle_breakpoint(Some(&breakpoint), true);
                let (current_cs, current_ip) = {
                    let vm = self.machine.get_vm();
                    let vm = vm.lock().unwrap();
                    let processor = vm.get_processor();
                    (processor.get_segment(SegReg::CS), processor.ip())
                };
                io::generate_message_response(&format!(
                    "Breakpoint added for cs:ip. Current cs:ip is {}:{}. Will stop at {}:{}",
                    current_cs, current_ip, cs, ip
                ))
            }
            _ => self.invalid_command(&format!(
                "breakCsIp arguments need to be two numbers. You gave {}:{}",
                args[1], args[2]
            )),
        }
    }

    fn peek_return(&self, args: &[&str]) -> String {
        if args.len() >= 2 {
            match return_type(args[1]) {
                Some(return_type) => self.peek_return_of(return_type),
                None => io::generate_message_response(&format!(
                    "Could not understand {} as a return type. Valid values are: {}",
                    args[1], VALID_RETURN_TYPES
                )),
            }
        } else {
            self.peek_return_of(ReturnType::Near)
        }
    }

    fn peek_return_of(&self, return_type: ReturnType) -> String {
        let vm = self.machine.get_vm();
        let vm = vm.lock().unwrap();
        let processor = vm.get_processor();
        let memory = vm.get_memory();
        let ss = processor.get_segment(SegReg::SS);
        let sp = processor.get_register(Reg::SP) as u16;
        let representation = match return_type {
            ReturnType::Near => {
                let offset = peek_word(memory, ss, sp);
                segmented(processor.get_segment(SegReg::CS), offset)
            }
            ReturnType::Far | ReturnType::Interrupt => {
                let offset = peek_word(memory, ss, sp);
                let segment = peek_word(memory, ss, sp.wrapping_add(2));
                segmented(segment, offset)
            }
            ReturnType::Machine => "null".to_string(),
        };
        io::generate_message_response(&representation)
    }
}

fn return_type(text: &str) -> Option<ReturnType> {
    match text {
        "NEAR" => Some(ReturnType::Near),
        "FAR" => Some(ReturnType::Far),
        "INTERRUPT" => Some(ReturnType::Interrupt),
        "MACHINE" => Some(ReturnType::Machine),
        _ => None,
    }
}

fn segmented(segment: u16, offset: u16) -> String {
    format!("0x{:X}:0x{:X}", segment, offset)
}

/// Reads a stack word without tripping watchpoints.
fn peek_word(memory: &PhysicalMemory, segment: u16, offset: u16) -> u16 {
    let address = to_physical(segment, offset);
    let low = memory.inspect_byte(address).unwrap_or(0xff);
    let high = memory.inspect_byte(address.wrapping_add(1)).unwrap_or(0xff);
    u16::from(low) | (u16::from(high) << 8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tin86_core::util::SegmentedAddress;
    use tin86_emu::system::Machine;

    fn handler() -> MonitorHandler {
        let mut machine = Machine::build(0x20000);
        machine
            .load_program("test", &[0x90], SegmentedAddress::new(0x0100, 0x0100))
            .unwrap();
        MonitorHandler::new(machine.debug_handle(), Arc::new(|_| {}))
    }

    fn run(handler: &MonitorHandler, command: &str) -> String {
        let content = format!("Rcmd,{}", hex::encode(command.as_bytes()));
        decode_message(&handler.handle(&content))
    }

    fn decode_message(reply: &str) -> String {
        assert!(reply.starts_with("+$") && reply.len() >= 5, "reply {:?}", reply);
        let payload = &reply[2..reply.len() - 3];
        String::from_utf8(hex::decode(payload).unwrap()).unwrap()
    }

    #[test]
    fn state_reports_cycles_registers_and_flags() {
        let handler = handler();
        let message = run(&handler, "state");
        assert!(message.starts_with("Cycles=0 CS:IP=0x100:0x100/0x1100 AX=0x0 "), "{}", message);
        assert!(message.contains(" SP=0xFFFE "), "{}", message);
        assert!(message.ends_with(" flags=0x2\n"), "{}", message);
    }

    #[test]
    fn help_lists_the_custom_commands() {
        let handler = handler();
        let message = run(&handler, "help");
        assert!(message.starts_with("\nSupported custom commands:\n -help: display this\n"));
        assert!(message.contains(" - breakStop: setups a breakpoint when machine shuts down\n"));
        assert!(message.contains("Valid values are: NEAR, FAR, INTERRUPT, MACHINE\n"));
    }

    #[test]
    fn unknown_commands_are_reported_with_the_original_spelling() {
        let handler = handler();
        let message = run(&handler, "Bogus");
        assert!(message.starts_with("Invalid command Bogus\n\nSupported custom commands:"));
    }

    #[test]
    fn break_cycles_reports_current_and_target_counts() {
        let handler = handler();
        let message = run(&handler, "breakCycles 5");
        assert_eq!(
            "Breakpoint added for cycles. Current cycles is 0. Will wait for 5. Will stop at 5\n",
            message
        );
    }

    #[test]
    fn break_cycles_wants_a_decimal_number() {
        let handler = handler();
        let message = run(&handler, "breakCycles x5");
        assert!(message.starts_with("Invalid command breakCycles argument needs to be a number. You gave x5\n"));
    }

    #[test]
    fn break_cs_ip_reports_decimal_values() {
        let handler = handler();
        let message = run(&handler, "breakCsIp 100 100");
        assert_eq!(
            "Breakpoint added for cs:ip. Current cs:ip is 256:256. Will stop at 256:256\n",
            message
        );
    }

    #[test]
    fn break_stop_acknowledges() {
        let handler = handler();
        assert_eq!("Breakpoint added for end of execution.\n", run(&handler, "breakStop"));
    }

    #[test]
    fn peek_ret_defaults_to_a_near_return() {
        let handler = handler();
        {
            let vm = handler.machine.get_vm();
            let mut vm = vm.lock().unwrap();
            vm.get_memory_mut()
                .write_bytes(0x10ffe, &[0xcd, 0xab])
                .unwrap();
        }
        assert_eq!("0x100:0xABCD\n", run(&handler, "peekRet"));
    }

    #[test]
    fn peek_ret_far_reads_segment_and_offset() {
        let handler = handler();
        {
            let vm = handler.machine.get_vm();
            let mut vm = vm.lock().unwrap();
            vm.get_processor_mut().set_register(Reg::SP, 0x2000);
            vm.get_memory_mut()
                .write_bytes(0x3000, &[0x34, 0x12, 0x78, 0x56])
                .unwrap();
        }
        assert_eq!("0x5678:0x1234\n", run(&handler, "peekRet FAR"));
    }

    #[test]
    fn peek_ret_machine_has_no_stack_frame() {
        let handler = handler();
        assert_eq!("null\n", run(&handler, "peekRet MACHINE"));
    }

    #[test]
    fn peek_ret_types_are_case_sensitive() {
        let handler = handler();
        let expected =
            "Could not understand near as a return type. Valid values are: NEAR, FAR, INTERRUPT, MACHINE\n";
        assert_eq!(expected, run(&handler, "peekRet near"));
    }

    #[test]
    fn missing_payload_answers_an_empty_frame() {
        let handler = handler();
        assert_eq!(io::generate_response(""), handler.handle("Rcmd"));
    }

    #[test]
    fn broken_hex_payload_is_unsupported() {
        let handler = handler();
        assert_eq!("", handler.handle("Rcmd,zz"));
    }
}
