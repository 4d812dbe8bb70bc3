// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use tin86_core::util::to_physical;

use crate::cpu::{execute, DecodeError, Flow, Instruction, Processor, Reg, SegReg};
use crate::io::PortDispatcher;
use crate::mem::PhysicalMemory;

/// Processor, memory and port dispatch bundled into a single stepping
/// unit. One instruction per step; the caller owns the run loop.
pub struct VirtualMachine {
    // Components
    processor: Processor,
    memory: PhysicalMemory,
    ports: PortDispatcher,
    // Runtime State
    total_instructions: u64,
}

impl VirtualMachine {
    pub fn new(processor: Processor, memory: PhysicalMemory, ports: PortDispatcher) -> Self {
        VirtualMachine {
            processor,
            memory,
            ports,
            total_instructions: 0,
        }
    }

    pub fn get_processor(&self) -> &Processor {
        &self.processor
    }

    pub fn get_processor_mut(&mut self) -> &mut Processor {
        &mut self.processor
    }

    pub fn get_memory(&self) -> &PhysicalMemory {
        &self.memory
    }

    pub fn get_memory_mut(&mut self) -> &mut PhysicalMemory {
        &mut self.memory
    }

    pub fn get_ports_mut(&mut self) -> &mut PortDispatcher {
        &mut self.ports
    }

    /// Number of retired instructions since the machine was built.
    pub fn get_cycles(&self) -> u64 {
        self.total_instructions
    }

    /// Place a flat program image in memory and point the processor at
    /// it, com style: all segments equal, stack at the top of the segment.
    pub fn load_program(&mut self, image: &[u8], segment: u16, offset: u16) -> Result<(), String> {
        self.memory.write_bytes(to_physical(segment, offset), image)?;
        for seg in &[SegReg::CS, SegReg::DS, SegReg::ES, SegReg::SS] {
            self.processor.set_segment(*seg, segment);
        }
        self.processor.set_ip(offset);
        self.processor.set_register(Reg::SP, 0xfffe);
        Ok(())
    }

    /// Decode, execute and retire a single instruction.
    pub fn step(&mut self) -> Result<Flow, DecodeError> {
        let instruction = Instruction::decode(
            &self.memory,
            self.processor.get_segment(SegReg::CS),
            self.processor.ip(),
        )?;
        self.processor.prefixes = instruction.prefixes;
        let flow = execute(
            &mut self.processor,
            &mut self.memory,
            &mut self.ports,
            &instruction,
        );
        self.processor.instruction_epilogue(instruction.len, &flow);
        self.total_instructions += 1;
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::BreakPointHolder;

    fn vm_with_program(program: &[u8]) -> VirtualMachine {
        let memory = PhysicalMemory::new(0x4000, BreakPointHolder::new(), BreakPointHolder::new());
        let mut vm = VirtualMachine::new(Processor::new(), memory, PortDispatcher::new());
        vm.load_program(program, 0x0100, 0x0100).unwrap();
        vm
    }

    #[test]
    fn load_program_points_all_segments_at_the_image() {
        let vm = vm_with_program(&[0x90]);
        assert_eq!(0x0100, vm.get_processor().get_segment(SegReg::CS));
        assert_eq!(0x0100, vm.get_processor().get_segment(SegReg::SS));
        assert_eq!(0x0100, vm.get_processor().ip());
        assert_eq!(0xfffe, vm.get_processor().get_register(Reg::SP));
        assert_eq!(0x90, vm.get_memory().get_byte(0x1100));
    }

    #[test]
    fn step_retires_instructions_and_counts_them() {
        // MOV AX, 2; ADD AX, 3; HLT
        let mut vm = vm_with_program(&[0xb8, 0x02, 0x00, 0x05, 0x03, 0x00, 0xf4]);
        assert_eq!(Flow::Next, vm.step().unwrap());
        assert_eq!(Flow::Next, vm.step().unwrap());
        assert_eq!(Flow::Exit(0), vm.step().unwrap());
        assert_eq!(5, vm.get_processor().get_register(Reg::AX));
        assert_eq!(3, vm.get_cycles());
    }

    #[test]
    fn step_surfaces_decode_failure() {
        let mut vm = vm_with_program(&[0x0f]);
        assert!(vm.step().is_err());
    }

    #[test]
    fn fetch_address_follows_cs_ip() {
        let vm = vm_with_program(&[0x90]);
        assert_eq!(0x1100, vm.get_processor().fetch_address());
    }
}
