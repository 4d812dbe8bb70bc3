// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::fmt;

use tin86_core::util::to_physical;

use super::processor::{Processor, Reg, SegReg};
use crate::mem::PhysicalMemory;

// Spec: Intel 8086 Family User's Manual, Table 4-20 (16-bit ModR/M
// effective address forms).
// Design:
//   Operands are decoded once into self-contained descriptors. Execution
//   never re-inspects opcode bytes; it asks the operand for its value or
//   stores through it, so every instruction handler works for register,
//   memory and immediate forms alike.

/// Base register combination of a 16-bit effective address.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AddressBase {
    BxSi,
    BxDi,
    BpSi,
    BpDi,
    Si,
    Di,
    DisplacementOnly,
    Bx,
    Bp,
}

impl AddressBase {
    /// Base for a 3-bit ModR/M rm field. `displacement_only` selects the
    /// mod=00 rm=110 special case over BP.
    pub fn from_rm(rm: u8, displacement_only: bool) -> AddressBase {
        match rm & 0x07 {
            0 => AddressBase::BxSi,
            1 => AddressBase::BxDi,
            2 => AddressBase::BpSi,
            3 => AddressBase::BpDi,
            4 => AddressBase::Si,
            5 => AddressBase::Di,
            6 if displacement_only => AddressBase::DisplacementOnly,
            6 => AddressBase::Bp,
            _ => AddressBase::Bx,
        }
    }

    pub fn offset(self, processor: &Processor) -> u16 {
        let word = |reg| processor.get_register(reg) as u16;
        match self {
            AddressBase::BxSi => word(Reg::BX).wrapping_add(word(Reg::SI)),
            AddressBase::BxDi => word(Reg::BX).wrapping_add(word(Reg::DI)),
            AddressBase::BpSi => word(Reg::BP).wrapping_add(word(Reg::SI)),
            AddressBase::BpDi => word(Reg::BP).wrapping_add(word(Reg::DI)),
            AddressBase::Si => word(Reg::SI),
            AddressBase::Di => word(Reg::DI),
            AddressBase::DisplacementOnly => 0,
            AddressBase::Bx => word(Reg::BX),
            AddressBase::Bp => word(Reg::BP),
        }
    }

    /// Segment used when no override prefix is present. BP-based forms
    /// address the stack segment.
    pub fn default_segment(self) -> SegReg {
        match self {
            AddressBase::BpSi | AddressBase::BpDi | AddressBase::Bp => SegReg::SS,
            _ => SegReg::DS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OperandSize {
    Byte,
    Word,
    Dword,
}

impl OperandSize {
    pub fn bits(self) -> u32 {
        match self {
            OperandSize::Byte => 8,
            OperandSize::Word => 16,
            OperandSize::Dword => 32,
        }
    }

    pub fn bytes(self) -> u16 {
        match self {
            OperandSize::Byte => 1,
            OperandSize::Word => 2,
            OperandSize::Dword => 4,
        }
    }

    pub fn mask(self) -> u32 {
        match self {
            OperandSize::Byte => 0xff,
            OperandSize::Word => 0xffff,
            OperandSize::Dword => 0xffff_ffff,
        }
    }

    pub fn sign_bit(self) -> u32 {
        match self {
            OperandSize::Byte => 0x80,
            OperandSize::Word => 0x8000,
            OperandSize::Dword => 0x8000_0000,
        }
    }
}

#[derive(Debug)]
pub enum Operand {
    Register(Reg),
    Segment(SegReg),
    Immediate(u32),
    Memory {
        base: AddressBase,
        displacement: i16,
        size: OperandSize,
    },
}

impl Operand {
    pub fn size(&self) -> OperandSize {
        match *self {
            Operand::Register(reg) => reg.size(),
            Operand::Segment(_) => OperandSize::Word,
            Operand::Immediate(_) => panic!("Illegal size query for immediate operand"),
            Operand::Memory { size, .. } => size,
        }
    }

    /// Offset within the operand segment. Only memory operands have one.
    pub fn effective_address(&self, processor: &Processor) -> u16 {
        match *self {
            Operand::Memory {
                base, displacement, ..
            } => base.offset(processor).wrapping_add(displacement as u16),
            _ => panic!("Illegal effective address for operand {}", self),
        }
    }

    pub fn segment(&self, processor: &Processor) -> SegReg {
        match *self {
            Operand::Memory { base, .. } => processor.segment_for(base.default_segment()),
            _ => panic!("Illegal segment for operand {}", self),
        }
    }

    pub fn linear_address(&self, processor: &Processor) -> u32 {
        let segment = processor.get_segment(self.segment(processor));
        to_physical(segment, self.effective_address(processor))
    }

    pub fn get(&self, processor: &Processor, memory: &PhysicalMemory) -> u32 {
        match *self {
            Operand::Register(reg) => processor.get_register(reg),
            Operand::Segment(seg) => u32::from(processor.get_segment(seg)),
            Operand::Immediate(value) => value,
            Operand::Memory { size, .. } => {
                let address = self.linear_address(processor);
                match size {
                    OperandSize::Byte => u32::from(memory.get_byte(address)),
                    OperandSize::Word => u32::from(memory.get_word(address)),
                    OperandSize::Dword => memory.get_dword(address),
                }
            }
        }
    }

    pub fn set(&self, processor: &mut Processor, memory: &mut PhysicalMemory, value: u32) {
        match *self {
            Operand::Register(reg) => processor.set_register(reg, value),
            Operand::Segment(seg) => processor.set_segment(seg, value as u16),
            Operand::Immediate(_) => panic!("Illegal store to immediate operand"),
            Operand::Memory { size, .. } => {
                let address = self.linear_address(processor);
                match size {
                    OperandSize::Byte => memory.set_byte(address, value as u8),
                    OperandSize::Word => memory.set_word(address, value as u16),
                    OperandSize::Dword => memory.set_dword(address, value),
                }
            }
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Operand::Register(reg) => write!(f, "{}", format!("{:?}", reg).to_lowercase()),
            Operand::Segment(seg) => write!(f, "{}", format!("{:?}", seg).to_lowercase()),
            Operand::Immediate(value) => write!(f, "{:#x}", value),
            Operand::Memory {
                base, displacement, ..
            } => {
                let base_str = match base {
                    AddressBase::BxSi => "bx+si",
                    AddressBase::BxDi => "bx+di",
                    AddressBase::BpSi => "bp+si",
                    AddressBase::BpDi => "bp+di",
                    AddressBase::Si => "si",
                    AddressBase::Di => "di",
                    AddressBase::DisplacementOnly => "",
                    AddressBase::Bx => "bx",
                    AddressBase::Bp => "bp",
                };
                if base_str.is_empty() {
                    write!(f, "[{:#06x}]", displacement as u16)
                } else if displacement == 0 {
                    write!(f, "[{}]", base_str)
                } else if displacement > 0 {
                    write!(f, "[{}+{:#x}]", base_str, displacement)
                } else {
                    write!(f, "[{}-{:#x}]", base_str, -(displacement as i32))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::BreakPointHolder;

    fn setup_processor() -> Processor {
        let mut processor = Processor::new();
        processor.set_register(Reg::BX, 0x1000);
        processor.set_register(Reg::BP, 0x2000);
        processor.set_register(Reg::SI, 0x0030);
        processor.set_register(Reg::DI, 0x0040);
        processor
    }

    fn setup_memory() -> PhysicalMemory {
        PhysicalMemory::new(
            0x4000,
            BreakPointHolder::new(),
            BreakPointHolder::new(),
        )
    }

    #[test]
    fn base_combinations_cover_rm_encodings() {
        assert_eq!(AddressBase::BxSi, AddressBase::from_rm(0, false));
        assert_eq!(AddressBase::BxDi, AddressBase::from_rm(1, false));
        assert_eq!(AddressBase::BpSi, AddressBase::from_rm(2, false));
        assert_eq!(AddressBase::BpDi, AddressBase::from_rm(3, false));
        assert_eq!(AddressBase::Si, AddressBase::from_rm(4, false));
        assert_eq!(AddressBase::Di, AddressBase::from_rm(5, false));
        assert_eq!(AddressBase::DisplacementOnly, AddressBase::from_rm(6, true));
        assert_eq!(AddressBase::Bp, AddressBase::from_rm(6, false));
        assert_eq!(AddressBase::Bx, AddressBase::from_rm(7, false));
    }

    #[test]
    fn base_offsets_sum_registers() {
        let processor = setup_processor();
        assert_eq!(0x1030, AddressBase::BxSi.offset(&processor));
        assert_eq!(0x1040, AddressBase::BxDi.offset(&processor));
        assert_eq!(0x2030, AddressBase::BpSi.offset(&processor));
        assert_eq!(0x2040, AddressBase::BpDi.offset(&processor));
        assert_eq!(0x0000, AddressBase::DisplacementOnly.offset(&processor));
    }

    #[test]
    fn bp_forms_default_to_stack_segment() {
        assert_eq!(SegReg::SS, AddressBase::BpSi.default_segment());
        assert_eq!(SegReg::SS, AddressBase::BpDi.default_segment());
        assert_eq!(SegReg::SS, AddressBase::Bp.default_segment());
        assert_eq!(SegReg::DS, AddressBase::Bx.default_segment());
        assert_eq!(SegReg::DS, AddressBase::DisplacementOnly.default_segment());
    }

    #[test]
    fn memory_operand_applies_displacement() {
        let processor = setup_processor();
        let operand = Operand::Memory {
            base: AddressBase::Bx,
            displacement: -0x10,
            size: OperandSize::Byte,
        };
        assert_eq!(0x0ff0, operand.effective_address(&processor));
    }

    #[test]
    fn memory_operand_roundtrip() {
        let mut processor = setup_processor();
        processor.set_segment(SegReg::DS, 0x0100);
        let mut memory = setup_memory();
        let operand = Operand::Memory {
            base: AddressBase::BxSi,
            displacement: 2,
            size: OperandSize::Word,
        };
        operand.set(&mut processor, &mut memory, 0xbeef);
        assert_eq!(0xbeef, operand.get(&processor, &memory));
        assert_eq!(0xef, memory.get_byte(0x2032));
    }

    #[test]
    fn override_changes_operand_segment() {
        let mut processor = setup_processor();
        let operand = Operand::Memory {
            base: AddressBase::Bp,
            displacement: 0,
            size: OperandSize::Word,
        };
        assert_eq!(SegReg::SS, operand.segment(&processor));
        processor.prefixes.segment = Some(SegReg::CS);
        assert_eq!(SegReg::CS, operand.segment(&processor));
    }

    #[test]
    fn format_memory_operands() {
        let operand = Operand::Memory {
            base: AddressBase::BxSi,
            displacement: 0x12,
            size: OperandSize::Byte,
        };
        assert_eq!("[bx+si+0x12]", format!("{}", operand));
        let direct = Operand::Memory {
            base: AddressBase::DisplacementOnly,
            displacement: 0x0475,
            size: OperandSize::Word,
        };
        assert_eq!("[0x0475]", format!("{}", direct));
    }
}
