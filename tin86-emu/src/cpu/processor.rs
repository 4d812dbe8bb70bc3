// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use bit_field::BitField;
use tin86_core::util::to_physical;

use super::operand::OperandSize;
use super::Flow;

// Spec: Intel 8086 Family User's Manual, Ch 2 (register structure) and
// Ch 4 (instruction encoding).
// Design:
//   The register file is stored as eight 32-bit cells in ModR/M encoding
//   order. Word registers alias the low half of a cell and byte registers
//   alias the low or high byte of the low half, so the Reg discriminant
//   encodes size and cell in one number.

const FLAG_CARRY: usize = 0;
const FLAG_PARITY: usize = 2;
const FLAG_ADJUST: usize = 4;
const FLAG_ZERO: usize = 6;
const FLAG_SIGN: usize = 7;
const FLAG_TRAP: usize = 8;
const FLAG_INTERRUPT: usize = 9;
const FLAG_DIRECTION: usize = 10;
const FLAG_OVERFLOW: usize = 11;
const FLAG_VIRTUAL_MODE: usize = 17;

// Bit 1 of FLAGS reads as 1 on every Intel part.
const FLAGS_RESERVED: u32 = 0x0002;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reg {
    AL = 0,
    CL = 1,
    DL = 2,
    BL = 3,
    AH = 4,
    CH = 5,
    DH = 6,
    BH = 7,
    AX = 8,
    CX = 9,
    DX = 10,
    BX = 11,
    SP = 12,
    BP = 13,
    SI = 14,
    DI = 15,
    EAX = 16,
    ECX = 17,
    EDX = 18,
    EBX = 19,
    ESP = 20,
    EBP = 21,
    ESI = 22,
    EDI = 23,
}

const BYTE_REGS: [Reg; 8] = [
    Reg::AL,
    Reg::CL,
    Reg::DL,
    Reg::BL,
    Reg::AH,
    Reg::CH,
    Reg::DH,
    Reg::BH,
];

const WORD_REGS: [Reg; 8] = [
    Reg::AX,
    Reg::CX,
    Reg::DX,
    Reg::BX,
    Reg::SP,
    Reg::BP,
    Reg::SI,
    Reg::DI,
];

const DWORD_REGS: [Reg; 8] = [
    Reg::EAX,
    Reg::ECX,
    Reg::EDX,
    Reg::EBX,
    Reg::ESP,
    Reg::EBP,
    Reg::ESI,
    Reg::EDI,
];

impl Reg {
    /// Byte register for a 3-bit ModR/M register field.
    pub fn byte(index: u8) -> Reg {
        BYTE_REGS[(index & 0x07) as usize]
    }

    /// Word register for a 3-bit ModR/M register field.
    pub fn word(index: u8) -> Reg {
        WORD_REGS[(index & 0x07) as usize]
    }

    /// Doubleword register for a 3-bit ModR/M register field.
    pub fn dword(index: u8) -> Reg {
        DWORD_REGS[(index & 0x07) as usize]
    }

    /// Register of the given size for a 3-bit ModR/M register field.
    pub fn sized(index: u8, size: OperandSize) -> Reg {
        match size {
            OperandSize::Byte => Reg::byte(index),
            OperandSize::Word => Reg::word(index),
            OperandSize::Dword => Reg::dword(index),
        }
    }

    pub fn size(self) -> OperandSize {
        match (self as usize) >> 3 {
            0 => OperandSize::Byte,
            1 => OperandSize::Word,
            _ => OperandSize::Dword,
        }
    }

    fn cell(self) -> usize {
        let n = self as usize;
        if n < 8 {
            n & 0x03
        } else {
            n & 0x07
        }
    }

    fn is_high_byte(self) -> bool {
        let n = self as usize;
        (4..8).contains(&n)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SegReg {
    ES = 0,
    CS = 1,
    SS = 2,
    DS = 3,
    FS = 4,
    GS = 5,
}

impl SegReg {
    /// Segment register for a 3-bit ModR/M register field. Values 6 and 7
    /// do not name a segment register.
    pub fn from_index(index: u8) -> Option<SegReg> {
        match index {
            0 => Some(SegReg::ES),
            1 => Some(SegReg::CS),
            2 => Some(SegReg::SS),
            3 => Some(SegReg::DS),
            4 => Some(SegReg::FS),
            5 => Some(SegReg::GS),
            _ => None,
        }
    }
}

/// Repeat prefix variant carried by string instructions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Repeat {
    Equal,
    NotEqual,
}

/// Prefix bytes collected ahead of an opcode.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Prefixes {
    pub segment: Option<SegReg>,
    pub repeat: Option<Repeat>,
    pub operand_size: bool,
    pub address_size: bool,
    pub count: u8,
}

pub struct Flags {
    value: u32,
}

impl Flags {
    pub fn new() -> Flags {
        Flags {
            value: FLAGS_RESERVED,
        }
    }

    pub fn value(&self) -> u32 {
        self.value | FLAGS_RESERVED
    }

    pub fn set_value(&mut self, value: u32) {
        self.value = value | FLAGS_RESERVED;
    }

    /// Replace the low 16 bits, as POPF and IRET do in real mode.
    pub fn set_word(&mut self, value: u16) {
        self.value = (self.value & 0xffff_0000) | u32::from(value) | FLAGS_RESERVED;
    }

    pub fn carry(&self) -> bool {
        self.value.get_bit(FLAG_CARRY)
    }

    pub fn set_carry(&mut self, value: bool) {
        self.value.set_bit(FLAG_CARRY, value);
    }

    pub fn parity(&self) -> bool {
        self.value.get_bit(FLAG_PARITY)
    }

    pub fn set_parity(&mut self, value: bool) {
        self.value.set_bit(FLAG_PARITY, value);
    }

    pub fn adjust(&self) -> bool {
        self.value.get_bit(FLAG_ADJUST)
    }

    pub fn set_adjust(&mut self, value: bool) {
        self.value.set_bit(FLAG_ADJUST, value);
    }

    pub fn zero(&self) -> bool {
        self.value.get_bit(FLAG_ZERO)
    }

    pub fn set_zero(&mut self, value: bool) {
        self.value.set_bit(FLAG_ZERO, value);
    }

    pub fn sign(&self) -> bool {
        self.value.get_bit(FLAG_SIGN)
    }

    pub fn set_sign(&mut self, value: bool) {
        self.value.set_bit(FLAG_SIGN, value);
    }

    pub fn trap(&self) -> bool {
        self.value.get_bit(FLAG_TRAP)
    }

    pub fn set_trap(&mut self, value: bool) {
        self.value.set_bit(FLAG_TRAP, value);
    }

    pub fn interrupt(&self) -> bool {
        self.value.get_bit(FLAG_INTERRUPT)
    }

    pub fn set_interrupt(&mut self, value: bool) {
        self.value.set_bit(FLAG_INTERRUPT, value);
    }

    pub fn direction(&self) -> bool {
        self.value.get_bit(FLAG_DIRECTION)
    }

    pub fn set_direction(&mut self, value: bool) {
        self.value.set_bit(FLAG_DIRECTION, value);
    }

    pub fn overflow(&self) -> bool {
        self.value.get_bit(FLAG_OVERFLOW)
    }

    pub fn set_overflow(&mut self, value: bool) {
        self.value.set_bit(FLAG_OVERFLOW, value);
    }

    pub fn virtual_mode(&self) -> bool {
        self.value.get_bit(FLAG_VIRTUAL_MODE)
    }

    pub fn set_virtual_mode(&mut self, value: bool) {
        self.value.set_bit(FLAG_VIRTUAL_MODE, value);
    }
}

pub struct Processor {
    // Registers
    regs: [u32; 8],
    segments: [u16; 6],
    eip: u32,
    pub flags: Flags,
    // Decoder State
    pub prefixes: Prefixes,
}

impl Processor {
    pub fn new() -> Processor {
        Processor {
            regs: [0; 8],
            segments: [0; 6],
            eip: 0,
            flags: Flags::new(),
            prefixes: Prefixes::default(),
        }
    }

    pub fn reset(&mut self) {
        self.regs = [0; 8];
        self.segments = [0; 6];
        self.eip = 0;
        self.flags = Flags::new();
        self.prefixes = Prefixes::default();
    }

    pub fn get_register(&self, reg: Reg) -> u32 {
        let cell = self.regs[reg.cell()];
        match reg.size() {
            OperandSize::Byte if reg.is_high_byte() => (cell >> 8) & 0xff,
            OperandSize::Byte => cell & 0xff,
            OperandSize::Word => cell & 0xffff,
            OperandSize::Dword => cell,
        }
    }

    pub fn set_register(&mut self, reg: Reg, value: u32) {
        let cell = &mut self.regs[reg.cell()];
        match reg.size() {
            OperandSize::Byte if reg.is_high_byte() => {
                *cell = (*cell & !0xff00) | ((value & 0xff) << 8);
            }
            OperandSize::Byte => {
                *cell = (*cell & !0xff) | (value & 0xff);
            }
            OperandSize::Word => {
                *cell = (*cell & !0xffff) | (value & 0xffff);
            }
            OperandSize::Dword => {
                *cell = value;
            }
        }
    }

    pub fn get_segment(&self, seg: SegReg) -> u16 {
        self.segments[seg as usize]
    }

    pub fn set_segment(&mut self, seg: SegReg, value: u16) {
        self.segments[seg as usize] = value;
    }

    pub fn ip(&self) -> u16 {
        self.eip as u16
    }

    pub fn set_ip(&mut self, value: u16) {
        self.eip = u32::from(value);
    }

    /// Physical address of the next instruction to fetch.
    pub fn fetch_address(&self) -> u32 {
        to_physical(self.get_segment(SegReg::CS), self.ip())
    }

    /// Effective segment for a memory access, honoring an override prefix.
    pub fn segment_for(&self, default: SegReg) -> SegReg {
        self.prefixes.segment.unwrap_or(default)
    }

    /// Advance IP past the executed instruction and clear prefix state. A
    /// rewinding string instruction backs up to its first prefix byte so
    /// the whole instruction is fetched again.
    pub fn instruction_epilogue(&mut self, len: u16, flow: &Flow) {
        match *flow {
            Flow::Next => {
                self.set_ip(self.ip().wrapping_add(len));
            }
            Flow::Rewind => {
                let next = self.ip().wrapping_add(len);
                self.set_ip(next.wrapping_sub(1 + u16::from(self.prefixes.count)));
            }
            Flow::Jump | Flow::Exit(_) => {}
        }
        self.prefixes = Prefixes::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_registers_alias_word_cells() {
        let mut processor = Processor::new();
        processor.set_register(Reg::AX, 0x1234);
        assert_eq!(0x34, processor.get_register(Reg::AL));
        assert_eq!(0x12, processor.get_register(Reg::AH));
        processor.set_register(Reg::AH, 0xff);
        assert_eq!(0xff34, processor.get_register(Reg::AX));
    }

    #[test]
    fn word_write_preserves_upper_half() {
        let mut processor = Processor::new();
        processor.set_register(Reg::EBX, 0xdead_beef);
        processor.set_register(Reg::BX, 0x1234);
        assert_eq!(0xdead_1234, processor.get_register(Reg::EBX));
    }

    #[test]
    fn sized_register_lookup() {
        assert_eq!(Reg::CH, Reg::byte(5));
        assert_eq!(Reg::BP, Reg::word(5));
        assert_eq!(Reg::EBP, Reg::dword(5));
        assert_eq!(Reg::DI, Reg::sized(7, OperandSize::Word));
    }

    #[test]
    fn flags_reserved_bit_reads_set() {
        let mut flags = Flags::new();
        assert_eq!(0x0002, flags.value());
        flags.set_value(0);
        assert_eq!(0x0002, flags.value());
        flags.set_word(0xfffd);
        assert_eq!(0xffff, flags.value() & 0xffff);
    }

    #[test]
    fn flags_word_write_preserves_upper_bits() {
        let mut flags = Flags::new();
        flags.set_virtual_mode(true);
        flags.set_word(0x0046);
        assert!(flags.virtual_mode());
        assert!(flags.zero());
        assert!(flags.parity());
    }

    #[test]
    fn epilogue_advances_past_instruction() {
        let mut processor = Processor::new();
        processor.set_ip(0x0100);
        processor.instruction_epilogue(3, &Flow::Next);
        assert_eq!(0x0103, processor.ip());
    }

    #[test]
    fn epilogue_rewinds_to_first_prefix() {
        let mut processor = Processor::new();
        processor.set_ip(0x0200);
        processor.prefixes.count = 1;
        // One prefix byte plus a single byte opcode.
        processor.instruction_epilogue(2, &Flow::Rewind);
        assert_eq!(0x0200, processor.ip());
        assert_eq!(0, processor.prefixes.count);
    }

    #[test]
    fn epilogue_leaves_jump_target_alone() {
        let mut processor = Processor::new();
        processor.set_ip(0x0300);
        processor.instruction_epilogue(2, &Flow::Jump);
        assert_eq!(0x0300, processor.ip());
    }

    #[test]
    fn segment_override_selects_prefix_segment() {
        let mut processor = Processor::new();
        assert_eq!(SegReg::DS, processor.segment_for(SegReg::DS));
        processor.prefixes.segment = Some(SegReg::ES);
        assert_eq!(SegReg::ES, processor.segment_for(SegReg::DS));
    }
}
