// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::fmt;

use tin86_core::util::to_physical;

use super::operand::{AddressBase, Operand, OperandSize};
use super::processor::{Prefixes, Reg, Repeat, SegReg};
use crate::mem::PhysicalMemory;

// Spec: Intel 8086 Family User's Manual, Ch 4 (machine instruction
// encoding and decoding).
// Design:
//   Decoding happens in a single pass over the instruction bytes and
//   produces an Op variant holding fully resolved operand descriptors.
//   The ALU rows, shift group and ModR/M extension groups share their
//   encoding scheme, so those arms derive the operation from the opcode
//   or reg field instead of enumerating all byte values.

// An instruction is at most 15 bytes, one of which must be the opcode.
const MAX_PREFIX_BYTES: u8 = 14;

/// Target of a far transfer, either taken from the instruction stream or
/// loaded from a m16:16 pointer in memory.
#[derive(Debug)]
pub enum FarPointer {
    Direct(u16, u16),
    Memory(Operand),
}

#[derive(Debug)]
pub enum Op {
    // Data Movement
    MOV(Operand, Operand),
    XCHG(Operand, Operand),
    PUSH(Operand),
    POP(Operand),
    PUSHA,
    POPA,
    PUSHF,
    POPF,
    LAHF,
    SAHF,
    LEA(Operand, Operand),
    LDS(Operand, Operand),
    LES(Operand, Operand),
    XLAT,
    IN(Operand, Operand),
    OUT(Operand, Operand),
    // Arithmetic
    ADD(Operand, Operand),
    ADC(Operand, Operand),
    SUB(Operand, Operand),
    SBB(Operand, Operand),
    CMP(Operand, Operand),
    INC(Operand),
    DEC(Operand),
    NEG(Operand),
    MUL(Operand),
    IMUL(Operand),
    DIV(Operand),
    IDIV(Operand),
    CBW,
    CWD,
    // Logical
    AND(Operand, Operand),
    OR(Operand, Operand),
    XOR(Operand, Operand),
    NOT(Operand),
    TEST(Operand, Operand),
    // Shift and Rotate
    SHL(Operand, Operand),
    SHR(Operand, Operand),
    SAR(Operand, Operand),
    ROL(Operand, Operand),
    ROR(Operand, Operand),
    RCL(Operand, Operand),
    RCR(Operand, Operand),
    // Control Flow
    JMP(i16),
    JMPF(FarPointer),
    JMPN(Operand),
    JO(i16),
    JNO(i16),
    JB(i16),
    JNB(i16),
    JZ(i16),
    JNZ(i16),
    JBE(i16),
    JNBE(i16),
    JS(i16),
    JNS(i16),
    JP(i16),
    JNP(i16),
    JL(i16),
    JNL(i16),
    JLE(i16),
    JNLE(i16),
    JCXZ(i16),
    LOOP(i16),
    LOOPE(i16),
    LOOPNE(i16),
    CALL(i16),
    CALLF(FarPointer),
    CALLN(Operand),
    RET(u16),
    RETF(u16),
    INT(u8),
    INT3,
    INTO,
    IRET,
    // String
    MOVS(OperandSize),
    CMPS(OperandSize),
    STOS(OperandSize),
    LODS(OperandSize),
    SCAS(OperandSize),
    INS(OperandSize),
    OUTS(OperandSize),
    // Flags and Control
    CLC,
    STC,
    CMC,
    CLD,
    STD,
    CLI,
    STI,
    HLT,
    NOP,
    WAIT,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DecodeError {
    InvalidOpcode { opcode: u8, address: u32 },
    InvalidModRm { opcode: u8, modrm: u8, address: u32 },
    OutOfBounds { address: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DecodeError::InvalidOpcode { opcode, address } => {
                write!(f, "invalid opcode {:02X} at {:05X}", opcode, address)
            }
            DecodeError::InvalidModRm {
                opcode,
                modrm,
                address,
            } => write!(
                f,
                "invalid modrm {:02X} for opcode {:02X} at {:05X}",
                modrm, opcode, address
            ),
            DecodeError::OutOfBounds { address } => {
                write!(f, "instruction fetch past end of memory at {:05X}", address)
            }
        }
    }
}

struct Fetcher<'a> {
    memory: &'a PhysicalMemory,
    base: u32,
    offset: u16,
}

impl<'a> Fetcher<'a> {
    fn new(memory: &'a PhysicalMemory, base: u32) -> Fetcher<'a> {
        Fetcher {
            memory,
            base,
            offset: 0,
        }
    }

    fn address(&self) -> u32 {
        self.base + u32::from(self.offset)
    }

    fn fetch_byte(&mut self) -> Result<u8, DecodeError> {
        match self.memory.inspect_byte(self.address()) {
            Some(value) => {
                self.offset += 1;
                Ok(value)
            }
            None => Err(DecodeError::OutOfBounds {
                address: self.address(),
            }),
        }
    }

    fn fetch_word(&mut self) -> Result<u16, DecodeError> {
        let lo = self.fetch_byte()?;
        let hi = self.fetch_byte()?;
        Ok(u16::from(lo) | u16::from(hi) << 8)
    }

    fn fetch_dword(&mut self) -> Result<u32, DecodeError> {
        let lo = self.fetch_word()?;
        let hi = self.fetch_word()?;
        Ok(u32::from(lo) | u32::from(hi) << 16)
    }

    fn fetch_immediate(&mut self, size: OperandSize) -> Result<u32, DecodeError> {
        match size {
            OperandSize::Byte => Ok(u32::from(self.fetch_byte()?)),
            OperandSize::Word => Ok(u32::from(self.fetch_word()?)),
            OperandSize::Dword => self.fetch_dword(),
        }
    }

    /// Decode the addressing half of a ModR/M byte, consuming any
    /// displacement bytes it calls for.
    fn decode_rm(&mut self, modrm: u8, size: OperandSize) -> Result<Operand, DecodeError> {
        let mode = modrm >> 6;
        let rm = modrm & 0x07;
        let operand = match mode {
            0 if rm == 6 => Operand::Memory {
                base: AddressBase::DisplacementOnly,
                displacement: self.fetch_word()? as i16,
                size,
            },
            0 => Operand::Memory {
                base: AddressBase::from_rm(rm, false),
                displacement: 0,
                size,
            },
            1 => Operand::Memory {
                base: AddressBase::from_rm(rm, false),
                displacement: i16::from(self.fetch_byte()? as i8),
                size,
            },
            2 => Operand::Memory {
                base: AddressBase::from_rm(rm, false),
                displacement: self.fetch_word()? as i16,
                size,
            },
            _ => Operand::Register(Reg::sized(rm, size)),
        };
        Ok(operand)
    }
}

fn reg_operand(modrm: u8, size: OperandSize) -> Operand {
    Operand::Register(Reg::sized((modrm >> 3) & 0x07, size))
}

fn direct_memory(displacement: u16, size: OperandSize) -> Operand {
    Operand::Memory {
        base: AddressBase::DisplacementOnly,
        displacement: displacement as i16,
        size,
    }
}

fn alu_op(index: u8, dst: Operand, src: Operand) -> Op {
    match index & 0x07 {
        0 => Op::ADD(dst, src),
        1 => Op::OR(dst, src),
        2 => Op::ADC(dst, src),
        3 => Op::SBB(dst, src),
        4 => Op::AND(dst, src),
        5 => Op::SUB(dst, src),
        6 => Op::XOR(dst, src),
        _ => Op::CMP(dst, src),
    }
}

fn shift_op(index: u8, dst: Operand, count: Operand) -> Op {
    match index & 0x07 {
        0 => Op::ROL(dst, count),
        1 => Op::ROR(dst, count),
        2 => Op::RCL(dst, count),
        3 => Op::RCR(dst, count),
        // Index 6 is the undocumented SAL alias.
        4 | 6 => Op::SHL(dst, count),
        5 => Op::SHR(dst, count),
        _ => Op::SAR(dst, count),
    }
}

fn jcc_op(condition: u8, displacement: i16) -> Op {
    match condition & 0x0f {
        0x0 => Op::JO(displacement),
        0x1 => Op::JNO(displacement),
        0x2 => Op::JB(displacement),
        0x3 => Op::JNB(displacement),
        0x4 => Op::JZ(displacement),
        0x5 => Op::JNZ(displacement),
        0x6 => Op::JBE(displacement),
        0x7 => Op::JNBE(displacement),
        0x8 => Op::JS(displacement),
        0x9 => Op::JNS(displacement),
        0xa => Op::JP(displacement),
        0xb => Op::JNP(displacement),
        0xc => Op::JL(displacement),
        0xd => Op::JNL(displacement),
        0xe => Op::JLE(displacement),
        _ => Op::JNLE(displacement),
    }
}

fn sign_extend_byte(value: u8) -> u32 {
    i32::from(value as i8) as u16 as u32
}

#[derive(Debug)]
pub struct Instruction {
    pub op: Op,
    pub len: u16,
    pub prefixes: Prefixes,
    pub cs: u16,
    pub ip: u16,
}

impl Instruction {
    pub fn decode(memory: &PhysicalMemory, cs: u16, ip: u16) -> Result<Instruction, DecodeError> {
        let start = to_physical(cs, ip);
        let mut fetcher = Fetcher::new(memory, start);
        let mut prefixes = Prefixes::default();
        let opcode = loop {
            let byte = fetcher.fetch_byte()?;
            match byte {
                0x26 => prefixes.segment = Some(SegReg::ES),
                0x2e => prefixes.segment = Some(SegReg::CS),
                0x36 => prefixes.segment = Some(SegReg::SS),
                0x3e => prefixes.segment = Some(SegReg::DS),
                0x64 => prefixes.segment = Some(SegReg::FS),
                0x65 => prefixes.segment = Some(SegReg::GS),
                0x66 => prefixes.operand_size = true,
                0x67 => prefixes.address_size = true,
                // LOCK has no observable effect on a single core machine.
                0xf0 => {}
                0xf2 => prefixes.repeat = Some(Repeat::NotEqual),
                0xf3 => prefixes.repeat = Some(Repeat::Equal),
                _ => break byte,
            }
            prefixes.count += 1;
            if prefixes.count > MAX_PREFIX_BYTES {
                return Err(DecodeError::InvalidOpcode {
                    opcode: byte,
                    address: start,
                });
            }
        };
        // Effective size of word operations under an operand size prefix.
        let osize = if prefixes.operand_size {
            OperandSize::Dword
        } else {
            OperandSize::Word
        };
        let op = match opcode {
            // ALU rows 0x00-0x3b share one layout: bits 5-3 select the
            // operation, bits 2-0 the operand form.
            0x00 | 0x08 | 0x10 | 0x18 | 0x20 | 0x28 | 0x30 | 0x38 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                alu_op(opcode >> 3, rm, reg_operand(modrm, OperandSize::Byte))
            }
            0x01 | 0x09 | 0x11 | 0x19 | 0x21 | 0x29 | 0x31 | 0x39 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                alu_op(opcode >> 3, rm, reg_operand(modrm, osize))
            }
            0x02 | 0x0a | 0x12 | 0x1a | 0x22 | 0x2a | 0x32 | 0x3a => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                alu_op(opcode >> 3, reg_operand(modrm, OperandSize::Byte), rm)
            }
            0x03 | 0x0b | 0x13 | 0x1b | 0x23 | 0x2b | 0x33 | 0x3b => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                alu_op(opcode >> 3, reg_operand(modrm, osize), rm)
            }
            0x04 | 0x0c | 0x14 | 0x1c | 0x24 | 0x2c | 0x34 | 0x3c => {
                let imm = fetcher.fetch_byte()?;
                alu_op(
                    opcode >> 3,
                    Operand::Register(Reg::AL),
                    Operand::Immediate(u32::from(imm)),
                )
            }
            0x05 | 0x0d | 0x15 | 0x1d | 0x25 | 0x2d | 0x35 | 0x3d => {
                let imm = fetcher.fetch_immediate(osize)?;
                alu_op(
                    opcode >> 3,
                    Operand::Register(Reg::sized(0, osize)),
                    Operand::Immediate(imm),
                )
            }
            0x06 => Op::PUSH(Operand::Segment(SegReg::ES)),
            0x07 => Op::POP(Operand::Segment(SegReg::ES)),
            0x0e => Op::PUSH(Operand::Segment(SegReg::CS)),
            0x16 => Op::PUSH(Operand::Segment(SegReg::SS)),
            0x17 => Op::POP(Operand::Segment(SegReg::SS)),
            0x1e => Op::PUSH(Operand::Segment(SegReg::DS)),
            0x1f => Op::POP(Operand::Segment(SegReg::DS)),
            0x40..=0x47 => Op::INC(Operand::Register(Reg::sized(opcode & 0x07, osize))),
            0x48..=0x4f => Op::DEC(Operand::Register(Reg::sized(opcode & 0x07, osize))),
            0x50..=0x57 => Op::PUSH(Operand::Register(Reg::word(opcode & 0x07))),
            0x58..=0x5f => Op::POP(Operand::Register(Reg::word(opcode & 0x07))),
            0x60 => Op::PUSHA,
            0x61 => Op::POPA,
            0x68 => Op::PUSH(Operand::Immediate(u32::from(fetcher.fetch_word()?))),
            0x6a => Op::PUSH(Operand::Immediate(sign_extend_byte(fetcher.fetch_byte()?))),
            0x6c => Op::INS(OperandSize::Byte),
            0x6d => Op::INS(OperandSize::Word),
            0x6e => Op::OUTS(OperandSize::Byte),
            0x6f => Op::OUTS(OperandSize::Word),
            0x70..=0x7f => jcc_op(opcode, i16::from(fetcher.fetch_byte()? as i8)),
            0x80 | 0x82 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                let imm = fetcher.fetch_byte()?;
                alu_op(modrm >> 3, rm, Operand::Immediate(u32::from(imm)))
            }
            0x81 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                let imm = fetcher.fetch_immediate(osize)?;
                alu_op(modrm >> 3, rm, Operand::Immediate(imm))
            }
            0x83 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                let imm = i32::from(fetcher.fetch_byte()? as i8) as u32 & osize.mask();
                alu_op(modrm >> 3, rm, Operand::Immediate(imm))
            }
            0x84 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                Op::TEST(rm, reg_operand(modrm, OperandSize::Byte))
            }
            0x85 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                Op::TEST(rm, reg_operand(modrm, osize))
            }
            0x86 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                Op::XCHG(rm, reg_operand(modrm, OperandSize::Byte))
            }
            0x87 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                Op::XCHG(rm, reg_operand(modrm, osize))
            }
            0x88 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                Op::MOV(rm, reg_operand(modrm, OperandSize::Byte))
            }
            0x89 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                Op::MOV(rm, reg_operand(modrm, osize))
            }
            0x8a => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                Op::MOV(reg_operand(modrm, OperandSize::Byte), rm)
            }
            0x8b => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                Op::MOV(reg_operand(modrm, osize), rm)
            }
            0x8c => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Word)?;
                match SegReg::from_index((modrm >> 3) & 0x07) {
                    Some(seg) => Op::MOV(rm, Operand::Segment(seg)),
                    None => {
                        return Err(DecodeError::InvalidModRm {
                            opcode,
                            modrm,
                            address: start,
                        });
                    }
                }
            }
            0x8d => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Word)?;
                if let Operand::Register(_) = rm {
                    return Err(DecodeError::InvalidModRm {
                        opcode,
                        modrm,
                        address: start,
                    });
                }
                Op::LEA(reg_operand(modrm, OperandSize::Word), rm)
            }
            0x8e => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Word)?;
                match SegReg::from_index((modrm >> 3) & 0x07) {
                    // CS is not a legal MOV destination.
                    Some(SegReg::CS) | None => {
                        return Err(DecodeError::InvalidModRm {
                            opcode,
                            modrm,
                            address: start,
                        });
                    }
                    Some(seg) => Op::MOV(Operand::Segment(seg), rm),
                }
            }
            0x8f => {
                let modrm = fetcher.fetch_byte()?;
                if (modrm >> 3) & 0x07 != 0 {
                    return Err(DecodeError::InvalidModRm {
                        opcode,
                        modrm,
                        address: start,
                    });
                }
                Op::POP(fetcher.decode_rm(modrm, OperandSize::Word)?)
            }
            0x90 => Op::NOP,
            0x91..=0x97 => Op::XCHG(
                Operand::Register(Reg::sized(0, osize)),
                Operand::Register(Reg::sized(opcode & 0x07, osize)),
            ),
            0x98 => Op::CBW,
            0x99 => Op::CWD,
            0x9a => {
                let offset = fetcher.fetch_word()?;
                let segment = fetcher.fetch_word()?;
                Op::CALLF(FarPointer::Direct(segment, offset))
            }
            0x9b => Op::WAIT,
            0x9c => Op::PUSHF,
            0x9d => Op::POPF,
            0x9e => Op::SAHF,
            0x9f => Op::LAHF,
            0xa0 => Op::MOV(
                Operand::Register(Reg::AL),
                direct_memory(fetcher.fetch_word()?, OperandSize::Byte),
            ),
            0xa1 => Op::MOV(
                Operand::Register(Reg::sized(0, osize)),
                direct_memory(fetcher.fetch_word()?, osize),
            ),
            0xa2 => Op::MOV(
                direct_memory(fetcher.fetch_word()?, OperandSize::Byte),
                Operand::Register(Reg::AL),
            ),
            0xa3 => Op::MOV(
                direct_memory(fetcher.fetch_word()?, osize),
                Operand::Register(Reg::sized(0, osize)),
            ),
            0xa4 => Op::MOVS(OperandSize::Byte),
            0xa5 => Op::MOVS(osize),
            0xa6 => Op::CMPS(OperandSize::Byte),
            0xa7 => Op::CMPS(osize),
            0xa8 => Op::TEST(
                Operand::Register(Reg::AL),
                Operand::Immediate(u32::from(fetcher.fetch_byte()?)),
            ),
            0xa9 => {
                let imm = fetcher.fetch_immediate(osize)?;
                Op::TEST(Operand::Register(Reg::sized(0, osize)), Operand::Immediate(imm))
            }
            0xaa => Op::STOS(OperandSize::Byte),
            0xab => Op::STOS(osize),
            0xac => Op::LODS(OperandSize::Byte),
            0xad => Op::LODS(osize),
            0xae => Op::SCAS(OperandSize::Byte),
            0xaf => Op::SCAS(osize),
            0xb0..=0xb7 => Op::MOV(
                Operand::Register(Reg::byte(opcode & 0x07)),
                Operand::Immediate(u32::from(fetcher.fetch_byte()?)),
            ),
            0xb8..=0xbf => {
                let imm = fetcher.fetch_immediate(osize)?;
                Op::MOV(
                    Operand::Register(Reg::sized(opcode & 0x07, osize)),
                    Operand::Immediate(imm),
                )
            }
            0xc0 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                let count = fetcher.fetch_byte()?;
                shift_op(modrm >> 3, rm, Operand::Immediate(u32::from(count)))
            }
            0xc1 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                let count = fetcher.fetch_byte()?;
                shift_op(modrm >> 3, rm, Operand::Immediate(u32::from(count)))
            }
            0xc2 => Op::RET(fetcher.fetch_word()?),
            0xc3 => Op::RET(0),
            0xc4 | 0xc5 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Word)?;
                if let Operand::Register(_) = rm {
                    return Err(DecodeError::InvalidModRm {
                        opcode,
                        modrm,
                        address: start,
                    });
                }
                let reg = reg_operand(modrm, OperandSize::Word);
                if opcode == 0xc4 {
                    Op::LES(reg, rm)
                } else {
                    Op::LDS(reg, rm)
                }
            }
            0xc6 | 0xc7 => {
                let modrm = fetcher.fetch_byte()?;
                if (modrm >> 3) & 0x07 != 0 {
                    return Err(DecodeError::InvalidModRm {
                        opcode,
                        modrm,
                        address: start,
                    });
                }
                let size = if opcode == 0xc6 {
                    OperandSize::Byte
                } else {
                    osize
                };
                let rm = fetcher.decode_rm(modrm, size)?;
                let imm = fetcher.fetch_immediate(size)?;
                Op::MOV(rm, Operand::Immediate(imm))
            }
            0xca => Op::RETF(fetcher.fetch_word()?),
            0xcb => Op::RETF(0),
            0xcc => Op::INT3,
            0xcd => Op::INT(fetcher.fetch_byte()?),
            0xce => Op::INTO,
            0xcf => Op::IRET,
            0xd0 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                shift_op(modrm >> 3, rm, Operand::Immediate(1))
            }
            0xd1 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                shift_op(modrm >> 3, rm, Operand::Immediate(1))
            }
            0xd2 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                shift_op(modrm >> 3, rm, Operand::Register(Reg::CL))
            }
            0xd3 => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, osize)?;
                shift_op(modrm >> 3, rm, Operand::Register(Reg::CL))
            }
            0xd7 => Op::XLAT,
            0xe0 => Op::LOOPNE(i16::from(fetcher.fetch_byte()? as i8)),
            0xe1 => Op::LOOPE(i16::from(fetcher.fetch_byte()? as i8)),
            0xe2 => Op::LOOP(i16::from(fetcher.fetch_byte()? as i8)),
            0xe3 => Op::JCXZ(i16::from(fetcher.fetch_byte()? as i8)),
            0xe4 => Op::IN(
                Operand::Register(Reg::AL),
                Operand::Immediate(u32::from(fetcher.fetch_byte()?)),
            ),
            0xe5 => Op::IN(
                Operand::Register(Reg::AX),
                Operand::Immediate(u32::from(fetcher.fetch_byte()?)),
            ),
            0xe6 => Op::OUT(
                Operand::Immediate(u32::from(fetcher.fetch_byte()?)),
                Operand::Register(Reg::AL),
            ),
            0xe7 => Op::OUT(
                Operand::Immediate(u32::from(fetcher.fetch_byte()?)),
                Operand::Register(Reg::AX),
            ),
            0xe8 => Op::CALL(fetcher.fetch_word()? as i16),
            0xe9 => Op::JMP(fetcher.fetch_word()? as i16),
            0xea => {
                let offset = fetcher.fetch_word()?;
                let segment = fetcher.fetch_word()?;
                Op::JMPF(FarPointer::Direct(segment, offset))
            }
            0xeb => Op::JMP(i16::from(fetcher.fetch_byte()? as i8)),
            0xec => Op::IN(Operand::Register(Reg::AL), Operand::Register(Reg::DX)),
            0xed => Op::IN(Operand::Register(Reg::AX), Operand::Register(Reg::DX)),
            0xee => Op::OUT(Operand::Register(Reg::DX), Operand::Register(Reg::AL)),
            0xef => Op::OUT(Operand::Register(Reg::DX), Operand::Register(Reg::AX)),
            0xf4 => Op::HLT,
            0xf5 => Op::CMC,
            0xf6 | 0xf7 => {
                let size = if opcode == 0xf6 {
                    OperandSize::Byte
                } else {
                    osize
                };
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, size)?;
                match (modrm >> 3) & 0x07 {
                    0 | 1 => {
                        let imm = fetcher.fetch_immediate(size)?;
                        Op::TEST(rm, Operand::Immediate(imm))
                    }
                    2 => Op::NOT(rm),
                    3 => Op::NEG(rm),
                    4 => Op::MUL(rm),
                    5 => Op::IMUL(rm),
                    6 => Op::DIV(rm),
                    _ => Op::IDIV(rm),
                }
            }
            0xf8 => Op::CLC,
            0xf9 => Op::STC,
            0xfa => Op::CLI,
            0xfb => Op::STI,
            0xfc => Op::CLD,
            0xfd => Op::STD,
            0xfe => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Byte)?;
                match (modrm >> 3) & 0x07 {
                    0 => Op::INC(rm),
                    1 => Op::DEC(rm),
                    _ => {
                        return Err(DecodeError::InvalidModRm {
                            opcode,
                            modrm,
                            address: start,
                        });
                    }
                }
            }
            0xff => {
                let modrm = fetcher.fetch_byte()?;
                let rm = fetcher.decode_rm(modrm, OperandSize::Word)?;
                match (modrm >> 3) & 0x07 {
                    0 => Op::INC(rm),
                    1 => Op::DEC(rm),
                    2 => Op::CALLN(rm),
                    3 | 5 => {
                        if let Operand::Register(_) = rm {
                            return Err(DecodeError::InvalidModRm {
                                opcode,
                                modrm,
                                address: start,
                            });
                        }
                        if (modrm >> 3) & 0x07 == 3 {
                            Op::CALLF(FarPointer::Memory(rm))
                        } else {
                            Op::JMPF(FarPointer::Memory(rm))
                        }
                    }
                    4 => Op::JMPN(rm),
                    6 => Op::PUSH(rm),
                    _ => {
                        return Err(DecodeError::InvalidModRm {
                            opcode,
                            modrm,
                            address: start,
                        });
                    }
                }
            }
            _ => {
                return Err(DecodeError::InvalidOpcode {
                    opcode,
                    address: start,
                });
            }
        };
        Ok(Instruction {
            op,
            len: fetcher.offset,
            prefixes,
            cs,
            ip,
        })
    }

    /// IP of the instruction that follows this one.
    pub fn next_ip(&self) -> u16 {
        self.ip.wrapping_add(self.len)
    }

    fn jump_target(&self, displacement: i16) -> u16 {
        self.next_ip().wrapping_add(displacement as u16)
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(repeat) = self.prefixes.repeat {
            match self.op {
                Op::CMPS(_) | Op::SCAS(_) => match repeat {
                    Repeat::Equal => write!(f, "repe ")?,
                    Repeat::NotEqual => write!(f, "repne ")?,
                },
                Op::MOVS(_) | Op::STOS(_) | Op::LODS(_) | Op::INS(_) | Op::OUTS(_) => {
                    write!(f, "rep ")?
                }
                _ => {}
            }
        }
        let string_suffix = |size: OperandSize| match size {
            OperandSize::Byte => "b",
            OperandSize::Word => "w",
            OperandSize::Dword => "d",
        };
        match self.op {
            // Data Movement
            Op::MOV(ref dst, ref src) => write!(f, "mov {}, {}", dst, src),
            Op::XCHG(ref dst, ref src) => write!(f, "xchg {}, {}", dst, src),
            Op::PUSH(ref operand) => write!(f, "push {}", operand),
            Op::POP(ref operand) => write!(f, "pop {}", operand),
            Op::PUSHA => write!(f, "pusha"),
            Op::POPA => write!(f, "popa"),
            Op::PUSHF => write!(f, "pushf"),
            Op::POPF => write!(f, "popf"),
            Op::LAHF => write!(f, "lahf"),
            Op::SAHF => write!(f, "sahf"),
            Op::LEA(ref dst, ref src) => write!(f, "lea {}, {}", dst, src),
            Op::LDS(ref dst, ref src) => write!(f, "lds {}, {}", dst, src),
            Op::LES(ref dst, ref src) => write!(f, "les {}, {}", dst, src),
            Op::XLAT => write!(f, "xlat"),
            Op::IN(ref dst, ref port) => write!(f, "in {}, {}", dst, port),
            Op::OUT(ref port, ref src) => write!(f, "out {}, {}", port, src),
            // Arithmetic
            Op::ADD(ref dst, ref src) => write!(f, "add {}, {}", dst, src),
            Op::ADC(ref dst, ref src) => write!(f, "adc {}, {}", dst, src),
            Op::SUB(ref dst, ref src) => write!(f, "sub {}, {}", dst, src),
            Op::SBB(ref dst, ref src) => write!(f, "sbb {}, {}", dst, src),
            Op::CMP(ref dst, ref src) => write!(f, "cmp {}, {}", dst, src),
            Op::INC(ref operand) => write!(f, "inc {}", operand),
            Op::DEC(ref operand) => write!(f, "dec {}", operand),
            Op::NEG(ref operand) => write!(f, "neg {}", operand),
            Op::MUL(ref operand) => write!(f, "mul {}", operand),
            Op::IMUL(ref operand) => write!(f, "imul {}", operand),
            Op::DIV(ref operand) => write!(f, "div {}", operand),
            Op::IDIV(ref operand) => write!(f, "idiv {}", operand),
            Op::CBW => write!(f, "cbw"),
            Op::CWD => write!(f, "cwd"),
            // Logical
            Op::AND(ref dst, ref src) => write!(f, "and {}, {}", dst, src),
            Op::OR(ref dst, ref src) => write!(f, "or {}, {}", dst, src),
            Op::XOR(ref dst, ref src) => write!(f, "xor {}, {}", dst, src),
            Op::NOT(ref operand) => write!(f, "not {}", operand),
            Op::TEST(ref dst, ref src) => write!(f, "test {}, {}", dst, src),
            // Shift and Rotate
            Op::SHL(ref dst, ref count) => write!(f, "shl {}, {}", dst, count),
            Op::SHR(ref dst, ref count) => write!(f, "shr {}, {}", dst, count),
            Op::SAR(ref dst, ref count) => write!(f, "sar {}, {}", dst, count),
            Op::ROL(ref dst, ref count) => write!(f, "rol {}, {}", dst, count),
            Op::ROR(ref dst, ref count) => write!(f, "ror {}, {}", dst, count),
            Op::RCL(ref dst, ref count) => write!(f, "rcl {}, {}", dst, count),
            Op::RCR(ref dst, ref count) => write!(f, "rcr {}, {}", dst, count),
            // Control Flow
            Op::JMP(rel) => write!(f, "jmp {:#06x}", self.jump_target(rel)),
            Op::JMPF(ref pointer) => write!(f, "jmp {}", pointer),
            Op::JMPN(ref operand) => write!(f, "jmp {}", operand),
            Op::JO(rel) => write!(f, "jo {:#06x}", self.jump_target(rel)),
            Op::JNO(rel) => write!(f, "jno {:#06x}", self.jump_target(rel)),
            Op::JB(rel) => write!(f, "jb {:#06x}", self.jump_target(rel)),
            Op::JNB(rel) => write!(f, "jnb {:#06x}", self.jump_target(rel)),
            Op::JZ(rel) => write!(f, "jz {:#06x}", self.jump_target(rel)),
            Op::JNZ(rel) => write!(f, "jnz {:#06x}", self.jump_target(rel)),
            Op::JBE(rel) => write!(f, "jbe {:#06x}", self.jump_target(rel)),
            Op::JNBE(rel) => write!(f, "jnbe {:#06x}", self.jump_target(rel)),
            Op::JS(rel) => write!(f, "js {:#06x}", self.jump_target(rel)),
            Op::JNS(rel) => write!(f, "jns {:#06x}", self.jump_target(rel)),
            Op::JP(rel) => write!(f, "jp {:#06x}", self.jump_target(rel)),
            Op::JNP(rel) => write!(f, "jnp {:#06x}", self.jump_target(rel)),
            Op::JL(rel) => write!(f, "jl {:#06x}", self.jump_target(rel)),
            Op::JNL(rel) => write!(f, "jnl {:#06x}", self.jump_target(rel)),
            Op::JLE(rel) => write!(f, "jle {:#06x}", self.jump_target(rel)),
            Op::JNLE(rel) => write!(f, "jnle {:#06x}", self.jump_target(rel)),
            Op::JCXZ(rel) => write!(f, "jcxz {:#06x}", self.jump_target(rel)),
            Op::LOOP(rel) => write!(f, "loop {:#06x}", self.jump_target(rel)),
            Op::LOOPE(rel) => write!(f, "loope {:#06x}", self.jump_target(rel)),
            Op::LOOPNE(rel) => write!(f, "loopne {:#06x}", self.jump_target(rel)),
            Op::CALL(rel) => write!(f, "call {:#06x}", self.jump_target(rel)),
            Op::CALLF(ref pointer) => write!(f, "call {}", pointer),
            Op::CALLN(ref operand) => write!(f, "call {}", operand),
            Op::RET(0) => write!(f, "ret"),
            Op::RET(imm) => write!(f, "ret {:#x}", imm),
            Op::RETF(0) => write!(f, "retf"),
            Op::RETF(imm) => write!(f, "retf {:#x}", imm),
            Op::INT(vector) => write!(f, "int {:#04x}", vector),
            Op::INT3 => write!(f, "int3"),
            Op::INTO => write!(f, "into"),
            Op::IRET => write!(f, "iret"),
            // String
            Op::MOVS(size) => write!(f, "movs{}", string_suffix(size)),
            Op::CMPS(size) => write!(f, "cmps{}", string_suffix(size)),
            Op::STOS(size) => write!(f, "stos{}", string_suffix(size)),
            Op::LODS(size) => write!(f, "lods{}", string_suffix(size)),
            Op::SCAS(size) => write!(f, "scas{}", string_suffix(size)),
            Op::INS(size) => write!(f, "ins{}", string_suffix(size)),
            Op::OUTS(size) => write!(f, "outs{}", string_suffix(size)),
            // Flags and Control
            Op::CLC => write!(f, "clc"),
            Op::STC => write!(f, "stc"),
            Op::CMC => write!(f, "cmc"),
            Op::CLD => write!(f, "cld"),
            Op::STD => write!(f, "std"),
            Op::CLI => write!(f, "cli"),
            Op::STI => write!(f, "sti"),
            Op::HLT => write!(f, "hlt"),
            Op::NOP => write!(f, "nop"),
            Op::WAIT => write!(f, "wait"),
        }
    }
}

impl fmt::Display for FarPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FarPointer::Direct(segment, offset) => write!(f, "{:04x}:{:04x}", segment, offset),
            FarPointer::Memory(ref operand) => write!(f, "far {}", operand),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::BreakPointHolder;

    fn setup_memory(program: &[u8]) -> PhysicalMemory {
        let mut memory = PhysicalMemory::new(
            0x1000,
            BreakPointHolder::new(),
            BreakPointHolder::new(),
        );
        memory.write_bytes(0x0100, program).unwrap();
        memory
    }

    fn decode(program: &[u8]) -> Instruction {
        let memory = setup_memory(program);
        Instruction::decode(&memory, 0x0000, 0x0100).unwrap()
    }

    #[test]
    fn decode_mov_register_immediate() {
        let instruction = decode(&[0xb8, 0x34, 0x12]);
        assert_eq!(3, instruction.len);
        match instruction.op {
            Op::MOV(Operand::Register(Reg::AX), Operand::Immediate(0x1234)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_collects_prefixes() {
        let instruction = decode(&[0x26, 0xf3, 0xa4]);
        assert_eq!(3, instruction.len);
        assert_eq!(Some(SegReg::ES), instruction.prefixes.segment);
        assert_eq!(Some(Repeat::Equal), instruction.prefixes.repeat);
        assert_eq!(2, instruction.prefixes.count);
        match instruction.op {
            Op::MOVS(OperandSize::Byte) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_alu_row_scheme() {
        // 00 /r is ADD r/m8, r8 with mod=11 reg=BL rm=AL.
        let instruction = decode(&[0x00, 0xd8]);
        match instruction.op {
            Op::ADD(Operand::Register(Reg::AL), Operand::Register(Reg::BL)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
        let instruction = decode(&[0x31, 0xdb]);
        match instruction.op {
            Op::XOR(Operand::Register(Reg::BX), Operand::Register(Reg::BX)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_displacement_only_memory() {
        let instruction = decode(&[0x8b, 0x1e, 0x00, 0x20]);
        assert_eq!(4, instruction.len);
        match instruction.op {
            Op::MOV(
                Operand::Register(Reg::BX),
                Operand::Memory {
                    base: AddressBase::DisplacementOnly,
                    displacement: 0x2000,
                    size: OperandSize::Word,
                },
            ) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_signed_displacement() {
        // 8A 47 FE is MOV AL, [BX-2].
        let instruction = decode(&[0x8a, 0x47, 0xfe]);
        match instruction.op {
            Op::MOV(
                Operand::Register(Reg::AL),
                Operand::Memory {
                    base: AddressBase::Bx,
                    displacement: -2,
                    ..
                },
            ) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_segment_move_extracts_sreg() {
        let instruction = decode(&[0x8e, 0xd8]);
        match instruction.op {
            Op::MOV(Operand::Segment(SegReg::DS), Operand::Register(Reg::AX)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_rejects_mov_to_cs() {
        let memory = setup_memory(&[0x8e, 0xc8]);
        let err = Instruction::decode(&memory, 0x0000, 0x0100).unwrap_err();
        assert_eq!(
            DecodeError::InvalidModRm {
                opcode: 0x8e,
                modrm: 0xc8,
                address: 0x0100
            },
            err
        );
    }

    #[test]
    fn decode_group_five_indirect_jump() {
        let instruction = decode(&[0xff, 0xe0]);
        match instruction.op {
            Op::JMPN(Operand::Register(Reg::AX)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_group_three_selects_operation() {
        let instruction = decode(&[0xf7, 0xe1]);
        match instruction.op {
            Op::MUL(Operand::Register(Reg::CX)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
        let instruction = decode(&[0xf6, 0xc0, 0x80]);
        match instruction.op {
            Op::TEST(Operand::Register(Reg::AL), Operand::Immediate(0x80)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_sign_extended_immediate() {
        // 83 C3 FF is ADD BX, -1 with the immediate widened to 16 bits.
        let instruction = decode(&[0x83, 0xc3, 0xff]);
        match instruction.op {
            Op::ADD(Operand::Register(Reg::BX), Operand::Immediate(0xffff)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_short_jump_backwards() {
        let instruction = decode(&[0xeb, 0xfe]);
        match instruction.op {
            Op::JMP(-2) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
        // Self loop: target is the jump itself.
        assert_eq!("jmp 0x0100", format!("{}", instruction));
    }

    #[test]
    fn decode_far_call_reads_offset_then_segment() {
        let instruction = decode(&[0x9a, 0x34, 0x12, 0x00, 0xf0]);
        match instruction.op {
            Op::CALLF(FarPointer::Direct(0xf000, 0x1234)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn decode_invalid_opcode() {
        let memory = setup_memory(&[0x0f, 0x00]);
        let err = Instruction::decode(&memory, 0x0000, 0x0100).unwrap_err();
        assert_eq!(
            DecodeError::InvalidOpcode {
                opcode: 0x0f,
                address: 0x0100
            },
            err
        );
    }

    #[test]
    fn decode_fetch_past_end_of_memory() {
        let mut memory = PhysicalMemory::new(
            0x0102,
            BreakPointHolder::new(),
            BreakPointHolder::new(),
        );
        memory.write_bytes(0x0100, &[0xb8, 0x34]).unwrap();
        let err = Instruction::decode(&memory, 0x0000, 0x0100).unwrap_err();
        assert_eq!(DecodeError::OutOfBounds { address: 0x0102 }, err);
    }

    #[test]
    fn decode_operand_size_prefix() {
        let instruction = decode(&[0x66, 0xb8, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(6, instruction.len);
        match instruction.op {
            Op::MOV(Operand::Register(Reg::EAX), Operand::Immediate(0x1234_5678)) => {}
            _ => panic!("unexpected op: {}", instruction),
        }
    }

    #[test]
    fn format_two_operand_instruction() {
        let instruction = decode(&[0x03, 0x47, 0x04]);
        assert_eq!("add ax, [bx+0x4]", format!("{}", instruction));
    }

    #[test]
    fn format_repeated_string_instruction() {
        let instruction = decode(&[0xf3, 0xa4]);
        assert_eq!("rep movsb", format!("{}", instruction));
        let instruction = decode(&[0xf2, 0xae]);
        assert_eq!("repne scasb", format!("{}", instruction));
    }
}
