// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use tin86_core::util::to_physical;

use super::instruction::{FarPointer, Instruction, Op};
use super::operand::OperandSize;
use super::processor::{Processor, Reg, Repeat, SegReg};
use super::Flow;
use crate::io::PortDispatcher;
use crate::mem::PhysicalMemory;

// Design:
//   Handlers are written against operand descriptors, so each arm reads
//   its inputs, computes, stores and reports a Flow. String instructions
//   run a single iteration per step; the repeat prefix is honored by
//   rewinding IP so the next step fetches the same instruction until the
//   counter or the scan condition ends the run.

struct Arith {
    value: u32,
    carry: bool,
    overflow: bool,
    adjust: bool,
}

fn add_with_carry(a: u32, b: u32, carry_in: bool, size: OperandSize) -> Arith {
    let mask = size.mask();
    let a = a & mask;
    let b = b & mask;
    let wide = u64::from(a) + u64::from(b) + u64::from(carry_in as u8);
    let value = (wide as u32) & mask;
    Arith {
        value,
        carry: wide > u64::from(mask),
        overflow: (a ^ value) & (b ^ value) & size.sign_bit() != 0,
        adjust: (a ^ b ^ value) & 0x10 != 0,
    }
}

fn sub_with_borrow(a: u32, b: u32, borrow_in: bool, size: OperandSize) -> Arith {
    let mask = size.mask();
    let a = a & mask;
    let b = b & mask;
    let borrow = borrow_in as u32;
    let value = a.wrapping_sub(b).wrapping_sub(borrow) & mask;
    Arith {
        value,
        carry: u64::from(a) < u64::from(b) + u64::from(borrow),
        overflow: (a ^ b) & (a ^ value) & size.sign_bit() != 0,
        adjust: (a ^ b ^ value) & 0x10 != 0,
    }
}

fn set_szp(processor: &mut Processor, value: u32, size: OperandSize) {
    let value = value & size.mask();
    processor.flags.set_zero(value == 0);
    processor.flags.set_sign(value & size.sign_bit() != 0);
    processor.flags.set_parity((value as u8).count_ones() % 2 == 0);
}

fn apply_arith(processor: &mut Processor, result: &Arith, size: OperandSize) {
    processor.flags.set_carry(result.carry);
    processor.flags.set_overflow(result.overflow);
    processor.flags.set_adjust(result.adjust);
    set_szp(processor, result.value, size);
}

fn set_logic_flags(processor: &mut Processor, value: u32, size: OperandSize) {
    processor.flags.set_carry(false);
    processor.flags.set_overflow(false);
    processor.flags.set_adjust(false);
    set_szp(processor, value, size);
}

fn push_word(processor: &mut Processor, memory: &mut PhysicalMemory, value: u16) {
    let sp = (processor.get_register(Reg::SP) as u16).wrapping_sub(2);
    processor.set_register(Reg::SP, u32::from(sp));
    let address = to_physical(processor.get_segment(SegReg::SS), sp);
    memory.set_word(address, value);
}

fn pop_word(processor: &mut Processor, memory: &PhysicalMemory) -> u16 {
    let sp = processor.get_register(Reg::SP) as u16;
    let address = to_physical(processor.get_segment(SegReg::SS), sp);
    let value = memory.get_word(address);
    processor.set_register(Reg::SP, u32::from(sp.wrapping_add(2)));
    value
}

fn jump_relative(processor: &mut Processor, instruction: &Instruction, displacement: i16) -> Flow {
    processor.set_ip(instruction.next_ip().wrapping_add(displacement as u16));
    Flow::Jump
}

fn branch(
    processor: &mut Processor,
    instruction: &Instruction,
    displacement: i16,
    taken: bool,
) -> Flow {
    if taken {
        jump_relative(processor, instruction, displacement)
    } else {
        Flow::Next
    }
}

fn far_target(
    processor: &Processor,
    memory: &PhysicalMemory,
    pointer: &FarPointer,
) -> (u16, u16) {
    match *pointer {
        FarPointer::Direct(segment, offset) => (segment, offset),
        FarPointer::Memory(ref operand) => {
            let address = operand.linear_address(processor);
            let offset = memory.get_word(address);
            let segment = memory.get_word(address + 2);
            (segment, offset)
        }
    }
}

/// Raise an interrupt through the real mode vector table. Vector 0x20
/// and the DOS terminate call end the program instead.
fn interrupt(
    processor: &mut Processor,
    memory: &mut PhysicalMemory,
    vector: u8,
    return_ip: u16,
) -> Flow {
    match vector {
        0x20 => Flow::Exit(0),
        0x21 if processor.get_register(Reg::AH) == 0x4c => {
            Flow::Exit(processor.get_register(Reg::AL) as u8)
        }
        _ => {
            let flags = processor.flags.value() as u16;
            let cs = processor.get_segment(SegReg::CS);
            push_word(processor, memory, flags);
            push_word(processor, memory, cs);
            push_word(processor, memory, return_ip);
            processor.flags.set_interrupt(false);
            processor.flags.set_trap(false);
            let entry = u32::from(vector) * 4;
            let offset = memory.get_word(entry);
            let segment = memory.get_word(entry + 2);
            processor.set_segment(SegReg::CS, segment);
            processor.set_ip(offset);
            Flow::Jump
        }
    }
}

fn divide_error(
    processor: &mut Processor,
    memory: &mut PhysicalMemory,
    instruction: &Instruction,
) -> Flow {
    interrupt(processor, memory, 0, instruction.next_ip())
}

fn loop_counter(processor: &Processor) -> Reg {
    if processor.prefixes.address_size {
        Reg::ECX
    } else {
        Reg::CX
    }
}

// -- Shifts and rotates, bit at a time with the count masked to 5 bits.

fn shl(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let mask = size.mask();
    let mut value = value & mask;
    let mut carry = processor.flags.carry();
    for _ in 0..count {
        carry = value & size.sign_bit() != 0;
        value = (value << 1) & mask;
    }
    if count != 0 {
        processor.flags.set_carry(carry);
        if count == 1 {
            processor
                .flags
                .set_overflow(carry != (value & size.sign_bit() != 0));
        }
        set_szp(processor, value, size);
    }
    value
}

fn shr(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let mut value = value & size.mask();
    let original = value;
    let mut carry = processor.flags.carry();
    for _ in 0..count {
        carry = value & 1 != 0;
        value >>= 1;
    }
    if count != 0 {
        processor.flags.set_carry(carry);
        if count == 1 {
            processor.flags.set_overflow(original & size.sign_bit() != 0);
        }
        set_szp(processor, value, size);
    }
    value
}

fn sar(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let mut value = value & size.mask();
    let sign = value & size.sign_bit();
    let mut carry = processor.flags.carry();
    for _ in 0..count {
        carry = value & 1 != 0;
        value = (value >> 1) | sign;
    }
    if count != 0 {
        processor.flags.set_carry(carry);
        if count == 1 {
            processor.flags.set_overflow(false);
        }
        set_szp(processor, value, size);
    }
    value
}

fn rol(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let mask = size.mask();
    let mut value = value & mask;
    for _ in 0..count {
        let msb = value & size.sign_bit() != 0;
        value = ((value << 1) | msb as u32) & mask;
    }
    if count != 0 {
        let carry = value & 1 != 0;
        processor.flags.set_carry(carry);
        if count == 1 {
            processor
                .flags
                .set_overflow(carry != (value & size.sign_bit() != 0));
        }
    }
    value
}

fn ror(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let bits = size.bits();
    let mut value = value & size.mask();
    for _ in 0..count {
        let lsb = value & 1;
        value = (value >> 1) | (lsb << (bits - 1));
    }
    if count != 0 {
        processor.flags.set_carry(value & size.sign_bit() != 0);
        if count == 1 {
            let top_pair = (value >> (bits - 1)) ^ (value >> (bits - 2));
            processor.flags.set_overflow(top_pair & 1 != 0);
        }
    }
    value
}

fn rcl(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let mask = size.mask();
    let mut value = value & mask;
    let mut carry = processor.flags.carry();
    for _ in 0..count {
        let msb = value & size.sign_bit() != 0;
        value = ((value << 1) | carry as u32) & mask;
        carry = msb;
    }
    if count != 0 {
        processor.flags.set_carry(carry);
        if count == 1 {
            processor
                .flags
                .set_overflow(carry != (value & size.sign_bit() != 0));
        }
    }
    value
}

fn rcr(processor: &mut Processor, value: u32, count: u32, size: OperandSize) -> u32 {
    let bits = size.bits();
    let mut value = value & size.mask();
    let mut carry = processor.flags.carry();
    for _ in 0..count {
        let lsb = value & 1 != 0;
        value = (value >> 1) | ((carry as u32) << (bits - 1));
        carry = lsb;
    }
    if count != 0 {
        processor.flags.set_carry(carry);
        if count == 1 {
            let top_pair = (value >> (bits - 1)) ^ (value >> (bits - 2));
            processor.flags.set_overflow(top_pair & 1 != 0);
        }
    }
    value
}

// -- String instructions

#[derive(Clone, Copy)]
enum StringKind {
    Movs,
    Cmps,
    Stos,
    Lods,
    Scas,
    Ins,
    Outs,
}

fn read_string(memory: &PhysicalMemory, segment: u16, offset: u16, size: OperandSize) -> u32 {
    let address = to_physical(segment, offset);
    match size {
        OperandSize::Byte => u32::from(memory.get_byte(address)),
        OperandSize::Word => u32::from(memory.get_word(address)),
        OperandSize::Dword => memory.get_dword(address),
    }
}

fn write_string(
    memory: &mut PhysicalMemory,
    segment: u16,
    offset: u16,
    size: OperandSize,
    value: u32,
) {
    let address = to_physical(segment, offset);
    match size {
        OperandSize::Byte => memory.set_byte(address, value as u8),
        OperandSize::Word => memory.set_word(address, value as u16),
        OperandSize::Dword => memory.set_dword(address, value),
    }
}

fn string_iteration(
    processor: &mut Processor,
    memory: &mut PhysicalMemory,
    ports: &mut PortDispatcher,
    kind: StringKind,
    size: OperandSize,
) {
    let delta = if processor.flags.direction() {
        size.bytes().wrapping_neg()
    } else {
        size.bytes()
    };
    let si = processor.get_register(Reg::SI) as u16;
    let di = processor.get_register(Reg::DI) as u16;
    // The source segment honors an override, the ES destination does not.
    let source = processor.get_segment(processor.segment_for(SegReg::DS));
    let dest = processor.get_segment(SegReg::ES);
    let accumulator = Reg::sized(0, size);
    let advance_si = |processor: &mut Processor| {
        processor.set_register(Reg::SI, u32::from(si.wrapping_add(delta)));
    };
    let advance_di = |processor: &mut Processor| {
        processor.set_register(Reg::DI, u32::from(di.wrapping_add(delta)));
    };
    match kind {
        StringKind::Movs => {
            let value = read_string(memory, source, si, size);
            write_string(memory, dest, di, size, value);
            advance_si(processor);
            advance_di(processor);
        }
        StringKind::Cmps => {
            let left = read_string(memory, source, si, size);
            let right = read_string(memory, dest, di, size);
            let result = sub_with_borrow(left, right, false, size);
            apply_arith(processor, &result, size);
            advance_si(processor);
            advance_di(processor);
        }
        StringKind::Stos => {
            let value = processor.get_register(accumulator);
            write_string(memory, dest, di, size, value);
            advance_di(processor);
        }
        StringKind::Lods => {
            let value = read_string(memory, source, si, size);
            processor.set_register(accumulator, value);
            advance_si(processor);
        }
        StringKind::Scas => {
            let left = processor.get_register(accumulator);
            let right = read_string(memory, dest, di, size);
            let result = sub_with_borrow(left, right, false, size);
            apply_arith(processor, &result, size);
            advance_di(processor);
        }
        StringKind::Ins => {
            let port = processor.get_register(Reg::DX) as u16;
            let value = match size {
                OperandSize::Byte => u32::from(ports.read_byte(port)),
                _ => u32::from(ports.read_word(port)),
            };
            write_string(memory, dest, di, size, value);
            advance_di(processor);
        }
        StringKind::Outs => {
            let port = processor.get_register(Reg::DX) as u16;
            let value = read_string(memory, source, si, size);
            match size {
                OperandSize::Byte => ports.write_byte(port, value as u8),
                _ => ports.write_word(port, value as u16),
            }
            advance_si(processor);
        }
    }
}

fn string_op(
    processor: &mut Processor,
    memory: &mut PhysicalMemory,
    ports: &mut PortDispatcher,
    kind: StringKind,
    size: OperandSize,
) -> Flow {
    let counter = loop_counter(processor);
    let repeat = processor.prefixes.repeat;
    if repeat.is_some() && processor.get_register(counter) == 0 {
        return Flow::Next;
    }
    string_iteration(processor, memory, ports, kind, size);
    match repeat {
        None => Flow::Next,
        Some(condition) => {
            let count = processor.get_register(counter).wrapping_sub(1);
            processor.set_register(counter, count);
            let keep_running = match kind {
                StringKind::Cmps | StringKind::Scas => match condition {
                    Repeat::Equal => processor.flags.zero(),
                    Repeat::NotEqual => !processor.flags.zero(),
                },
                _ => true,
            };
            if keep_running {
                Flow::Rewind
            } else {
                Flow::Next
            }
        }
    }
}

pub fn execute(
    processor: &mut Processor,
    memory: &mut PhysicalMemory,
    ports: &mut PortDispatcher,
    instruction: &Instruction,
) -> Flow {
    match instruction.op {
        // -- Data Movement
        Op::MOV(ref dst, ref src) => {
            let value = src.get(processor, memory);
            dst.set(processor, memory, value);
            Flow::Next
        }
        Op::XCHG(ref dst, ref src) => {
            let left = dst.get(processor, memory);
            let right = src.get(processor, memory);
            dst.set(processor, memory, right);
            src.set(processor, memory, left);
            Flow::Next
        }
        Op::PUSH(ref operand) => {
            let value = operand.get(processor, memory) as u16;
            push_word(processor, memory, value);
            Flow::Next
        }
        Op::POP(ref operand) => {
            let value = pop_word(processor, memory);
            operand.set(processor, memory, u32::from(value));
            Flow::Next
        }
        Op::PUSHA => {
            let sp = processor.get_register(Reg::SP) as u16;
            for reg in &[Reg::AX, Reg::CX, Reg::DX, Reg::BX] {
                let value = processor.get_register(*reg) as u16;
                push_word(processor, memory, value);
            }
            push_word(processor, memory, sp);
            for reg in &[Reg::BP, Reg::SI, Reg::DI] {
                let value = processor.get_register(*reg) as u16;
                push_word(processor, memory, value);
            }
            Flow::Next
        }
        Op::POPA => {
            for reg in &[Reg::DI, Reg::SI, Reg::BP] {
                let value = pop_word(processor, memory);
                processor.set_register(*reg, u32::from(value));
            }
            // The saved SP is discarded.
            let _ = pop_word(processor, memory);
            for reg in &[Reg::BX, Reg::DX, Reg::CX, Reg::AX] {
                let value = pop_word(processor, memory);
                processor.set_register(*reg, u32::from(value));
            }
            Flow::Next
        }
        Op::PUSHF => {
            let value = processor.flags.value() as u16;
            push_word(processor, memory, value);
            Flow::Next
        }
        Op::POPF => {
            let value = pop_word(processor, memory);
            processor.flags.set_word(value);
            Flow::Next
        }
        Op::LAHF => {
            let flags = processor.flags.value() as u8;
            processor.set_register(Reg::AH, u32::from(flags));
            Flow::Next
        }
        Op::SAHF => {
            let ah = processor.get_register(Reg::AH);
            processor.flags.set_sign(ah & 0x80 != 0);
            processor.flags.set_zero(ah & 0x40 != 0);
            processor.flags.set_adjust(ah & 0x10 != 0);
            processor.flags.set_parity(ah & 0x04 != 0);
            processor.flags.set_carry(ah & 0x01 != 0);
            Flow::Next
        }
        Op::LEA(ref dst, ref src) => {
            let offset = src.effective_address(processor);
            dst.set(processor, memory, u32::from(offset));
            Flow::Next
        }
        Op::LDS(ref dst, ref src) | Op::LES(ref dst, ref src) => {
            let address = src.linear_address(processor);
            let offset = memory.get_word(address);
            let segment = memory.get_word(address + 2);
            dst.set(processor, memory, u32::from(offset));
            let seg_reg = match instruction.op {
                Op::LDS(..) => SegReg::DS,
                _ => SegReg::ES,
            };
            processor.set_segment(seg_reg, segment);
            Flow::Next
        }
        Op::XLAT => {
            let segment = processor.get_segment(processor.segment_for(SegReg::DS));
            let bx = processor.get_register(Reg::BX) as u16;
            let al = processor.get_register(Reg::AL) as u16;
            let value = memory.get_byte(to_physical(segment, bx.wrapping_add(al)));
            processor.set_register(Reg::AL, u32::from(value));
            Flow::Next
        }
        Op::IN(ref dst, ref port) => {
            let port = port.get(processor, memory) as u16;
            let value = match dst.size() {
                OperandSize::Byte => u32::from(ports.read_byte(port)),
                _ => u32::from(ports.read_word(port)),
            };
            dst.set(processor, memory, value);
            Flow::Next
        }
        Op::OUT(ref port, ref src) => {
            let port = port.get(processor, memory) as u16;
            let value = src.get(processor, memory);
            match src.size() {
                OperandSize::Byte => ports.write_byte(port, value as u8),
                _ => ports.write_word(port, value as u16),
            }
            Flow::Next
        }
        // -- Arithmetic
        Op::ADD(ref dst, ref src) => {
            let size = dst.size();
            let result = add_with_carry(
                dst.get(processor, memory),
                src.get(processor, memory),
                false,
                size,
            );
            dst.set(processor, memory, result.value);
            apply_arith(processor, &result, size);
            Flow::Next
        }
        Op::ADC(ref dst, ref src) => {
            let size = dst.size();
            let carry = processor.flags.carry();
            let result = add_with_carry(
                dst.get(processor, memory),
                src.get(processor, memory),
                carry,
                size,
            );
            dst.set(processor, memory, result.value);
            apply_arith(processor, &result, size);
            Flow::Next
        }
        Op::SUB(ref dst, ref src) => {
            let size = dst.size();
            let result = sub_with_borrow(
                dst.get(processor, memory),
                src.get(processor, memory),
                false,
                size,
            );
            dst.set(processor, memory, result.value);
            apply_arith(processor, &result, size);
            Flow::Next
        }
        Op::SBB(ref dst, ref src) => {
            let size = dst.size();
            let borrow = processor.flags.carry();
            let result = sub_with_borrow(
                dst.get(processor, memory),
                src.get(processor, memory),
                borrow,
                size,
            );
            dst.set(processor, memory, result.value);
            apply_arith(processor, &result, size);
            Flow::Next
        }
        Op::CMP(ref dst, ref src) => {
            let size = dst.size();
            let result = sub_with_borrow(
                dst.get(processor, memory),
                src.get(processor, memory),
                false,
                size,
            );
            apply_arith(processor, &result, size);
            Flow::Next
        }
        Op::INC(ref operand) => {
            let size = operand.size();
            let result = add_with_carry(operand.get(processor, memory), 1, false, size);
            operand.set(processor, memory, result.value);
            // INC and DEC leave CF alone.
            processor.flags.set_overflow(result.overflow);
            processor.flags.set_adjust(result.adjust);
            set_szp(processor, result.value, size);
            Flow::Next
        }
        Op::DEC(ref operand) => {
            let size = operand.size();
            let result = sub_with_borrow(operand.get(processor, memory), 1, false, size);
            operand.set(processor, memory, result.value);
            processor.flags.set_overflow(result.overflow);
            processor.flags.set_adjust(result.adjust);
            set_szp(processor, result.value, size);
            Flow::Next
        }
        Op::NEG(ref operand) => {
            let size = operand.size();
            let result = sub_with_borrow(0, operand.get(processor, memory), false, size);
            operand.set(processor, memory, result.value);
            apply_arith(processor, &result, size);
            Flow::Next
        }
        Op::MUL(ref operand) => {
            let size = operand.size();
            let src = u64::from(operand.get(processor, memory) & size.mask());
            let high = match size {
                OperandSize::Byte => {
                    let result = u64::from(processor.get_register(Reg::AL)) * src;
                    processor.set_register(Reg::AX, result as u32 & 0xffff);
                    (result >> 8) & 0xff != 0
                }
                OperandSize::Word => {
                    let result = u64::from(processor.get_register(Reg::AX)) * src;
                    processor.set_register(Reg::AX, result as u32 & 0xffff);
                    processor.set_register(Reg::DX, (result >> 16) as u32 & 0xffff);
                    (result >> 16) & 0xffff != 0
                }
                OperandSize::Dword => {
                    let result = u64::from(processor.get_register(Reg::EAX)) * src;
                    processor.set_register(Reg::EAX, result as u32);
                    processor.set_register(Reg::EDX, (result >> 32) as u32);
                    (result >> 32) != 0
                }
            };
            processor.flags.set_carry(high);
            processor.flags.set_overflow(high);
            Flow::Next
        }
        Op::IMUL(ref operand) => {
            let size = operand.size();
            let src = operand.get(processor, memory);
            let overflow = match size {
                OperandSize::Byte => {
                    let a = processor.get_register(Reg::AL) as u8 as i8;
                    let b = src as u8 as i8;
                    let result = i16::from(a) * i16::from(b);
                    processor.set_register(Reg::AX, u32::from(result as u16));
                    result != i16::from(result as i8)
                }
                OperandSize::Word => {
                    let a = processor.get_register(Reg::AX) as u16 as i16;
                    let b = src as u16 as i16;
                    let result = i32::from(a) * i32::from(b);
                    processor.set_register(Reg::AX, u32::from(result as u16));
                    processor.set_register(Reg::DX, u32::from((result >> 16) as u16));
                    result != i32::from(result as i16)
                }
                OperandSize::Dword => {
                    let a = processor.get_register(Reg::EAX) as i32;
                    let b = src as i32;
                    let result = i64::from(a) * i64::from(b);
                    processor.set_register(Reg::EAX, result as u32);
                    processor.set_register(Reg::EDX, (result >> 32) as u32);
                    result != i64::from(result as i32)
                }
            };
            processor.flags.set_carry(overflow);
            processor.flags.set_overflow(overflow);
            Flow::Next
        }
        Op::DIV(ref operand) => {
            let size = operand.size();
            let divisor = u64::from(operand.get(processor, memory) & size.mask());
            if divisor == 0 {
                return divide_error(processor, memory, instruction);
            }
            match size {
                OperandSize::Byte => {
                    let dividend = u64::from(processor.get_register(Reg::AX));
                    let quotient = dividend / divisor;
                    if quotient > 0xff {
                        return divide_error(processor, memory, instruction);
                    }
                    processor.set_register(Reg::AL, quotient as u32);
                    processor.set_register(Reg::AH, (dividend % divisor) as u32);
                }
                OperandSize::Word => {
                    let dividend = u64::from(processor.get_register(Reg::DX)) << 16
                        | u64::from(processor.get_register(Reg::AX));
                    let quotient = dividend / divisor;
                    if quotient > 0xffff {
                        return divide_error(processor, memory, instruction);
                    }
                    processor.set_register(Reg::AX, quotient as u32);
                    processor.set_register(Reg::DX, (dividend % divisor) as u32);
                }
                OperandSize::Dword => {
                    let dividend = u64::from(processor.get_register(Reg::EDX)) << 32
                        | u64::from(processor.get_register(Reg::EAX));
                    let quotient = dividend / divisor;
                    if quotient > u64::from(u32::max_value()) {
                        return divide_error(processor, memory, instruction);
                    }
                    processor.set_register(Reg::EAX, quotient as u32);
                    processor.set_register(Reg::EDX, (dividend % divisor) as u32);
                }
            }
            Flow::Next
        }
        Op::IDIV(ref operand) => {
            let size = operand.size();
            let src = operand.get(processor, memory);
            match size {
                OperandSize::Byte => {
                    let divisor = i32::from(src as u8 as i8);
                    if divisor == 0 {
                        return divide_error(processor, memory, instruction);
                    }
                    let dividend = i32::from(processor.get_register(Reg::AX) as u16 as i16);
                    let quotient = dividend / divisor;
                    if quotient < i32::from(i8::min_value()) || quotient > i32::from(i8::max_value())
                    {
                        return divide_error(processor, memory, instruction);
                    }
                    processor.set_register(Reg::AL, quotient as u32);
                    processor.set_register(Reg::AH, (dividend % divisor) as u32);
                }
                OperandSize::Word => {
                    let divisor = i64::from(src as u16 as i16);
                    if divisor == 0 {
                        return divide_error(processor, memory, instruction);
                    }
                    let dividend = i64::from(
                        (i64::from(processor.get_register(Reg::DX)) << 16
                            | i64::from(processor.get_register(Reg::AX)))
                            as u32 as i32,
                    );
                    let quotient = dividend / divisor;
                    if quotient < i64::from(i16::min_value())
                        || quotient > i64::from(i16::max_value())
                    {
                        return divide_error(processor, memory, instruction);
                    }
                    processor.set_register(Reg::AX, quotient as u32);
                    processor.set_register(Reg::DX, (dividend % divisor) as u32);
                }
                OperandSize::Dword => {
                    let divisor = i128::from(src as i32);
                    if divisor == 0 {
                        return divide_error(processor, memory, instruction);
                    }
                    let dividend = i128::from(
                        (i64::from(processor.get_register(Reg::EDX)) << 32
                            | i64::from(processor.get_register(Reg::EAX)))
                            as i64,
                    );
                    let quotient = dividend / divisor;
                    if quotient < i128::from(i32::min_value())
                        || quotient > i128::from(i32::max_value())
                    {
                        return divide_error(processor, memory, instruction);
                    }
                    processor.set_register(Reg::EAX, quotient as u32);
                    processor.set_register(Reg::EDX, (dividend % divisor) as u32);
                }
            }
            Flow::Next
        }
        Op::CBW => {
            let al = processor.get_register(Reg::AL) as u8;
            processor.set_register(Reg::AX, u32::from(i16::from(al as i8) as u16));
            Flow::Next
        }
        Op::CWD => {
            let ax = processor.get_register(Reg::AX);
            let dx = if ax & 0x8000 != 0 { 0xffff } else { 0 };
            processor.set_register(Reg::DX, dx);
            Flow::Next
        }
        // -- Logical
        Op::AND(ref dst, ref src) => {
            let size = dst.size();
            let value = dst.get(processor, memory) & src.get(processor, memory);
            dst.set(processor, memory, value);
            set_logic_flags(processor, value, size);
            Flow::Next
        }
        Op::OR(ref dst, ref src) => {
            let size = dst.size();
            let value = dst.get(processor, memory) | src.get(processor, memory);
            dst.set(processor, memory, value);
            set_logic_flags(processor, value, size);
            Flow::Next
        }
        Op::XOR(ref dst, ref src) => {
            let size = dst.size();
            let value = dst.get(processor, memory) ^ src.get(processor, memory);
            dst.set(processor, memory, value);
            set_logic_flags(processor, value, size);
            Flow::Next
        }
        Op::NOT(ref operand) => {
            let size = operand.size();
            let value = !operand.get(processor, memory) & size.mask();
            operand.set(processor, memory, value);
            Flow::Next
        }
        Op::TEST(ref dst, ref src) => {
            let size = dst.size();
            let value = dst.get(processor, memory) & src.get(processor, memory);
            set_logic_flags(processor, value, size);
            Flow::Next
        }
        // -- Shift and Rotate
        Op::SHL(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = shl(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        Op::SHR(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = shr(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        Op::SAR(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = sar(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        Op::ROL(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = rol(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        Op::ROR(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = ror(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        Op::RCL(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = rcl(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        Op::RCR(ref dst, ref count) => {
            let size = dst.size();
            let count = count.get(processor, memory) & 0x1f;
            let value = dst.get(processor, memory);
            let result = rcr(processor, value, count, size);
            dst.set(processor, memory, result);
            Flow::Next
        }
        // -- Control Flow
        Op::JMP(rel) => jump_relative(processor, instruction, rel),
        Op::JMPF(ref pointer) => {
            let (segment, offset) = far_target(processor, memory, pointer);
            processor.set_segment(SegReg::CS, segment);
            processor.set_ip(offset);
            Flow::Jump
        }
        Op::JMPN(ref operand) => {
            let target = operand.get(processor, memory) as u16;
            processor.set_ip(target);
            Flow::Jump
        }
        Op::JO(rel) => {
            let taken = processor.flags.overflow();
            branch(processor, instruction, rel, taken)
        }
        Op::JNO(rel) => {
            let taken = !processor.flags.overflow();
            branch(processor, instruction, rel, taken)
        }
        Op::JB(rel) => {
            let taken = processor.flags.carry();
            branch(processor, instruction, rel, taken)
        }
        Op::JNB(rel) => {
            let taken = !processor.flags.carry();
            branch(processor, instruction, rel, taken)
        }
        Op::JZ(rel) => {
            let taken = processor.flags.zero();
            branch(processor, instruction, rel, taken)
        }
        Op::JNZ(rel) => {
            let taken = !processor.flags.zero();
            branch(processor, instruction, rel, taken)
        }
        Op::JBE(rel) => {
            let taken = processor.flags.carry() || processor.flags.zero();
            branch(processor, instruction, rel, taken)
        }
        Op::JNBE(rel) => {
            let taken = !processor.flags.carry() && !processor.flags.zero();
            branch(processor, instruction, rel, taken)
        }
        Op::JS(rel) => {
            let taken = processor.flags.sign();
            branch(processor, instruction, rel, taken)
        }
        Op::JNS(rel) => {
            let taken = !processor.flags.sign();
            branch(processor, instruction, rel, taken)
        }
        Op::JP(rel) => {
            let taken = processor.flags.parity();
            branch(processor, instruction, rel, taken)
        }
        Op::JNP(rel) => {
            let taken = !processor.flags.parity();
            branch(processor, instruction, rel, taken)
        }
        Op::JL(rel) => {
            let taken = processor.flags.sign() != processor.flags.overflow();
            branch(processor, instruction, rel, taken)
        }
        Op::JNL(rel) => {
            let taken = processor.flags.sign() == processor.flags.overflow();
            branch(processor, instruction, rel, taken)
        }
        Op::JLE(rel) => {
            let taken =
                processor.flags.zero() || processor.flags.sign() != processor.flags.overflow();
            branch(processor, instruction, rel, taken)
        }
        Op::JNLE(rel) => {
            let taken =
                !processor.flags.zero() && processor.flags.sign() == processor.flags.overflow();
            branch(processor, instruction, rel, taken)
        }
        Op::JCXZ(rel) => {
            let taken = processor.get_register(loop_counter(processor)) == 0;
            branch(processor, instruction, rel, taken)
        }
        Op::LOOP(rel) => {
            let counter = loop_counter(processor);
            let count = processor.get_register(counter).wrapping_sub(1);
            processor.set_register(counter, count);
            let taken = processor.get_register(counter) != 0;
            branch(processor, instruction, rel, taken)
        }
        Op::LOOPE(rel) => {
            let counter = loop_counter(processor);
            let count = processor.get_register(counter).wrapping_sub(1);
            processor.set_register(counter, count);
            let taken = processor.get_register(counter) != 0 && processor.flags.zero();
            branch(processor, instruction, rel, taken)
        }
        Op::LOOPNE(rel) => {
            let counter = loop_counter(processor);
            let count = processor.get_register(counter).wrapping_sub(1);
            processor.set_register(counter, count);
            let taken = processor.get_register(counter) != 0 && !processor.flags.zero();
            branch(processor, instruction, rel, taken)
        }
        Op::CALL(rel) => {
            push_word(processor, memory, instruction.next_ip());
            jump_relative(processor, instruction, rel)
        }
        Op::CALLF(ref pointer) => {
            let (segment, offset) = far_target(processor, memory, pointer);
            let cs = processor.get_segment(SegReg::CS);
            push_word(processor, memory, cs);
            push_word(processor, memory, instruction.next_ip());
            processor.set_segment(SegReg::CS, segment);
            processor.set_ip(offset);
            Flow::Jump
        }
        Op::CALLN(ref operand) => {
            let target = operand.get(processor, memory) as u16;
            push_word(processor, memory, instruction.next_ip());
            processor.set_ip(target);
            Flow::Jump
        }
        Op::RET(adjust) => {
            let target = pop_word(processor, memory);
            let sp = processor.get_register(Reg::SP) as u16;
            processor.set_register(Reg::SP, u32::from(sp.wrapping_add(adjust)));
            processor.set_ip(target);
            Flow::Jump
        }
        Op::RETF(adjust) => {
            let target = pop_word(processor, memory);
            let segment = pop_word(processor, memory);
            let sp = processor.get_register(Reg::SP) as u16;
            processor.set_register(Reg::SP, u32::from(sp.wrapping_add(adjust)));
            processor.set_segment(SegReg::CS, segment);
            processor.set_ip(target);
            Flow::Jump
        }
        Op::INT(vector) => interrupt(processor, memory, vector, instruction.next_ip()),
        Op::INT3 => interrupt(processor, memory, 3, instruction.next_ip()),
        Op::INTO => {
            if processor.flags.overflow() {
                interrupt(processor, memory, 4, instruction.next_ip())
            } else {
                Flow::Next
            }
        }
        Op::IRET => {
            let target = pop_word(processor, memory);
            let segment = pop_word(processor, memory);
            let flags = pop_word(processor, memory);
            processor.set_segment(SegReg::CS, segment);
            processor.set_ip(target);
            processor.flags.set_word(flags);
            Flow::Jump
        }
        // -- String
        Op::MOVS(size) => string_op(processor, memory, ports, StringKind::Movs, size),
        Op::CMPS(size) => string_op(processor, memory, ports, StringKind::Cmps, size),
        Op::STOS(size) => string_op(processor, memory, ports, StringKind::Stos, size),
        Op::LODS(size) => string_op(processor, memory, ports, StringKind::Lods, size),
        Op::SCAS(size) => string_op(processor, memory, ports, StringKind::Scas, size),
        Op::INS(size) => string_op(processor, memory, ports, StringKind::Ins, size),
        Op::OUTS(size) => string_op(processor, memory, ports, StringKind::Outs, size),
        // -- Flags and Control
        Op::CLC => {
            processor.flags.set_carry(false);
            Flow::Next
        }
        Op::STC => {
            processor.flags.set_carry(true);
            Flow::Next
        }
        Op::CMC => {
            let carry = processor.flags.carry();
            processor.flags.set_carry(!carry);
            Flow::Next
        }
        Op::CLD => {
            processor.flags.set_direction(false);
            Flow::Next
        }
        Op::STD => {
            processor.flags.set_direction(true);
            Flow::Next
        }
        Op::CLI => {
            processor.flags.set_interrupt(false);
            Flow::Next
        }
        Op::STI => {
            processor.flags.set_interrupt(true);
            Flow::Next
        }
        Op::HLT => Flow::Exit(0),
        Op::NOP | Op::WAIT => Flow::Next,
    }
}
