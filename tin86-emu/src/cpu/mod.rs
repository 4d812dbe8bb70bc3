// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

mod exec;
mod instruction;
mod operand;
mod processor;

pub use self::exec::execute;
pub use self::instruction::{DecodeError, FarPointer, Instruction, Op};
pub use self::operand::{AddressBase, Operand, OperandSize};
pub use self::processor::{Flags, Prefixes, Processor, Reg, Repeat, SegReg};

/// Control flow outcome of a single executed instruction.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Flow {
    /// Advance to the next sequential instruction.
    Next,
    /// Control was transferred, IP already points at the target.
    Jump,
    /// Back up to the instruction start so an active repeat prefix runs again.
    Rewind,
    /// The program requested termination with the given exit code.
    Exit(u8),
}
