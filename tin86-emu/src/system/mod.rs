// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

mod breakpoint;
mod machine;
mod pause;
mod vm;

pub use self::breakpoint::{
    BreakPoint, BreakPointFn, BreakPointHolder, BreakPointType, MachineBreakpoints,
};
pub use self::machine::{Machine, MachineHandle};
pub use self::pause::PauseHandler;
pub use self::vm::VirtualMachine;
