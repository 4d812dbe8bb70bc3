// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tin86_emu::system::{BreakPoint, BreakPointFn, BreakPointType, MachineHandle};

use super::hex;
use super::io;
use super::io::GdbWriter;

/// Breakpoint commands and the execution control that rides on them.
///
/// The machine parks between the breakpoint checks for an instruction and
/// its execution. A one shot unconditional breakpoint armed while parked
/// therefore lets exactly one instruction retire before the next check
/// fires, which is what single stepping is.
pub struct BreakPointHandler {
    // Dependencies
    machine: MachineHandle,
    writer: GdbWriter,
    // Runtime State
    resume_on_command_end: Arc<AtomicBool>,
}

impl BreakPointHandler {
    pub fn new(machine: MachineHandle, writer: GdbWriter) -> Self {
        BreakPointHandler {
            machine,
            writer,
            resume_on_command_end: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the machine should be released once the current command has
    /// been answered.
    pub fn resume_on_command_end(&self) -> bool {
        self.resume_on_command_end.load(Ordering::SeqCst)
    }

    pub fn set_resume_on_command_end(&self, value: bool) {
        self.resume_on_command_end.store(value, Ordering::SeqCst);
    }

    /// Callback attached to every breakpoint this session installs. It runs
    /// on the machine thread: the machine is asked to park and the client
    /// gets its stop reply on the spot.
    pub fn stop_callback(&self) -> BreakPointFn {
        let writer = self.writer.clone();
        let pause_handler = self.machine.get_pause_handler();
        let resume_on_command_end = self.resume_on_command_end.clone();
        Arc::new(move |breakpoint| {
            debug!(target: "gdb", "Breakpoint reached: {:?}", breakpoint);
            resume_on_command_end.store(false, Ordering::SeqCst);
            pause_handler.request_pause();
            let response = io::generate_response("S05");
            if let Err(error) = writer.send_response(&response) {
                error!(target: "gdb", "Failed to send stop reply, error - {}", error);
            }
        })
    }

    /// `Z type,addr,kind`. Inserts are acknowledged even when the arguments
    /// do not parse.
    pub fn add(&self, content: &str) -> String {
        let breakpoint = self.parse_breakpoint(content);
        self.machine
            .get_breakpoints()
            .toggle_breakpoint(breakpoint.as_ref(), true);
        io::generate_response("OK")
    }

    /// `z type,addr,kind`. Unparseable removes answer as unsupported.
    pub fn remove(&self, content: &str) -> String {
        match self.parse_breakpoint(content) {
            Some(breakpoint) => {
                self.machine
                    .get_breakpoints()
                    .toggle_breakpoint(Some(&breakpoint), false);
                io::generate_response("OK")
            }
            None => io::generate_unsupported_response(),
        }
    }

    /// `c`. The reply is deferred: the client hears back through the stop
    /// callback once a breakpoint fires.
    pub fn continue_command(&self) -> Option<String> {
        self.set_resume_on_command_end(true);
        self.machine.get_pause_handler().request_resume();
        None
    }

    /// `s` or the interrupt byte. Runs a single instruction and reports the
    /// stop like any other breakpoint hit.
    pub fn step(&self) -> Option<String> {
        self.set_resume_on_command_end(true);
        let breakpoint =
            BreakPoint::unconditional(BreakPointType::Execution, self.stop_callback(), true);
        self.machine
            .get_breakpoints()
            .toggle_breakpoint(Some(&breakpoint), true);
        None
    }

    fn parse_breakpoint(&self, content: &str) -> Option<BreakPoint> {
        let mut parts = content.split(',');
        let kind = parts.next()?.parse::<u32>().ok()?;
        let address = parts.next().and_then(hex::parse_u32)?;
        let bp_type = match kind {
            0 | 1 => BreakPointType::Execution,
            2 => BreakPointType::Write,
            3 => BreakPointType::Read,
            4 => BreakPointType::Access,
            _ => {
                error!(target: "gdb", "Unsupported breakpoint type {}", kind);
                return None;
            }
        };
        Some(BreakPoint::new(
            bp_type,
            u64::from(address),
            self.stop_callback(),
            false,
        ))
    }
}
