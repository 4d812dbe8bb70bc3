// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

use tin86_emu::system::MachineHandle;

use super::breakpoints::BreakPointHandler;
use super::io::{generate_response, generate_unsupported_response, GdbIo};
use super::memory::MemoryHandler;
use super::monitor::MonitorHandler;
use super::registers::RegisterHandler;

/// Commands of the gdb remote serial protocol, tagged by their first
/// character. Content is the rest of the payload, still unparsed.
#[derive(Debug, PartialEq)]
enum GdbCommand<'a> {
    // Execution
    Interrupt,
    Continue,
    Step,
    Kill,
    Detach,
    // Registers
    ReadAllRegisters,
    WriteAllRegisters(&'a str),
    ReadRegister(&'a str),
    WriteRegister(&'a str),
    // Memory
    ReadMemory(&'a str),
    WriteMemory(&'a str),
    // Breakpoints
    InsertBreakPoint(&'a str),
    RemoveBreakPoint(&'a str),
    // Session
    SetThread,
    ThreadAlive,
    ReasonHalted,
    Query(&'a str),
    Extended(&'a str),
    Unsupported,
}

impl<'a> GdbCommand<'a> {
    fn parse(command: &'a str) -> GdbCommand<'a> {
        let first = match command.chars().next() {
            Some(first) => first,
            None => return GdbCommand::Unsupported,
        };
        let content = &command[first.len_utf8()..];
        match first {
            '\u{3}' => GdbCommand::Interrupt,
            'c' => GdbCommand::Continue,
            'D' => GdbCommand::Detach,
            'g' => GdbCommand::ReadAllRegisters,
            'G' => GdbCommand::WriteAllRegisters(content),
            'H' => GdbCommand::SetThread,
            'k' => GdbCommand::Kill,
            'm' => GdbCommand::ReadMemory(content),
            'M' => GdbCommand::WriteMemory(content),
            'p' => GdbCommand::ReadRegister(content),
            'P' => GdbCommand::WriteRegister(content),
            'q' => GdbCommand::Query(content),
            's' => GdbCommand::Step,
            'T' => GdbCommand::ThreadAlive,
            'v' => GdbCommand::Extended(content),
            'z' => GdbCommand::RemoveBreakPoint(content),
            'Z' => GdbCommand::InsertBreakPoint(content),
            '?' => GdbCommand::ReasonHalted,
            _ => GdbCommand::Unsupported,
        }
    }
}

/// gdb remote serial protocol server for the machine.
///
/// Design:
///   The server owns its listening socket and serves one client at a time.
///   Every command runs against a machine that has been asked to park, so
///   handlers see a stable register file and memory. Execution control
///   commands leave a flag behind that releases the machine once the
///   command has been answered.
pub struct GdbServer {
    // Dependencies
    machine: MachineHandle,
    // I/O
    listener: TcpListener,
}

impl GdbServer {
    pub fn bind(machine: MachineHandle, addr: SocketAddr) -> io::Result<GdbServer> {
        let listener = TcpListener::bind(addr)?;
        info!(target: "gdb", "Listening on {}", listener.local_addr()?);
        Ok(GdbServer { machine, listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves clients one after another until the listener fails. On the
    /// way out the machine is halted and released so it cannot stay parked
    /// behind a server that no longer exists.
    pub fn run(&self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(target: "gdb", "Client connected from {}", peer);
                    match Session::start(self.machine.clone(), stream) {
                        Ok(()) => info!(target: "gdb", "Client disconnected"),
                        Err(error) => error!(target: "gdb", "Session failed, error - {}", error),
                    }
                }
                Err(error) => {
                    error!(target: "gdb", "Accept failed, error - {}", error);
                    break;
                }
            }
        }
        self.machine.halt();
    }
}

struct Session {
    // Dependencies
    machine: MachineHandle,
    registers: RegisterHandler,
    memory: MemoryHandler,
    breakpoints: BreakPointHandler,
    monitor: MonitorHandler,
    // I/O
    io: GdbIo,
    // Runtime State
    connected: bool,
}

impl Session {
    fn start(machine: MachineHandle, stream: TcpStream) -> io::Result<()> {
        let io = GdbIo::new(stream)?;
        let breakpoints = BreakPointHandler::new(machine.clone(), io.writer().clone());
        let monitor = MonitorHandler::new(machine.clone(), breakpoints.stop_callback());
        let mut session = Session {
            registers: RegisterHandler::new(machine.clone()),
            memory: MemoryHandler::new(machine.clone()),
            breakpoints,
            monitor,
            machine,
            io,
            connected: true,
        };
        session.handle()
    }

    fn handle(&mut self) -> io::Result<()> {
        // A fresh client wants the machine stopped so it can look around.
        self.breakpoints.set_resume_on_command_end(false);
        self.machine.get_pause_handler().request_pause();
        while self.connected {
            match self.io.read_command()? {
                Some(command) => {
                    if command.trim().is_empty() {
                        continue;
                    }
                    self.run_command(&command)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    fn run_command(&mut self, command: &str) -> io::Result<()> {
        debug!(target: "gdb", "Received command {:?}", command);
        let pause_handler = self.machine.get_pause_handler();
        pause_handler.request_pause_and_wait();
        let result = match self.dispatch(command) {
            Some(response) => self.io.writer().send_response(&response),
            None => Ok(()),
        };
        if self.breakpoints.resume_on_command_end() {
            pause_handler.request_resume();
        }
        result
    }

    fn dispatch(&mut self, command: &str) -> Option<String> {
        match GdbCommand::parse(command) {
            GdbCommand::Interrupt | GdbCommand::Step => self.breakpoints.step(),
            GdbCommand::Continue => self.breakpoints.continue_command(),
            GdbCommand::Detach => {
                self.connected = false;
                self.breakpoints.set_resume_on_command_end(true);
                Some(generate_response("OK"))
            }
            GdbCommand::Kill => {
                self.machine.halt();
                Some(generate_response("OK"))
            }
            GdbCommand::SetThread | GdbCommand::ThreadAlive => Some(generate_response("OK")),
            GdbCommand::ReasonHalted => Some(generate_response("S05")),
            GdbCommand::ReadAllRegisters => Some(self.registers.read_all()),
            GdbCommand::WriteAllRegisters(content) => Some(self.registers.write_all(content)),
            GdbCommand::ReadRegister(content) => Some(self.registers.read_one(content)),
            GdbCommand::WriteRegister(content) => Some(self.registers.write_one(content)),
            GdbCommand::ReadMemory(content) => Some(self.memory.read(content)),
            GdbCommand::WriteMemory(content) => Some(self.memory.write(content)),
            GdbCommand::InsertBreakPoint(content) => Some(self.breakpoints.add(content)),
            GdbCommand::RemoveBreakPoint(content) => Some(self.breakpoints.remove(content)),
            GdbCommand::Query(content) => Some(self.query(content)),
            GdbCommand::Extended(content) => Some(match content {
                "MustReplyEmpty" | "Cont?" => generate_response(""),
                _ => generate_unsupported_response(),
            }),
            GdbCommand::Unsupported => {
                debug!(target: "gdb", "Unsupported command {:?}", command);
                Some(generate_unsupported_response())
            }
        }
    }

    fn query(&self, content: &str) -> String {
        if content.starts_with("Supported") {
            generate_response("")
        } else if content.starts_with("Attached") {
            generate_response("1")
        } else if content.starts_with("C") {
            generate_response("QC1")
        } else if content.starts_with("fThreadInfo") {
            generate_response("m1")
        } else if content.starts_with("sThreadInfo") {
            generate_response("l")
        } else if content.starts_with("TStatus") {
            generate_response("")
        } else if content.starts_with("Rcmd") {
            self.monitor.handle(content)
        } else if content.starts_with("Search:memory:") {
            self.memory.search(content, self.io.raw_command())
        } else {
            debug!(target: "gdb", "Unsupported query {:?}", content);
            generate_unsupported_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_tagged_by_first_character() {
        assert_eq!(GdbCommand::ReadAllRegisters, GdbCommand::parse("g"));
        assert_eq!(GdbCommand::ReadMemory("100,2"), GdbCommand::parse("m100,2"));
        assert_eq!(
            GdbCommand::WriteRegister("8=34120000"),
            GdbCommand::parse("P8=34120000")
        );
        assert_eq!(GdbCommand::Query("Supported:xml"), GdbCommand::parse("qSupported:xml"));
        assert_eq!(GdbCommand::Interrupt, GdbCommand::parse("\u{3}"));
        assert_eq!(GdbCommand::Unsupported, GdbCommand::parse("X100:aa"));
        assert_eq!(GdbCommand::Unsupported, GdbCommand::parse(""));
    }

    #[test]
    fn case_distinguishes_insert_from_remove() {
        assert_eq!(
            GdbCommand::InsertBreakPoint("0,1100,1"),
            GdbCommand::parse("Z0,1100,1")
        );
        assert_eq!(
            GdbCommand::RemoveBreakPoint("0,1100,1"),
            GdbCommand::parse("z0,1100,1")
        );
    }
}
