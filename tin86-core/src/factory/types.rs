// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

/// A port device represents a peripheral reachable through the CPU I/O
/// port space.
pub trait PortDevice: Send {
    /// Read byte from the specified port.
    fn read_byte(&mut self, port: u16) -> u8;
    /// Write byte to the specified port.
    fn write_byte(&mut self, port: u16, value: u8);
    /// Read word from the specified port.
    fn read_word(&mut self, port: u16) -> u16 {
        let lo = self.read_byte(port);
        let hi = self.read_byte(port.wrapping_add(1));
        u16::from(lo) | (u16::from(hi) << 8)
    }
    /// Write word to the specified port.
    fn write_word(&mut self, port: u16, value: u16) {
        self.write_byte(port, value as u8);
        self.write_byte(port.wrapping_add(1), (value >> 8) as u8);
    }
}

/// Lifecycle state of the machine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MachineState {
    NoProgram,
    Running,
    Paused,
    ProgramExited,
    Error,
}

/// Notifications emitted by the machine while it runs.
#[derive(Clone, Debug, PartialEq)]
pub enum MachineEvent {
    StateChanged(MachineState),
    Error(String),
    VideoModeChanged(u8),
    ProcessChanged(String),
}

/// Callback invoked for every machine event.
pub type EventListener = Box<dyn FnMut(&MachineEvent) + Send>;
