// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::thread;

use tin86_core::factory::MachineEvent;
use tin86_core::util::{new_shared, SegmentedAddress};
use tin86_debug::GdbServer;
use tin86_emu::system::Machine;

use crate::console::{ConsoleDevice, CONSOLE_PORT};

pub struct Options {
    pub entry: SegmentedAddress,
    pub memory_size: usize,
    // Debug
    pub debug: bool,
    pub dbg_address: SocketAddr,
}

pub struct App {
    // Components
    machine: Machine,
    // Configuration
    options: Options,
}

impl App {
    pub fn build(options: Options) -> Result<App, String> {
        let mut machine = Machine::build(options.memory_size);
        // Initialize devices
        machine.register_device(CONSOLE_PORT, new_shared(ConsoleDevice::new()));
        // Initialize event logging
        machine.add_listener(Box::new(|event| match event {
            MachineEvent::Error(message) => {
                error!(target: "app", "Machine error: {}", message)
            }
            MachineEvent::ProcessChanged(name) => {
                debug!(target: "app", "Process changed to {}", name)
            }
            MachineEvent::VideoModeChanged(mode) => {
                info!(target: "app", "Video mode {:02X}h", mode)
            }
            MachineEvent::StateChanged(_) => (),
        }));
        Ok(App { machine, options })
    }

    pub fn load_program(&mut self, path: &Path) -> Result<(), String> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "program".to_string());
        let image = load_file(path).map_err(|err| format!("Invalid image: {}", err))?;
        self.machine.load_program(&name, &image, self.options.entry)
    }

    pub fn run(&mut self) -> Result<u8, String> {
        if self.options.debug && self.options.dbg_address.port() != 0 {
            let server = GdbServer::bind(self.machine.debug_handle(), self.options.dbg_address)
                .map_err(|err| format!("Failed to start gdb server, error - {}", err))?;
            thread::spawn(move || server.run());
        }
        self.machine.run()
    }
}

fn load_file(path: &Path) -> Result<Vec<u8>, io::Error> {
    let mut data = Vec::new();
    let mut file = File::open(path)?;
    file.read_to_end(&mut data)?;
    Ok(data)
}
