// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::collections::HashMap;

use tin86_core::factory::PortDevice;
use tin86_core::util::Shared;

// Design:
//   Devices register for individual ports. A word access on a mapped port
//   is forwarded whole so the device can honor 16 bit transfers; on an
//   unmapped port it is composed from two byte accesses, each of which
//   dispatches on its own, so a device mapped next door still gets its half.

pub struct PortDispatcher {
    devices: HashMap<u16, Shared<dyn PortDevice>>,
}

impl PortDispatcher {
    pub fn new() -> Self {
        PortDispatcher {
            devices: HashMap::new(),
        }
    }

    pub fn register(&mut self, port: u16, device: Shared<dyn PortDevice>) {
        self.devices.insert(port, device);
    }

    pub fn read_byte(&mut self, port: u16) -> u8 {
        match self.devices.get(&port) {
            Some(device) => device.lock().unwrap().read_byte(port),
            None => {
                debug!(target: "io", "Read from unmapped port {:04X}", port);
                0xff
            }
        }
    }

    pub fn write_byte(&mut self, port: u16, value: u8) {
        match self.devices.get(&port) {
            Some(device) => device.lock().unwrap().write_byte(port, value),
            None => debug!(
                target: "io",
                "Dropped write of {:02X} to unmapped port {:04X}",
                value, port
            ),
        }
    }

    pub fn read_word(&mut self, port: u16) -> u16 {
        match self.devices.get(&port) {
            Some(device) => device.lock().unwrap().read_word(port),
            None => {
                let low = self.read_byte(port);
                let high = self.read_byte(port.wrapping_add(1));
                u16::from(high) << 8 | u16::from(low)
            }
        }
    }

    pub fn write_word(&mut self, port: u16, value: u16) {
        match self.devices.get(&port) {
            Some(device) => device.lock().unwrap().write_word(port, value),
            None => {
                self.write_byte(port, value as u8);
                self.write_byte(port.wrapping_add(1), (value >> 8) as u8);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tin86_core::util::new_shared;

    use super::*;

    struct Latch {
        value: u8,
    }

    impl PortDevice for Latch {
        fn read_byte(&mut self, _port: u16) -> u8 {
            self.value
        }

        fn write_byte(&mut self, _port: u16, value: u8) {
            self.value = value;
        }
    }

    #[test]
    fn unmapped_ports_float_high() {
        let mut dispatcher = PortDispatcher::new();
        assert_eq!(0xff, dispatcher.read_byte(0x03f8));
        assert_eq!(0xffff, dispatcher.read_word(0x03f8));
        // Dropped without complaint.
        dispatcher.write_byte(0x03f8, 0x42);
    }

    #[test]
    fn mapped_port_round_trip() {
        let mut dispatcher = PortDispatcher::new();
        dispatcher.register(0x00e9, new_shared(Latch { value: 0 }));
        dispatcher.write_byte(0x00e9, 0x42);
        assert_eq!(0x42, dispatcher.read_byte(0x00e9));
    }

    #[test]
    fn word_on_mapped_port_goes_to_the_device() {
        let mut dispatcher = PortDispatcher::new();
        dispatcher.register(0x0060, new_shared(Latch { value: 0x5a }));
        // The device defaults compose both halves from its own byte hook.
        assert_eq!(0x5a5a, dispatcher.read_word(0x0060));
    }

    #[test]
    fn word_on_unmapped_port_dispatches_per_byte() {
        let mut dispatcher = PortDispatcher::new();
        dispatcher.register(0x0011, new_shared(Latch { value: 0xab }));
        assert_eq!(0xabff, dispatcher.read_word(0x0010));
        dispatcher.write_word(0x0010, 0x1234);
        assert_eq!(0x12, dispatcher.read_byte(0x0011));
    }
}
