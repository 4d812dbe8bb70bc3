// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::PauseHandler;

// Design:
//   Breakpoints live in mutex guarded holders shared between the
//   emulation thread and the debug server thread. The per instruction
//   check first consults an atomic emptiness flag so an unused holder
//   costs one relaxed load. Matching callbacks fire after the lock is
//   released, so a callback may park the emulation thread or touch other
//   holders without deadlocking.

pub type BreakPointFn = Arc<dyn Fn(&BreakPoint) + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BreakPointType {
    Execution,
    Read,
    Write,
    Access,
    Cycles,
    MachineStop,
}

#[derive(Clone)]
pub struct BreakPoint {
    pub bp_type: BreakPointType,
    pub address: Option<u64>,
    pub remove_on_trigger: bool,
    on_reached: BreakPointFn,
}

impl BreakPoint {
    pub fn new(
        bp_type: BreakPointType,
        address: u64,
        on_reached: BreakPointFn,
        remove_on_trigger: bool,
    ) -> Self {
        BreakPoint {
            bp_type,
            address: Some(address),
            remove_on_trigger,
            on_reached,
        }
    }

    /// A breakpoint that matches any key, used for single stepping and
    /// machine stop.
    pub fn unconditional(
        bp_type: BreakPointType,
        on_reached: BreakPointFn,
        remove_on_trigger: bool,
    ) -> Self {
        BreakPoint {
            bp_type,
            address: None,
            remove_on_trigger,
            on_reached,
        }
    }

    pub fn matches(&self, key: u64) -> bool {
        match self.address {
            Some(address) => address == key,
            None => true,
        }
    }

    pub fn trigger(&self) {
        (self.on_reached)(self);
    }
}

impl fmt::Debug for BreakPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("BreakPoint")
            .field("bp_type", &self.bp_type)
            .field("address", &self.address)
            .field("remove_on_trigger", &self.remove_on_trigger)
            .finish()
    }
}

#[derive(Clone)]
pub struct BreakPointHolder {
    breakpoints: Arc<Mutex<Vec<BreakPoint>>>,
    count: Arc<AtomicUsize>,
}

impl BreakPointHolder {
    pub fn new() -> Self {
        BreakPointHolder {
            breakpoints: Arc::new(Mutex::new(Vec::new())),
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count.load(Ordering::Relaxed) == 0
    }

    pub fn add(&self, breakpoint: BreakPoint) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        breakpoints.push(breakpoint);
        self.count.store(breakpoints.len(), Ordering::Relaxed);
    }

    /// Remove every breakpoint with the same type and address.
    pub fn remove(&self, breakpoint: &BreakPoint) {
        let mut breakpoints = self.breakpoints.lock().unwrap();
        breakpoints
            .retain(|b| b.bp_type != breakpoint.bp_type || b.address != breakpoint.address);
        self.count.store(breakpoints.len(), Ordering::Relaxed);
    }

    pub fn toggle(&self, breakpoint: &BreakPoint, on: bool) {
        if on {
            self.add(breakpoint.clone());
        } else {
            self.remove(breakpoint);
        }
    }

    /// Fire the callback of every breakpoint matching the key. One shot
    /// breakpoints are unregistered before their callback runs.
    pub fn trigger_matching(&self, key: u64) {
        if self.is_empty() {
            return;
        }
        let matched = {
            let mut breakpoints = self.breakpoints.lock().unwrap();
            let matched: Vec<BreakPoint> = breakpoints
                .iter()
                .filter(|b| b.matches(key))
                .cloned()
                .collect();
            if !matched.is_empty() {
                breakpoints.retain(|b| !(b.matches(key) && b.remove_on_trigger));
                self.count.store(breakpoints.len(), Ordering::Relaxed);
            }
            matched
        };
        for breakpoint in matched {
            breakpoint.trigger();
        }
    }
}

/// Breakpoint coordinator for one machine. Execution and cycle holders are
/// checked from the run loop; read and write holders are wired into
/// physical memory at construction time.
#[derive(Clone)]
pub struct MachineBreakpoints {
    execution: BreakPointHolder,
    cycles: BreakPointHolder,
    machine_stop: Arc<Mutex<Option<BreakPoint>>>,
    memory_read: BreakPointHolder,
    memory_write: BreakPointHolder,
    pause_handler: PauseHandler,
}

impl MachineBreakpoints {
    pub fn new(
        pause_handler: PauseHandler,
        memory_read: BreakPointHolder,
        memory_write: BreakPointHolder,
    ) -> Self {
        MachineBreakpoints {
            execution: BreakPointHolder::new(),
            cycles: BreakPointHolder::new(),
            machine_stop: Arc::new(Mutex::new(None)),
            memory_read,
            memory_write,
            pause_handler,
        }
    }

    /// Install or remove a breakpoint. A missing breakpoint is a no-op so
    /// callers can pass through an optional without checking it.
    pub fn toggle_breakpoint(&self, breakpoint: Option<&BreakPoint>, on: bool) {
        let breakpoint = match breakpoint {
            Some(breakpoint) => breakpoint,
            None => return,
        };
        match breakpoint.bp_type {
            BreakPointType::Execution => self.execution.toggle(breakpoint, on),
            BreakPointType::Cycles => self.cycles.toggle(breakpoint, on),
            BreakPointType::Read => self.memory_read.toggle(breakpoint, on),
            BreakPointType::Write => self.memory_write.toggle(breakpoint, on),
            BreakPointType::Access => {
                self.memory_read.toggle(breakpoint, on);
                self.memory_write.toggle(breakpoint, on);
            }
            BreakPointType::MachineStop => {
                let mut slot = self.machine_stop.lock().unwrap();
                *slot = if on { Some(breakpoint.clone()) } else { None };
            }
        }
    }

    pub fn check_execution(&self, address: u64) {
        self.execution.trigger_matching(address);
    }

    pub fn check_cycles(&self, cycles: u64) {
        self.cycles.trigger_matching(cycles);
    }

    /// Called once when the run loop ends, so an attached debugger gets a
    /// final stop notification and a chance to inspect state.
    pub fn on_machine_stop(&self) {
        let stop = {
            let mut slot = self.machine_stop.lock().unwrap();
            match slot.as_ref() {
                Some(breakpoint) if breakpoint.remove_on_trigger => slot.take(),
                Some(breakpoint) => Some(breakpoint.clone()),
                None => None,
            }
        };
        if let Some(breakpoint) = stop {
            breakpoint.trigger();
        }
        self.pause_handler.wait_if_paused();
    }
}
