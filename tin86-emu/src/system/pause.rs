// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

// Design:
//   Two flags under one mutex. The debugger sets requested and the
//   emulation thread parks in wait_if_paused, marking itself paused so
//   request_pause_and_wait can tell when the cpu is actually stopped.
//   Waits are bounded by a short interval instead of blocking on the
//   condvar alone, so a resume or shutdown is observed within one tick
//   even if a wakeup is missed.

struct PauseState {
    requested: bool,
    paused: bool,
}

#[derive(Clone)]
pub struct PauseHandler {
    state: Arc<(Mutex<PauseState>, Condvar)>,
}

impl PauseHandler {
    pub fn new() -> Self {
        PauseHandler {
            state: Arc::new((
                Mutex::new(PauseState {
                    requested: false,
                    paused: false,
                }),
                Condvar::new(),
            )),
        }
    }

    /// Ask the emulation thread to stop at its next safe point. Returns
    /// immediately.
    pub fn request_pause(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.requested = true;
        cvar.notify_all();
    }

    /// Ask the emulation thread to stop and block until it has parked.
    pub fn request_pause_and_wait(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.requested = true;
        while !state.paused {
            let (next, _timeout) = cvar.wait_timeout(state, POLL_INTERVAL).unwrap();
            state = next;
        }
    }

    /// Clear the pause request and wake the parked thread. Pause persists
    /// until this is called; there is no timeout on the paused side.
    pub fn request_resume(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.requested = false;
        cvar.notify_all();
    }

    pub fn is_pause_requested(&self) -> bool {
        let (lock, _cvar) = &*self.state;
        lock.lock().unwrap().requested
    }

    pub fn is_paused(&self) -> bool {
        let (lock, _cvar) = &*self.state;
        lock.lock().unwrap().paused
    }

    /// Emulation thread safe point. Parks while a pause is requested and
    /// returns once it is cleared.
    pub fn wait_if_paused(&self) {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        while state.requested {
            state.paused = true;
            cvar.notify_all();
            let (next, _timeout) = cvar.wait_timeout(state, POLL_INTERVAL).unwrap();
            state = next;
        }
        if state.paused {
            state.paused = false;
            cvar.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    fn spin_until<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..2000 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn no_pause_requested_returns_immediately() {
        let handler = PauseHandler::new();
        handler.wait_if_paused();
        assert!(!handler.is_paused());
    }

    #[test]
    fn resume_releases_a_parked_thread() {
        let handler = PauseHandler::new();
        handler.request_pause();
        let worker = handler.clone();
        let thread = thread::spawn(move || {
            worker.wait_if_paused();
        });
        assert!(spin_until(|| handler.is_paused()));
        handler.request_resume();
        thread.join().unwrap();
        assert!(!handler.is_paused());
        assert!(!handler.is_pause_requested());
    }

    #[test]
    fn pause_and_wait_blocks_until_the_cpu_parks() {
        let handler = PauseHandler::new();
        let worker = handler.clone();
        let running = Arc::new(Mutex::new(true));
        let running_flag = running.clone();
        let thread = thread::spawn(move || loop {
            if !*running_flag.lock().unwrap() {
                break;
            }
            worker.wait_if_paused();
            thread::sleep(Duration::from_millis(1));
        });
        handler.request_pause_and_wait();
        assert!(handler.is_paused());
        handler.request_resume();
        *running.lock().unwrap() = false;
        thread.join().unwrap();
    }
}
