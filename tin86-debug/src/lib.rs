// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

#[macro_use]
extern crate log;

mod breakpoints;
mod hex;
mod io;
mod memory;
mod monitor;
mod registers;
mod server;

pub use self::server::GdbServer;
