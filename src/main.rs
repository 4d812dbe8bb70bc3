// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

#[macro_use]
extern crate log;

mod app;
mod cli;
mod console;
mod util;

use std::path::Path;
use std::process;

use structopt::StructOpt;

use crate::app::App;
use crate::cli::Opt;
use crate::util::Logger;

static NAME: &str = "tin86";

fn main() {
    let opt = Opt::from_args();
    match run(&opt) {
        Ok(exit_code) => process::exit(i32::from(exit_code)),
        Err(err) => {
            println!("Error: {}", err);
            process::exit(1)
        }
    };
}

fn run(opt: &Opt) -> Result<u8, String> {
    let logger = Logger::build(opt.log_level.as_str(), &opt.log_target_level)?;
    Logger::enable(logger)?;
    info!("Starting {}", NAME);
    let options = cli::build_app_options(opt)?;
    let mut app = App::build(options)?;
    app.load_program(Path::new(&opt.image))?;
    app.run()
}
