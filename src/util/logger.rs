// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use log::{self, LogLevel, LogMetadata, LogRecord};

const CONFIG_PATH: &str = "logger.conf";

pub struct Logger {
    level: LogLevel,
    targets: HashMap<String, LogLevel>,
}

impl Logger {
    /// Assemble a logger from the global level, the optional logger.conf
    /// file and per target overrides given on the command line. Later
    /// sources win.
    pub fn build(level: &str, target_levels: &[(String, String)]) -> Result<Logger, String> {
        let loglevel =
            LogLevel::from_str(level).map_err(|_| format!("invalid log level {}", level))?;
        let mut logger = Logger {
            level: loglevel,
            targets: HashMap::new(),
        };
        let path = Path::new(CONFIG_PATH);
        if path.exists() {
            logger.load_config(path)?;
        }
        for (target, target_level) in target_levels {
            logger.add_target(target.clone(), target_level.clone())?;
        }
        Ok(logger)
    }

    pub fn enable(logger: Logger) -> Result<(), String> {
        log::set_logger(|max_log_level| {
            max_log_level.set(logger.get_level().to_log_level_filter());
            Box::new(logger)
        })
        .map_err(|_| "cannot initialize logging".to_string())
    }

    pub fn add_target(&mut self, target: String, level: String) -> Result<(), String> {
        let loglevel = LogLevel::from_str(&level)
            .map_err(|_| format!("invalid log level {} for target {}", level, &target))?;
        self.targets.insert(target, loglevel);
        Ok(())
    }

    pub fn get_level(&self) -> LogLevel {
        self.level
    }

    fn load_config(&mut self, path: &Path) -> Result<(), String> {
        let file = File::open(path)
            .map_err(|err| format!("failed to open {}, error - {}", CONFIG_PATH, err))?;
        let reader = BufReader::new(file);
        let mut line_num = 0;
        for l in reader.lines() {
            line_num += 1;
            let line = l.map_err(|err| format!("{}", err))?;
            if line.is_empty() {
                continue;
            }
            if let Some(equals) = line.find('=') {
                let (target, level) = line.split_at(equals);
                self.add_target(target.to_string(), level[1..].to_string())?;
            } else {
                return Err(format!("invalid logger config line {}", line_num));
            }
        }
        Ok(())
    }
}

impl log::Log for Logger {
    fn enabled(&self, metadata: &LogMetadata) -> bool {
        if let Some(target_level) = self.targets.get(metadata.target()) {
            metadata.level() <= (*target_level)
        } else {
            metadata.level() <= self.level
        }
    }

    fn log(&self, record: &LogRecord) {
        if self.enabled(record.metadata()) {
            println!(
                "{} [{}] - {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }
}
