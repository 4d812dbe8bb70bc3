// This file is part of tin86.
// Copyright (c) 2020-2023 tin86 contributors. All rights reserved.
// Licensed under the GPLv3. See LICENSE file in the project root for full license text.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;

use structopt::StructOpt;
use tin86_core::util::SegmentedAddress;

use crate::app;

#[derive(StructOpt, Debug)]
#[structopt(name = "tin86")]
pub struct Opt {
    /// program image to load and run
    #[structopt(parse(from_os_str))]
    pub image: PathBuf,

    // -- Machine
    /// set load address as a hex segment:offset pair
    #[structopt(
        long = "load-address",
        default_value = "0100:0100",
        parse(try_from_str = parse_segmented_addr)
    )]
    pub load_address: SegmentedAddress,
    /// set memory size in KiB
    #[structopt(long = "memory", default_value = "640")]
    pub memory: u32,

    // -- Debug
    /// start gdb server
    #[structopt(long)]
    pub debug: bool,
    /// set gdb server address, port 0 leaves the server off
    #[structopt(
        long = "dbg-address",
        default_value = "127.0.0.1:9999",
        parse(try_from_str = parse_socket_addr)
    )]
    pub dbg_address: SocketAddr,

    // -- Logging
    /// set log level
    #[structopt(long = "loglevel", default_value = "info")]
    pub log_level: String,
    /// set log level for a target
    #[structopt(long = "log", parse(try_from_str = parse_key_val))]
    pub log_target_level: Vec<(String, String)>,
}

pub fn build_app_options(opt: &Opt) -> Result<app::Options, String> {
    if opt.memory == 0 || opt.memory > 1024 {
        return Err(format!("invalid memory size {} KiB", opt.memory));
    }
    Ok(app::Options {
        entry: opt.load_address,
        memory_size: opt.memory as usize * 1024,
        debug: opt.debug,
        dbg_address: opt.dbg_address,
    })
}

fn parse_key_val<T, U>(s: &str) -> Result<(T, U), Box<dyn Error>>
where
    T: std::str::FromStr,
    T::Err: Error + 'static,
    U: std::str::FromStr,
    U::Err: Error + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

fn parse_segmented_addr(s: &str) -> Result<SegmentedAddress, Box<dyn Error>> {
    let pos = s
        .find(':')
        .ok_or_else(|| format!("invalid address: no `:` found in `{}`", s))?;
    let segment = u16::from_str_radix(&s[..pos], 16)?;
    let offset = u16::from_str_radix(&s[pos + 1..], 16)?;
    Ok(SegmentedAddress::new(segment, offset))
}

fn parse_socket_addr(s: &str) -> Result<SocketAddr, Box<dyn Error>> {
    s.parse::<SocketAddr>()
        .map_err(|_| Box::<dyn Error>::from("invalid address".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_load_address() {
        let addr = parse_segmented_addr("0100:0100").unwrap();
        assert_eq!(SegmentedAddress::new(0x0100, 0x0100), addr);
        let addr = parse_segmented_addr("F000:FFF0").unwrap();
        assert_eq!(SegmentedAddress::new(0xf000, 0xfff0), addr);
    }

    #[test]
    fn reject_malformed_load_address() {
        assert!(parse_segmented_addr("0100").is_err());
        assert!(parse_segmented_addr("zz:0100").is_err());
    }

    #[test]
    fn parse_log_target_pair() {
        let (target, level): (String, String) = parse_key_val("cpu=debug").unwrap();
        assert_eq!("cpu", target);
        assert_eq!("debug", level);
        assert!(parse_key_val::<String, String>("cpu").is_err());
    }
}
