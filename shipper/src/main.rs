// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Shipper CLI entry point.
//!
//! Drives the test-pattern source into the chosen transport at a fixed
//! frame rate. In production the renderer calls the shipper library
//! directly; this binary exists to exercise the link.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Arg, Command};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use framelink_protocol::DEFAULT_REGION_PATH;
use framelink_shipper::{FrameShipper, ShipperConfig, TestPatternSource, TransportMode};

fn main() -> io::Result<()> {
    let matches = Command::new("framelink-shipper")
        .version("0.1.0")
        .about("Producer side of the framelink frame transport")
        .arg(
            Arg::new("transport")
                .short('t')
                .long("transport")
                .value_name("MODE")
                .default_value("shm")
                .help("Transport to use: shm or tcp"),
        )
        .arg(
            Arg::new("region-path")
                .short('r')
                .long("region-path")
                .value_name("PATH")
                .default_value(DEFAULT_REGION_PATH)
                .help("Shared-memory region file (shm mode)"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_name("PORT")
                .default_value("9944")
                .help("Receiver TCP port (tcp mode)"),
        )
        .arg(
            Arg::new("width")
                .long("width")
                .value_name("PX")
                .default_value("1920")
                .help("Frame width in pixels"),
        )
        .arg(
            Arg::new("height")
                .long("height")
                .value_name("PX")
                .default_value("1080")
                .help("Frame height in pixels"),
        )
        .arg(
            Arg::new("fps")
                .short('f')
                .long("fps")
                .value_name("FPS")
                .default_value("60")
                .help("Target frames per second"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(clap::ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let parse_u32 = |name: &str| -> io::Result<u32> {
        matches
            .get_one::<String>(name)
            .map(String::as_str)
            .unwrap_or("0")
            .parse()
            .map_err(|e: std::num::ParseIntError| {
                io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
            })
    };

    let mode = TransportMode::parse(
        matches
            .get_one::<String>("transport")
            .map(String::as_str)
            .unwrap_or("shm"),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    let config = ShipperConfig {
        mode,
        region_path: PathBuf::from(
            matches
                .get_one::<String>("region-path")
                .map(String::as_str)
                .unwrap_or(DEFAULT_REGION_PATH),
        ),
        port: parse_u32("port")? as u16,
        width: parse_u32("width")?,
        height: parse_u32("height")?,
        target_fps: parse_u32("fps")?,
        ..ShipperConfig::default()
    };
    if config.port == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "port must be non-zero"));
    }

    info!("starting framelink-shipper with config: {config:?}");

    let exiting = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&exiting);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let mut shipper = FrameShipper::connect(config)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    let mut source = TestPatternSource::new();

    if let Err(e) = shipper.run(&mut source, &exiting) {
        error!("shipper loop failed: {e}");
    }

    shipper.shutdown();
    Ok(())
}
