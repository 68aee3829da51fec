// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Receiver CLI entry point.
//!
//! Serves the chosen transport with the software compression stub and a
//! logging sink. A hardware backend plugs in through the
//! `CompressionBackend` trait in place of the stub.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Arg, Command};
use log::{error, info, LevelFilter};
use simple_logger::SimpleLogger;

use framelink_protocol::DEFAULT_REGION_PATH;
use framelink_receiver::encoder::stub::StubBackend;
use framelink_receiver::{
    FrameReceiver, LogSink, NullPoseHistory, ReceiverConfig, TransportMode, DEFAULT_BITRATE_BPS,
};

fn main() -> io::Result<()> {
    let matches = Command::new("framelink-receiver")
        .version("0.1.0")
        .about("Host side of the framelink frame transport")
        .arg(
            Arg::new("transport")
                .short('t')
                .long("transport")
                .value_name("MODE")
                .default_value("shm")
                .help("Transport to serve: shm or tcp"),
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
                .help("Listening TCP port (tcp mode)"),
        )
        .arg(
            Arg::new("bitrate")
                .short('b')
                .long("bitrate")
                .value_name("BPS")
                .default_value("10000000")
                .help("Target encoder bitrate in bits per second"),
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

    let config = ReceiverConfig {
        mode,
        region_path: PathBuf::from(
            matches
                .get_one::<String>("region-path")
                .map(String::as_str)
                .unwrap_or(DEFAULT_REGION_PATH),
        ),
        port: parse_u32("port")? as u16,
        bitrate_bps: match parse_u32("bitrate")? {
            0 => DEFAULT_BITRATE_BPS,
            bps => bps,
        },
    };

    info!("starting framelink-receiver with config: {config:?}");

    let mut receiver = FrameReceiver::new(
        config,
        Box::new(StubBackend),
        Arc::new(NullPoseHistory),
        Box::new(LogSink::new()),
    )
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    let exiting = receiver.exiting_flag();
    ctrlc::set_handler(move || {
        exiting.store(true, std::sync::atomic::Ordering::SeqCst);
    })
    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

    if let Err(e) = receiver.run() {
        error!("receiver failed: {e}");
        return Err(io::Error::new(io::ErrorKind::Other, e.to_string()));
    }
    Ok(())
}
