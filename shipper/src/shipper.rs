// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Shipper front-end.
//!
//! Owns the chosen transport, stamps frame numbers and timestamps, and
//! moves staged frames from a [`FrameSource`] to the host. The render
//! thread calls [`FrameShipper::ship`] directly; nothing in here blocks
//! beyond the transport's own bounded work.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use framelink_protocol::region::StreamConfig;
use framelink_protocol::wire::InitHeader;
use framelink_protocol::{Frame, LinkError, Pose, Result, DEFAULT_REGION_PATH, DEFAULT_TCP_PORT};

use crate::shm::ShmProducer;
use crate::source::FrameSource;
use crate::tcp::TcpProducer;
use crate::SubmitOutcome;

const SHM_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which transport carries the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// Lock-free shared-memory ring.
    Shm,
    /// Loopback TCP bytestream.
    Tcp,
}

impl TransportMode {
    /// Parses a CLI value.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "shm" => Ok(TransportMode::Shm),
            "tcp" => Ok(TransportMode::Tcp),
            other => Err(LinkError::Config(format!(
                "unknown transport '{other}', expected 'shm' or 'tcp'"
            ))),
        }
    }
}

/// Shipper configuration.
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Transport selection.
    pub mode: TransportMode,
    /// Region file path (shm mode).
    pub region_path: PathBuf,
    /// Receiver port (tcp mode).
    pub port: u16,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Producer-side pixel-format identifier, opaque to the receiver.
    pub format_tag: u32,
    /// Swapchain image count.
    pub num_images: u32,
    /// Target frame rate for the paced run loop.
    pub target_fps: u32,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        ShipperConfig {
            mode: TransportMode::Shm,
            region_path: PathBuf::from(DEFAULT_REGION_PATH),
            port: DEFAULT_TCP_PORT,
            width: 1920,
            height: 1080,
            format_tag: 87,
            num_images: 3,
            target_fps: 60,
        }
    }
}

/// Shipping counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShipperStats {
    /// Frames handed to the transport.
    pub published: u64,
    /// Frames dropped by the transport.
    pub dropped: u64,
}

enum Transport {
    Shm(ShmProducer),
    Tcp(TcpProducer),
}

/// Producer front-end over either transport.
pub struct FrameShipper {
    config: ShipperConfig,
    transport: Transport,
    frame_number: u64,
    image_index: u32,
    stats: ShipperStats,
}

impl FrameShipper {
    /// Sets the chosen transport up. In shm mode this waits for the
    /// receiver to initialise the region and refuses a foreign one; in
    /// tcp mode a failed first dial is tolerated and retried on submit.
    pub fn connect(config: ShipperConfig) -> Result<Self> {
        let transport = match config.mode {
            TransportMode::Shm => {
                let producer = ShmProducer::open(&config.region_path)?;
                producer.init(
                    StreamConfig {
                        width: config.width,
                        height: config.height,
                        format_tag: config.format_tag,
                    },
                    SHM_INIT_TIMEOUT,
                )?;
                Transport::Shm(producer)
            }
            TransportMode::Tcp => {
                let init = InitHeader {
                    num_images: config.num_images,
                    device_uuid: *uuid::Uuid::new_v4().as_bytes(),
                    width: config.width,
                    height: config.height,
                    format_tag: config.format_tag,
                    mem_index: 0,
                    source_pid: std::process::id(),
                };
                let mut producer = TcpProducer::new(config.port, init);
                if let Err(e) = producer.connect() {
                    warn!("receiver not reachable yet: {e}");
                }
                Transport::Tcp(producer)
            }
        };
        info!(
            "shipper up: {:?} {}x{} @ {} fps",
            config.mode, config.width, config.height, config.target_fps
        );
        Ok(FrameShipper {
            config,
            transport,
            frame_number: 0,
            image_index: 0,
            stats: ShipperStats::default(),
        })
    }

    /// Ships one staged frame. The first frame of the stream is always
    /// marked IDR so the receiver can start a decodable stream.
    pub fn ship(
        &mut self,
        pixels: &[u8],
        stride: u32,
        pose: Pose,
        idr_hint: bool,
        target_timestamp_ns: u64,
    ) -> Result<SubmitOutcome> {
        let frame = Frame {
            frame_number: self.frame_number,
            image_index: self.image_index,
            width: self.config.width,
            height: self.config.height,
            stride,
            is_idr: idr_hint || self.frame_number == 0,
            target_timestamp_ns,
            pose,
            pixels,
        };

        let outcome = match &mut self.transport {
            Transport::Shm(producer) => producer.submit(&frame)?,
            Transport::Tcp(producer) => producer.submit(&frame)?,
        };

        // The render counter advances whether the transport kept the
        // frame or not; dropped frames stay dropped.
        self.frame_number += 1;
        self.image_index = (self.image_index + 1) % self.config.num_images;
        match outcome {
            SubmitOutcome::Published => self.stats.published += 1,
            SubmitOutcome::Dropped => self.stats.dropped += 1,
        }
        Ok(outcome)
    }

    /// Paced produce-and-ship loop for the shipper binary. Returns when
    /// `exiting` is observed or the receiver goes away for good.
    pub fn run(&mut self, source: &mut dyn FrameSource, exiting: &AtomicBool) -> Result<()> {
        source.init(self.config.width, self.config.height)?;
        let interval = Duration::from_micros(1_000_000 / u64::from(self.config.target_fps.max(1)));
        let mut last_frame = Instant::now();

        while !exiting.load(Ordering::SeqCst) {
            let staged = source.next_frame()?;
            let target_ns = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_nanos() as u64);

            match self.ship(
                staged.pixels,
                staged.stride,
                staged.pose,
                staged.is_idr,
                target_ns,
            ) {
                Ok(_) => {}
                Err(LinkError::PeerGone(reason)) => {
                    info!("receiver finished the session: {reason}");
                    break;
                }
                Err(e) => return Err(e),
            }

            let elapsed = last_frame.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
            last_frame = Instant::now();
        }
        Ok(())
    }

    /// Shipping counters.
    pub fn stats(&self) -> ShipperStats {
        self.stats
    }

    /// Shuts the transport down. Idempotent.
    pub fn shutdown(&mut self) {
        match &mut self.transport {
            Transport::Shm(producer) => producer.shutdown(),
            Transport::Tcp(producer) => producer.shutdown(),
        }
        info!(
            "shipper stopped: {} published, {} dropped",
            self.stats.published, self.stats.dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_mode_parsing() {
        assert_eq!(TransportMode::parse("shm").unwrap(), TransportMode::Shm);
        assert_eq!(TransportMode::parse("tcp").unwrap(), TransportMode::Tcp);
        assert!(TransportMode::parse("unix").is_err());
    }

    #[test]
    fn default_config_matches_transport_defaults() {
        let config = ShipperConfig::default();
        assert_eq!(config.port, DEFAULT_TCP_PORT);
        assert_eq!(config.region_path, PathBuf::from(DEFAULT_REGION_PATH));
        assert_eq!(config.num_images, 3);
    }
}
