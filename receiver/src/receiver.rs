// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Receiver front-end.
//!
//! Owns the transport, the encode driver, the IDR policy, and the
//! completion hand-off to the network sink. Threading model:
//!
//! - the caller's thread runs [`FrameReceiver::run`], reading frames and
//!   submitting them to the encoder in order,
//! - the compression session invokes the sample callback on its own
//!   threads; the callback only packs the bitstream and enqueues it,
//! - a dedicated sink thread drains the queue into the packetiser.
//!
//! One `exiting` flag cancels everything; every polling loop observes it
//! within a few milliseconds.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use framelink_protocol::{
    Frame, LinkError, Result, StreamConfig, DEFAULT_REGION_PATH, DEFAULT_TCP_PORT,
};

use crate::bitstream::BitstreamPacker;
use crate::encoder::{
    Codec, CompressionBackend, EncoderDriver, SampleCallback, DEFAULT_BITRATE_BPS,
};
use crate::idr::IdrScheduler;
use crate::pose::PoseHistory;
use crate::shm::ShmConsumer;
use crate::sink::BitstreamSink;
use crate::tcp::TcpConsumer;

const SINK_QUEUE_DEPTH: usize = 16;
const SINK_POLL: Duration = Duration::from_millis(10);
const SLOT_TIMEOUT: Duration = Duration::from_millis(20);

/// Delivery target for reassembled frames; both transports feed one of
/// these.
pub trait FrameHandler {
    /// A producer session is starting with the given geometry.
    fn on_stream_start(&mut self, config: &StreamConfig) -> Result<()>;

    /// One reassembled frame, pixels valid for the duration of the call.
    fn on_frame(&mut self, frame: &Frame) -> Result<()>;
}

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

/// Receiver configuration.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Transport selection.
    pub mode: TransportMode,
    /// Region file path (shm mode).
    pub region_path: PathBuf,
    /// Listening port (tcp mode); 0 asks for an ephemeral port.
    pub port: u16,
    /// Target encoder bitrate.
    pub bitrate_bps: u32,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfig {
            mode: TransportMode::Shm,
            region_path: PathBuf::from(DEFAULT_REGION_PATH),
            port: DEFAULT_TCP_PORT,
            bitrate_bps: DEFAULT_BITRATE_BPS,
        }
    }
}

/// Receiving counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiverStats {
    /// Frames handed to the encode driver.
    pub frames_received: u64,
    /// Producer sessions seen.
    pub streams_started: u64,
}

struct PackedOut {
    annexb: Vec<u8>,
    target_timestamp_ns: u64,
    is_keyframe: bool,
}

struct EncodeHandler<'a> {
    driver: &'a mut EncoderDriver,
    idr: &'a IdrScheduler,
    pose_history: &'a dyn PoseHistory,
    stats: &'a mut ReceiverStats,
}

impl FrameHandler for EncodeHandler<'_> {
    fn on_stream_start(&mut self, config: &StreamConfig) -> Result<()> {
        self.stats.streams_started += 1;
        self.idr.on_stream_start();
        self.driver.start(config.width, config.height)
    }

    fn on_frame(&mut self, frame: &Frame) -> Result<()> {
        self.stats.frames_received += 1;
        if self.pose_history.best_match(&frame.pose).is_none() {
            debug!("no pose match for frame {}", frame.frame_number);
        }
        match self.driver.submit(frame) {
            Ok(()) => Ok(()),
            Err(e @ LinkError::Encoder(_)) => {
                warn!("frame {} dropped: {e}", frame.frame_number);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Host-side front-end over either transport.
pub struct FrameReceiver {
    config: ReceiverConfig,
    exiting: Arc<AtomicBool>,
    sink_stop: Arc<AtomicBool>,
    idr: Arc<IdrScheduler>,
    driver: EncoderDriver,
    pose_history: Arc<dyn PoseHistory>,
    tcp: Option<TcpConsumer>,
    bound_port: Option<u16>,
    sink_thread: Option<thread::JoinHandle<()>>,
    stats: ReceiverStats,
    shut_down: bool,
}

impl FrameReceiver {
    /// Wires the pipeline up. In tcp mode the listener is bound here, so
    /// a busy port fails fast.
    pub fn new(
        config: ReceiverConfig,
        backend: Box<dyn CompressionBackend>,
        pose_history: Arc<dyn PoseHistory>,
        mut sink: Box<dyn BitstreamSink>,
    ) -> Result<Self> {
        let tcp = match config.mode {
            TransportMode::Tcp => Some(TcpConsumer::bind(config.port)?),
            TransportMode::Shm => None,
        };
        let bound_port = tcp.as_ref().map(TcpConsumer::port);

        let exiting = Arc::new(AtomicBool::new(false));
        let sink_stop = Arc::new(AtomicBool::new(false));
        let idr = Arc::new(IdrScheduler::new());

        let (packed_tx, packed_rx) = mpsc::sync_channel::<PackedOut>(SINK_QUEUE_DEPTH);
        let packer = Arc::new(BitstreamPacker::new());
        let on_sample: SampleCallback = Arc::new(move |sample, ctx| {
            let packed = packer.pack(&sample);
            let out = PackedOut {
                annexb: packed.annexb,
                target_timestamp_ns: ctx.target_timestamp_ns,
                is_keyframe: packed.is_keyframe,
            };
            // A closed queue means the receiver is shutting down; the
            // late completion is dropped.
            let _ = packed_tx.send(out);
        });

        let stop = Arc::clone(&sink_stop);
        let sink_thread = thread::spawn(move || loop {
            match packed_rx.recv_timeout(SINK_POLL) {
                Ok(out) => {
                    if let Err(e) = sink.emit_nal_stream(
                        Codec::Hevc,
                        &out.annexb,
                        out.target_timestamp_ns,
                        out.is_keyframe,
                    ) {
                        warn!("sink rejected sample: {e}");
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if stop.load(Ordering::Relaxed) {
                        break;
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        });

        let driver = EncoderDriver::new(backend, config.bitrate_bps, Arc::clone(&idr), on_sample);

        Ok(FrameReceiver {
            config,
            exiting,
            sink_stop,
            idr,
            driver,
            pose_history,
            tcp,
            bound_port,
            sink_thread: Some(sink_thread),
            stats: ReceiverStats::default(),
            shut_down: false,
        })
    }

    /// Cancellation flag, shared with signal handlers and tests.
    pub fn exiting_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.exiting)
    }

    /// Requests the run loop to wind down.
    pub fn request_exit(&self) {
        self.exiting.store(true, Ordering::SeqCst);
    }

    /// Keyframe control plane; packet-loss reports and explicit IDR
    /// requests land here.
    pub fn idr_scheduler(&self) -> Arc<IdrScheduler> {
        Arc::clone(&self.idr)
    }

    /// The bound TCP port, if in tcp mode.
    pub fn port(&self) -> Option<u16> {
        self.bound_port
    }

    /// Receiving counters.
    pub fn stats(&self) -> ReceiverStats {
        self.stats
    }

    /// Serves producers until exit is requested, then shuts the pipeline
    /// down in order: sockets, encoder drain, session release, region
    /// unlink.
    pub fn run(&mut self) -> Result<()> {
        let result = match self.config.mode {
            TransportMode::Shm => self.run_shm(),
            TransportMode::Tcp => self.run_tcp(),
        };
        self.shutdown();
        result
    }

    fn run_tcp(&mut self) -> Result<()> {
        let Some(consumer) = self.tcp.take() else {
            return Err(LinkError::Config("tcp consumer was not bound".into()));
        };

        while !self.exiting.load(Ordering::SeqCst) {
            let Some(mut stream) = consumer.accept(&self.exiting)? else {
                break;
            };
            let mut handler = EncodeHandler {
                driver: &mut self.driver,
                idr: &self.idr,
                pose_history: self.pose_history.as_ref(),
                stats: &mut self.stats,
            };
            match consumer.serve_connection(&mut stream, &self.exiting, &mut handler) {
                Ok(()) => {}
                Err(e) if e.tears_down_connection() => {
                    info!("session ended: {e}; listening again");
                }
                Err(LinkError::Io(e)) => {
                    info!("session I/O error: {e}; listening again");
                }
                Err(LinkError::Encoder(e)) => {
                    warn!("session aborted by the encoder: {e}; listening again");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn run_shm(&mut self) -> Result<()> {
        let mut consumer = ShmConsumer::create(&self.config.region_path)?;
        let Some(cfg) = consumer.wait_for_producer(&self.exiting) else {
            consumer.request_shutdown();
            return Ok(());
        };

        let mut handler = EncodeHandler {
            driver: &mut self.driver,
            idr: &self.idr,
            pose_history: self.pose_history.as_ref(),
            stats: &mut self.stats,
        };
        handler.on_stream_start(&cfg)?;

        while !self.exiting.load(Ordering::SeqCst) {
            let Some(ready) = consumer.next_ready_slot(SLOT_TIMEOUT, &self.exiting) else {
                if consumer.region().header().shutdown_requested() {
                    break;
                }
                continue;
            };
            {
                let pixels = consumer.pixels(&ready);
                let meta = ready.header;
                let frame = Frame {
                    frame_number: meta.frame_number,
                    image_index: 0,
                    width: meta.width,
                    height: meta.height,
                    stride: meta.stride,
                    is_idr: meta.is_idr,
                    target_timestamp_ns: meta.timestamp_ns,
                    pose: meta.pose,
                    pixels,
                };
                handler.on_frame(&frame)?;
            }
            consumer.complete(ready);
        }

        // Shutdown order: signal the producer, flush the encoder, release
        // the session, then take the region file away.
        consumer.request_shutdown();
        if let Err(e) = self.driver.drain() {
            warn!("encoder drain failed: {e}");
        }
        self.driver.stop();
        info!("shm session ended, {:?}", consumer.stats());
        consumer.unlink();
        Ok(())
    }

    /// Drains the encoder, releases the session, and joins the sink
    /// thread. Idempotent; `run` calls it on every exit path.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        self.exiting.store(true, Ordering::SeqCst);

        if let Err(e) = self.driver.drain() {
            warn!("encoder drain failed: {e}");
        }
        self.driver.stop();

        self.sink_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.sink_thread.take() {
            let _ = handle.join();
        }

        info!(
            "receiver stopped: {} frame(s) over {} stream(s)",
            self.stats.frames_received, self.stats.streams_started
        );
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_mode_parsing() {
        assert_eq!(TransportMode::parse("shm").unwrap(), TransportMode::Shm);
        assert_eq!(TransportMode::parse("tcp").unwrap(), TransportMode::Tcp);
        assert!(TransportMode::parse("vsock").is_err());
    }

    #[test]
    fn default_config_matches_transport_defaults() {
        let config = ReceiverConfig::default();
        assert_eq!(config.port, DEFAULT_TCP_PORT);
        assert_eq!(config.region_path, PathBuf::from(DEFAULT_REGION_PATH));
        assert_eq!(config.bitrate_bps, DEFAULT_BITRATE_BPS);
    }
}
