// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Encode control plane.
//!
//! [`EncoderDriver`] wraps an opaque compression session obtained from a
//! [`CompressionBackend`] (the host's hardware encode capability). The
//! driver owns exactly one session at a time; re-init is a full
//! teardown/recreate. Frames are submitted in order from a single thread;
//! completions arrive asynchronously on whatever threads the host encoder
//! uses, possibly out of submit order, and are routed through the sample
//! callback without further assumptions.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use framelink_protocol::frame::copy_rows;
use framelink_protocol::{Frame, LinkError, Result};

use crate::idr::IdrScheduler;

/// Default target bitrate.
pub const DEFAULT_BITRATE_BPS: u32 = 10_000_000;

/// Periodic keyframe cadence enforced by the session itself.
pub const MAX_KEYFRAME_INTERVAL: u32 = 180;

/// Timebase of the submit-side clock: pts counts frames at 1/90 s.
pub const ENCODER_TIMESCALE: i32 = 90;

const ERROR_WINDOW: Duration = Duration::from_secs(2);
const ERROR_THRESHOLD: u32 = 3;

/// Codec carried by the session and reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Hevc,
}

/// Rational time value, `value / timescale` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeValue {
    pub value: i64,
    pub timescale: i32,
}

/// Session parameters handed to the backend at creation.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub width: u32,
    pub height: u32,
    pub codec: Codec,
    /// Real-time operation; the session may not buffer for quality.
    pub realtime: bool,
    /// Frame reordering is disabled for this transport.
    pub allow_frame_reordering: bool,
    pub bitrate_bps: u32,
    /// Upper bound on the distance between session-generated keyframes.
    pub max_keyframe_interval: u32,
}

/// Per-submit context, threaded through to the completion so sessions
/// stay isolated without process-wide state.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Target presentation timestamp of the source frame.
    pub target_timestamp_ns: u64,
    /// Whether this frame was forced to an IDR at submit time.
    pub is_idr: bool,
}

/// One completed sample from the session.
#[derive(Debug, Clone)]
pub struct EncodedSample {
    /// Concatenated NAL units, each prefixed with a 4-byte big-endian
    /// length.
    pub data: Vec<u8>,
    /// Parameter sets from the format description, VPS/SPS/PPS order.
    pub parameter_sets: Vec<Vec<u8>>,
    /// The "not sync" attachment: absent or false means keyframe.
    pub not_sync: Option<bool>,
    /// Presentation timestamp.
    pub pts: TimeValue,
}

/// Completion callback. Must be safe to call from any thread the host
/// encoder uses.
pub type SampleCallback = Arc<dyn Fn(EncodedSample, FrameContext) + Send + Sync>;

/// An open compression session. Dropping it destroys the session.
pub trait CompressionSession: Send {
    /// Submits one BGRA frame. May block if the session queue is full;
    /// the completion is always asynchronous.
    #[allow(clippy::too_many_arguments)]
    fn submit(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        pts: TimeValue,
        duration: TimeValue,
        force_keyframe: bool,
        ctx: FrameContext,
    ) -> Result<()>;

    /// Flushes every in-flight compression before returning.
    fn drain(&mut self) -> Result<()>;
}

/// The host encode capability.
pub trait CompressionBackend: Send {
    fn create_session(
        &self,
        config: &SessionConfig,
        on_sample: SampleCallback,
    ) -> Result<Box<dyn CompressionSession>>;
}

/// Driver lifecycle. Submits are only legal in `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Uninitialised,
    Preparing,
    Running,
    Draining,
    Stopped,
}

/// Owns the session, the staging buffer, and the IDR policy.
pub struct EncoderDriver {
    backend: Box<dyn CompressionBackend>,
    on_sample: SampleCallback,
    idr: Arc<IdrScheduler>,
    bitrate_bps: u32,
    state: DriverState,
    session: Option<Box<dyn CompressionSession>>,
    config: Option<SessionConfig>,
    staging: Vec<u8>,
    recent_errors: u32,
    first_error_at: Option<Instant>,
    frames_submitted: u64,
    frames_rejected: u64,
}

impl EncoderDriver {
    pub fn new(
        backend: Box<dyn CompressionBackend>,
        bitrate_bps: u32,
        idr: Arc<IdrScheduler>,
        on_sample: SampleCallback,
    ) -> Self {
        EncoderDriver {
            backend,
            on_sample,
            idr,
            bitrate_bps,
            state: DriverState::Uninitialised,
            session: None,
            config: None,
            staging: Vec::new(),
            recent_errors: 0,
            first_error_at: None,
            frames_submitted: 0,
            frames_rejected: 0,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Frames accepted by the session.
    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted
    }

    /// Frames the session rejected (dropped after logging).
    pub fn frames_rejected(&self) -> u64 {
        self.frames_rejected
    }

    /// Creates a real-time HEVC session for the given geometry. Calling
    /// this on a running driver is a full teardown/recreate.
    pub fn start(&mut self, width: u32, height: u32) -> Result<()> {
        self.session = None;
        self.state = DriverState::Preparing;
        let config = SessionConfig {
            width,
            height,
            codec: Codec::Hevc,
            realtime: true,
            allow_frame_reordering: false,
            bitrate_bps: self.bitrate_bps,
            max_keyframe_interval: MAX_KEYFRAME_INTERVAL,
        };
        match self.backend.create_session(&config, Arc::clone(&self.on_sample)) {
            Ok(session) => {
                self.session = Some(session);
                self.config = Some(config);
                self.state = DriverState::Running;
                self.recent_errors = 0;
                self.first_error_at = None;
                info!(
                    "compression session running: {width}x{height} at {} bps",
                    self.bitrate_bps
                );
                Ok(())
            }
            Err(e) => {
                self.state = DriverState::Uninitialised;
                Err(e)
            }
        }
    }

    /// Stages one frame into a tight-stride BGRA buffer and hands it to
    /// the session. A session rejection drops the frame after logging; it
    /// never propagates to the transport. Repeated rejections inside a
    /// short window escalate to a session recreate.
    pub fn submit(&mut self, frame: &Frame) -> Result<()> {
        if self.state != DriverState::Running {
            return Err(LinkError::Encoder(format!(
                "submit while {:?}",
                self.state
            )));
        }

        let row = frame.tight_stride() as usize;
        self.staging.resize(frame.tight_size(), 0);
        copy_rows(
            &mut self.staging,
            row,
            frame.pixels,
            frame.stride as usize,
            row,
            frame.height as usize,
        );

        let force_keyframe = self.idr.check_and_clear() || frame.is_idr;
        let pts = TimeValue {
            value: frame.frame_number as i64,
            timescale: ENCODER_TIMESCALE,
        };
        let duration = TimeValue {
            value: 1,
            timescale: ENCODER_TIMESCALE,
        };
        let ctx = FrameContext {
            target_timestamp_ns: frame.target_timestamp_ns,
            is_idr: force_keyframe,
        };

        let result = match self.session.as_mut() {
            Some(session) => session.submit(
                &self.staging,
                frame.width,
                frame.height,
                row as u32,
                pts,
                duration,
                force_keyframe,
                ctx,
            ),
            None => Err(LinkError::Encoder("no active session".into())),
        };

        match result {
            Ok(()) => {
                self.frames_submitted += 1;
                self.recent_errors = 0;
                self.first_error_at = None;
                Ok(())
            }
            Err(e) => {
                self.frames_rejected += 1;
                error!("encoder rejected frame {}: {e}", frame.frame_number);
                if force_keyframe {
                    // The forced IDR rode on a dropped frame; re-arm it.
                    self.idr.insert_idr();
                }
                self.note_error();
                Ok(())
            }
        }
    }

    /// Flushes in-flight compressions and leaves the driver `Stopped`.
    /// Idempotent.
    pub fn drain(&mut self) -> Result<()> {
        match self.state {
            DriverState::Running => {
                self.state = DriverState::Draining;
                let result = match self.session.as_mut() {
                    Some(session) => session.drain(),
                    None => Ok(()),
                };
                self.state = DriverState::Stopped;
                result
            }
            DriverState::Draining | DriverState::Stopped => Ok(()),
            DriverState::Uninitialised | DriverState::Preparing => {
                self.state = DriverState::Stopped;
                Ok(())
            }
        }
    }

    /// Drains and releases the session. Idempotent.
    pub fn stop(&mut self) {
        if let Err(e) = self.drain() {
            warn!("drain during stop failed: {e}");
        }
        self.session = None;
        self.state = DriverState::Stopped;
    }

    fn note_error(&mut self) {
        let now = Instant::now();
        match self.first_error_at {
            Some(first) if now.duration_since(first) <= ERROR_WINDOW => {
                self.recent_errors += 1;
            }
            _ => {
                self.first_error_at = Some(now);
                self.recent_errors = 1;
            }
        }
        if self.recent_errors < ERROR_THRESHOLD {
            return;
        }

        let Some(config) = self.config.clone() else {
            return;
        };
        warn!(
            "{} encoder errors inside {ERROR_WINDOW:?}, recreating the session",
            self.recent_errors
        );
        match self.start(config.width, config.height) {
            Ok(()) => self.idr.on_stream_start(),
            Err(e) => error!("session recreate failed: {e}"),
        }
    }
}

pub mod stub {
    //! Software stand-in for the host compression capability.
    //!
    //! Encodes nothing: each submitted frame becomes one deterministic
    //! length-prefixed NAL whose body carries a digest of the staged
    //! pixels. Completions are delivered from a worker thread, so the
    //! asynchronous callback path behaves like a real session's.

    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::{
        CompressionBackend, CompressionSession, EncodedSample, FrameContext, Result,
        SampleCallback, SessionConfig, TimeValue,
    };
    use framelink_protocol::LinkError;

    /// Parameter sets reported by the stub's format description.
    pub const STUB_VPS: [u8; 5] = [0x40, 0x01, 0x0c, 0x01, 0xff];
    pub const STUB_SPS: [u8; 4] = [0x42, 0x01, 0x01, 0x60];
    pub const STUB_PPS: [u8; 3] = [0x44, 0x01, 0xc0];

    const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

    /// FNV-1a digest of a staged frame. Tests use it to assert byte
    /// fidelity end to end without carrying whole frames around.
    pub fn pixel_digest(pixels: &[u8]) -> u64 {
        let mut hash = 0xcbf2_9ce4_8422_2325u64;
        for &byte in pixels {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    enum Job {
        Encode {
            keyframe: bool,
            pts: TimeValue,
            ctx: FrameContext,
            digest: u64,
            size: u32,
        },
        Drain(mpsc::Sender<()>),
    }

    /// Backend producing [`StubSession`]s.
    pub struct StubBackend;

    impl CompressionBackend for StubBackend {
        fn create_session(
            &self,
            config: &SessionConfig,
            on_sample: SampleCallback,
        ) -> Result<Box<dyn CompressionSession>> {
            Ok(Box::new(StubSession::spawn(config, on_sample)))
        }
    }

    /// A session whose "hardware" is one worker thread.
    pub struct StubSession {
        width: u32,
        height: u32,
        jobs: Option<mpsc::Sender<Job>>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl StubSession {
        fn spawn(config: &SessionConfig, on_sample: SampleCallback) -> Self {
            let (jobs, queue) = mpsc::channel::<Job>();
            let worker = thread::spawn(move || {
                while let Ok(job) = queue.recv() {
                    match job {
                        Job::Encode {
                            keyframe,
                            pts,
                            ctx,
                            digest,
                            size,
                        } => {
                            let mut nal = Vec::with_capacity(14);
                            nal.push(if keyframe { 0x26 } else { 0x02 });
                            nal.push(0x01);
                            nal.extend_from_slice(&digest.to_be_bytes());
                            nal.extend_from_slice(&size.to_le_bytes());

                            let mut data = Vec::with_capacity(4 + nal.len());
                            data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
                            data.extend_from_slice(&nal);

                            on_sample(
                                EncodedSample {
                                    data,
                                    parameter_sets: vec![
                                        STUB_VPS.to_vec(),
                                        STUB_SPS.to_vec(),
                                        STUB_PPS.to_vec(),
                                    ],
                                    not_sync: Some(!keyframe),
                                    pts,
                                },
                                ctx,
                            );
                        }
                        Job::Drain(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            });
            StubSession {
                width: config.width,
                height: config.height,
                jobs: Some(jobs),
                worker: Some(worker),
            }
        }
    }

    impl CompressionSession for StubSession {
        fn submit(
            &mut self,
            pixels: &[u8],
            width: u32,
            height: u32,
            stride: u32,
            pts: TimeValue,
            _duration: TimeValue,
            force_keyframe: bool,
            ctx: FrameContext,
        ) -> Result<()> {
            if width != self.width || height != self.height {
                return Err(LinkError::Encoder(format!(
                    "frame {width}x{height} does not match session {}x{}",
                    self.width, self.height
                )));
            }
            if pixels.len() != height as usize * stride as usize {
                return Err(LinkError::Encoder(
                    "pixel buffer does not match stride".into(),
                ));
            }
            let job = Job::Encode {
                keyframe: force_keyframe,
                pts,
                ctx,
                digest: pixel_digest(pixels),
                size: pixels.len() as u32,
            };
            self.jobs
                .as_ref()
                .ok_or_else(|| LinkError::Encoder("session destroyed".into()))?
                .send(job)
                .map_err(|_| LinkError::Encoder("stub worker gone".into()))
        }

        fn drain(&mut self) -> Result<()> {
            let Some(jobs) = self.jobs.as_ref() else {
                return Ok(());
            };
            let (ack, done) = mpsc::channel();
            jobs.send(Job::Drain(ack))
                .map_err(|_| LinkError::Encoder("stub worker gone".into()))?;
            done.recv_timeout(DRAIN_TIMEOUT)
                .map_err(|_| LinkError::Encoder("drain timed out".into()))
        }
    }

    impl Drop for StubSession {
        fn drop(&mut self) {
            self.jobs = None;
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::stub::{pixel_digest, StubBackend};
    use super::*;
    use framelink_protocol::frame::POSE_IDENTITY;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    type Seen = Arc<Mutex<Vec<(EncodedSample, FrameContext)>>>;

    fn collector() -> (SampleCallback, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: SampleCallback = Arc::new(move |sample, ctx| {
            sink.lock().unwrap().push((sample, ctx));
        });
        (callback, seen)
    }

    fn stub_driver() -> (EncoderDriver, Arc<IdrScheduler>, Seen) {
        let idr = Arc::new(IdrScheduler::new());
        let (callback, seen) = collector();
        let driver = EncoderDriver::new(
            Box::new(StubBackend),
            DEFAULT_BITRATE_BPS,
            Arc::clone(&idr),
            callback,
        );
        (driver, idr, seen)
    }

    fn pixels(width: u32, height: u32, seed: u8) -> Vec<u8> {
        (0..width as usize * height as usize * 4)
            .map(|i| (i as u8).wrapping_add(seed))
            .collect()
    }

    fn test_frame<'a>(pixels: &'a [u8], width: u32, height: u32, number: u64, is_idr: bool) -> Frame<'a> {
        Frame {
            frame_number: number,
            image_index: 0,
            width,
            height,
            stride: width * 4,
            is_idr,
            target_timestamp_ns: number * 1_000_000,
            pose: POSE_IDENTITY,
            pixels,
        }
    }

    #[test]
    fn submit_outside_running_is_rejected() {
        let (mut driver, _idr, _seen) = stub_driver();
        let data = pixels(8, 4, 0);
        let err = driver.submit(&test_frame(&data, 8, 4, 0, false)).unwrap_err();
        assert!(matches!(err, LinkError::Encoder(_)));
        assert_eq!(driver.state(), DriverState::Uninitialised);
    }

    #[test]
    fn pending_idr_requests_coalesce_into_one_keyframe() {
        let (mut driver, idr, seen) = stub_driver();
        driver.start(8, 4).unwrap();

        idr.insert_idr();
        idr.insert_idr();
        idr.on_packet_loss();

        let data = pixels(8, 4, 1);
        driver.submit(&test_frame(&data, 8, 4, 0, false)).unwrap();
        driver.submit(&test_frame(&data, 8, 4, 1, false)).unwrap();
        driver.drain().unwrap();

        let samples = seen.lock().unwrap();
        assert_eq!(samples.len(), 2);
        let keyframes = samples.iter().filter(|(_, ctx)| ctx.is_idr).count();
        assert_eq!(keyframes, 1);
        assert!(samples[0].1.is_idr);
    }

    #[test]
    fn producer_idr_flag_forces_keyframe() {
        let (mut driver, _idr, seen) = stub_driver();
        driver.start(8, 4).unwrap();

        let data = pixels(8, 4, 2);
        driver.submit(&test_frame(&data, 8, 4, 0, true)).unwrap();
        driver.drain().unwrap();

        let samples = seen.lock().unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].0.not_sync, Some(false));
    }

    #[test]
    fn pts_counts_frames_in_the_90_timescale() {
        let (mut driver, _idr, seen) = stub_driver();
        driver.start(8, 4).unwrap();

        let data = pixels(8, 4, 3);
        driver.submit(&test_frame(&data, 8, 4, 41, false)).unwrap();
        driver.drain().unwrap();

        let samples = seen.lock().unwrap();
        assert_eq!(samples[0].0.pts.value, 41);
        assert_eq!(samples[0].0.pts.timescale, ENCODER_TIMESCALE);
    }

    #[test]
    fn sample_digest_matches_staged_pixels() {
        let (mut driver, _idr, seen) = stub_driver();
        driver.start(8, 4).unwrap();

        // Padded source stride; the driver stages to tight stride first.
        let mut padded = vec![0u8; 4 * 40];
        let tight = pixels(8, 4, 7);
        for row in 0..4 {
            padded[row * 40..row * 40 + 32].copy_from_slice(&tight[row * 32..(row + 1) * 32]);
        }
        let frame = Frame {
            stride: 40,
            ..test_frame(&padded, 8, 4, 0, false)
        };
        driver.submit(&frame).unwrap();
        driver.drain().unwrap();

        let samples = seen.lock().unwrap();
        let nal = &samples[0].0.data[4..];
        let digest = u64::from_be_bytes(nal[2..10].try_into().unwrap());
        assert_eq!(digest, pixel_digest(&tight));
    }

    #[test]
    fn drain_and_stop_are_idempotent() {
        let (mut driver, _idr, _seen) = stub_driver();
        driver.start(8, 4).unwrap();
        driver.drain().unwrap();
        driver.drain().unwrap();
        driver.stop();
        driver.stop();
        assert_eq!(driver.state(), DriverState::Stopped);
    }

    #[test]
    fn restart_is_a_full_recreate() {
        let (mut driver, _idr, _seen) = stub_driver();
        driver.start(8, 4).unwrap();
        driver.start(16, 8).unwrap();
        assert_eq!(driver.state(), DriverState::Running);

        // Only the second geometry is accepted now.
        let small = pixels(8, 4, 0);
        driver.submit(&test_frame(&small, 8, 4, 0, false)).unwrap();
        assert_eq!(driver.frames_rejected(), 1);
        let big = pixels(16, 8, 0);
        driver.submit(&test_frame(&big, 16, 8, 1, false)).unwrap();
        assert_eq!(driver.frames_submitted(), 1);
    }

    struct FailingSession;

    impl CompressionSession for FailingSession {
        fn submit(
            &mut self,
            _pixels: &[u8],
            _width: u32,
            _height: u32,
            _stride: u32,
            _pts: TimeValue,
            _duration: TimeValue,
            _force_keyframe: bool,
            _ctx: FrameContext,
        ) -> Result<()> {
            Err(LinkError::Encoder("simulated hardware fault".into()))
        }

        fn drain(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct FailingBackend {
        sessions_created: Arc<AtomicU32>,
    }

    impl CompressionBackend for FailingBackend {
        fn create_session(
            &self,
            _config: &SessionConfig,
            _on_sample: SampleCallback,
        ) -> Result<Box<dyn CompressionSession>> {
            self.sessions_created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FailingSession))
        }
    }

    #[test]
    fn repeated_errors_recreate_the_session() {
        let sessions_created = Arc::new(AtomicU32::new(0));
        let idr = Arc::new(IdrScheduler::new());
        let (callback, _seen) = collector();
        let mut driver = EncoderDriver::new(
            Box::new(FailingBackend {
                sessions_created: Arc::clone(&sessions_created),
            }),
            DEFAULT_BITRATE_BPS,
            Arc::clone(&idr),
            callback,
        );
        driver.start(8, 4).unwrap();
        assert_eq!(sessions_created.load(Ordering::SeqCst), 1);

        let data = pixels(8, 4, 0);
        for number in 0..3 {
            driver.submit(&test_frame(&data, 8, 4, number, false)).unwrap();
        }
        assert_eq!(sessions_created.load(Ordering::SeqCst), 2);
        assert_eq!(driver.frames_rejected(), 3);
        // A fresh session starts with a forced IDR.
        assert!(idr.check_and_clear());
    }
}
