// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for the shipper crate
//!
//! This file contains end-to-end tests for:
//! - Shared-memory publishing (claiming, staging, backpressure)
//! - Region validation (magic/version refusal)
//! - TCP wire behaviour at the byte level
//! - The shipper front-end (frame numbering, IDR-at-start)

use std::io::Read;
use std::net::TcpListener;
use std::path::PathBuf;
use std::time::Duration;

use framelink_protocol::frame::POSE_IDENTITY;
use framelink_protocol::region::{RegionHeader, ShmRegion, SlotState, StreamConfig};
use framelink_protocol::wire::{FrameHeader, InitHeader, FRAME_HEADER_BYTES, INIT_HEADER_BYTES};
use framelink_protocol::{Frame, LinkError, Pose};
use framelink_shipper::{FrameShipper, ShipperConfig, ShmProducer, SubmitOutcome, TcpProducer, TransportMode};

fn temp_region(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("framelink-shipper-{tag}-{}", std::process::id()))
}

fn gradient(frame_number: u64, width: u32, height: u32, stride: u32) -> Vec<u8> {
    let phase = (frame_number % 256) as u8;
    let mut pixels = vec![0u8; height as usize * stride as usize];
    for y in 0..height as usize {
        for x in 0..width as usize {
            let off = y * stride as usize + x * 4;
            pixels[off] = (x as u8).wrapping_add(phase);
            pixels[off + 1] = (y as u8).wrapping_add(phase);
            pixels[off + 2] = ((x + y) as u8).wrapping_add(phase);
            pixels[off + 3] = 255;
        }
    }
    pixels
}

fn frame(pixels: &[u8], frame_number: u64, width: u32, height: u32, stride: u32) -> Frame<'_> {
    Frame {
        frame_number,
        image_index: (frame_number % 3) as u32,
        width,
        height,
        stride,
        is_idr: frame_number == 0,
        target_timestamp_ns: frame_number * 1_000_000,
        pose: POSE_IDENTITY,
        pixels,
    }
}

const CFG: StreamConfig = StreamConfig {
    width: 64,
    height: 32,
    format_tag: 87,
};

// ============================================================================
// Shared-memory publishing
// ============================================================================

#[test]
fn publish_stages_tight_stride_pixels() {
    let path = temp_region("stage");
    let consumer = ShmRegion::create(&path).unwrap();

    let mut producer = ShmProducer::open(&path).unwrap();
    producer.init(CFG, Duration::from_secs(1)).unwrap();

    // Source rows carry 16 bytes of alignment padding each.
    let padded = gradient(7, 64, 32, 64 * 4 + 16);
    producer
        .submit(&frame(&padded, 7, 64, 32, 64 * 4 + 16))
        .unwrap();

    let slot = consumer.slot(0);
    assert_eq!(slot.state(), SlotState::Ready);
    let meta = slot.snapshot();
    assert_eq!(meta.frame_number, 7);
    assert_eq!(meta.stride, 64 * 4);
    assert_eq!(meta.width, 64);
    assert!(!meta.is_idr);

    let tight = gradient(7, 64, 32, 64 * 4);
    let slab =
        unsafe { std::slice::from_raw_parts(consumer.pixel_ptr(0), tight.len()) };
    assert_eq!(slab, tight.as_slice());
}

#[test]
fn ring_drops_when_all_slots_are_busy() {
    let path = temp_region("backpressure");
    let _consumer = ShmRegion::create(&path).unwrap();

    let mut producer = ShmProducer::open(&path).unwrap();
    producer.init(CFG, Duration::from_secs(1)).unwrap();

    let pixels = gradient(0, 64, 32, 64 * 4);
    for number in 0..3 {
        let outcome = producer
            .submit(&frame(&pixels, number, 64, 32, 64 * 4))
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Published);
    }

    // No consumer is draining; the fourth submit must return without
    // blocking and count exactly one drop.
    let outcome = producer
        .submit(&frame(&pixels, 3, 64, 32, 64 * 4))
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Dropped);

    let stats = producer.stats();
    assert_eq!(stats.frames_written, 3);
    assert_eq!(stats.frames_dropped, 1);
    assert_eq!(stats.write_sequence, 3);
}

#[test]
fn submit_after_shutdown_request_reports_peer_gone() {
    let path = temp_region("peer-shutdown");
    let consumer = ShmRegion::create(&path).unwrap();

    let mut producer = ShmProducer::open(&path).unwrap();
    producer.init(CFG, Duration::from_secs(1)).unwrap();
    consumer.header().request_shutdown();

    let pixels = gradient(0, 64, 32, 64 * 4);
    let err = producer
        .submit(&frame(&pixels, 0, 64, 32, 64 * 4))
        .unwrap_err();
    assert!(matches!(err, LinkError::PeerGone(_)));

    producer.shutdown();
    producer.shutdown(); // idempotent
}

// ============================================================================
// Region validation
// ============================================================================

#[test]
fn producer_refuses_foreign_magic() {
    let path = temp_region("magic");
    let consumer = ShmRegion::create(&path).unwrap();
    let header = consumer.header() as *const RegionHeader as *mut RegionHeader;
    // Pre-populate the region with a foreign magic value.
    unsafe { (*header).magic = 0x1234_5678 };

    let producer = ShmProducer::open(&path).unwrap();
    let err = producer.init(CFG, Duration::from_millis(100)).unwrap_err();
    assert!(matches!(err, LinkError::Config(_)));
}

#[test]
fn producer_refuses_missing_region() {
    let err = ShmProducer::open(temp_region("absent")).unwrap_err();
    assert!(matches!(err, LinkError::Config(_)));
}

#[test]
fn producer_times_out_on_never_initialized_region() {
    let path = temp_region("never-init");
    let consumer = ShmRegion::create(&path).unwrap();
    consumer
        .header()
        .initialized
        .store(0, std::sync::atomic::Ordering::SeqCst);

    let producer = ShmProducer::open(&path).unwrap();
    let err = producer.init(CFG, Duration::from_millis(50)).unwrap_err();
    assert!(matches!(err, LinkError::Config(_)));
}

// ============================================================================
// TCP wire behaviour
// ============================================================================

fn test_init() -> InitHeader {
    InitHeader {
        num_images: 3,
        device_uuid: [7; 16],
        width: 64,
        height: 32,
        format_tag: 87,
        mem_index: 0,
        source_pid: std::process::id(),
    }
}

#[test]
fn connect_sends_exactly_one_init_header() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut producer = TcpProducer::new(port, test_init());
    producer.connect().unwrap();

    let (mut stream, _) = listener.accept().unwrap();
    let mut buf = vec![0u8; INIT_HEADER_BYTES];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(InitHeader::decode(&buf).unwrap(), test_init());

    producer.shutdown();
}

#[test]
fn submit_writes_header_then_pixels() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut producer = TcpProducer::new(port, test_init());
    producer.connect().unwrap();
    let (mut stream, _) = listener.accept().unwrap();

    let pixels = gradient(4, 64, 32, 64 * 4);
    let mut pose: Pose = POSE_IDENTITY;
    pose[1][3] = 1.25;
    let sent = Frame {
        pose,
        ..frame(&pixels, 4, 64, 32, 64 * 4)
    };
    assert_eq!(producer.submit(&sent).unwrap(), SubmitOutcome::Published);

    let mut skip = vec![0u8; INIT_HEADER_BYTES];
    stream.read_exact(&mut skip).unwrap();

    let mut header_buf = vec![0u8; FRAME_HEADER_BYTES];
    stream.read_exact(&mut header_buf).unwrap();
    let header = FrameHeader::decode(&header_buf).unwrap();
    assert_eq!(header.frame_number, 4);
    assert_eq!(header.data_size as usize, pixels.len());
    assert_eq!(header.semaphore_value, 4_000_000);
    assert_eq!(header.pose, pose);

    let mut payload = vec![0u8; pixels.len()];
    stream.read_exact(&mut payload).unwrap();
    assert_eq!(payload, pixels);
    assert_eq!(producer.frames_sent(), 1);
}

#[test]
fn unreachable_receiver_drops_silently() {
    // Grab an ephemeral port and close it again so nothing listens there.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let mut producer = TcpProducer::new(port, test_init());
    let pixels = gradient(0, 64, 32, 64 * 4);
    let outcome = producer
        .submit(&frame(&pixels, 0, 64, 32, 64 * 4))
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Dropped);
    assert!(!producer.is_connected());
    assert_eq!(producer.frames_dropped(), 1);
}

// ============================================================================
// Shipper front-end
// ============================================================================

#[test]
fn first_shipped_frame_is_idr() {
    let path = temp_region("front-end");
    let consumer = ShmRegion::create(&path).unwrap();

    let mut shipper = FrameShipper::connect(ShipperConfig {
        mode: TransportMode::Shm,
        region_path: path.clone(),
        width: 64,
        height: 32,
        ..ShipperConfig::default()
    })
    .unwrap();

    let pixels = gradient(0, 64, 32, 64 * 4);
    shipper
        .ship(&pixels, 64 * 4, POSE_IDENTITY, false, 1_000)
        .unwrap();
    shipper
        .ship(&pixels, 64 * 4, POSE_IDENTITY, false, 2_000)
        .unwrap();

    let first = consumer.slot(0).snapshot();
    let second = consumer.slot(1).snapshot();
    assert_eq!(first.frame_number, 0);
    assert!(first.is_idr);
    assert_eq!(second.frame_number, 1);
    assert!(!second.is_idr);

    assert_eq!(shipper.stats().published, 2);
    shipper.shutdown();
    shipper.shutdown(); // idempotent
}
