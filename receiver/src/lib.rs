// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! framelink receiver
//!
//! The host side of the frame transport. Reassembles the frame stream
//! from either transport, drives the hardware compression session, and
//! hands the packed Annex-B bitstream to the network sink:
//!
//! ```text
//! shipper ──(shm ring / tcp)──▶ transport consumer
//!                                     │ frames, in order
//!                                     ▼
//!                              EncoderDriver ◀── IdrScheduler
//!                                     │ async completions
//!                                     ▼
//!                              BitstreamPacker ──▶ sink thread ──▶ packetiser
//! ```

pub mod bitstream;
pub mod encoder;
pub mod idr;
pub mod pose;
pub mod receiver;
pub mod shm;
pub mod sink;
pub mod tcp;

pub use bitstream::{BitstreamPacker, PackedBitstream, START_CODE};
pub use encoder::{
    Codec, CompressionBackend, CompressionSession, DriverState, EncodedSample, EncoderDriver,
    FrameContext, SampleCallback, SessionConfig, TimeValue, DEFAULT_BITRATE_BPS,
};
pub use idr::IdrScheduler;
pub use pose::{NullPoseHistory, PoseHistory, PoseMatch, RecentPoseHistory};
pub use receiver::{
    FrameHandler, FrameReceiver, ReceiverConfig, ReceiverStats, TransportMode,
};
pub use shm::{ReadySlot, ShmConsumer};
pub use sink::{BitstreamSink, CollectSink, LogSink, SunkSample};
pub use tcp::TcpConsumer;
