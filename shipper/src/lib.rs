// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! framelink shipper
//!
//! The producer side of the frame transport. Runs inside the
//! compatibility sandbox next to the renderer, reads each newly rendered
//! texture into CPU memory, and delivers it to the host receiver over one
//! of two interchangeable transports: the shared-memory ring or the
//! loopback TCP bytestream.

pub mod shipper;
pub mod shm;
pub mod source;
pub mod tcp;

pub use shipper::{FrameShipper, ShipperConfig, ShipperStats, TransportMode};
pub use shm::ShmProducer;
pub use source::{FrameSource, SourcedFrame, TestPatternSource};
pub use tcp::TcpProducer;

/// What happened to a submitted frame.
///
/// A `Dropped` outcome is the backpressure policy at work, not an error:
/// the newest frame wins the race for the next free slot, and the link
/// never blocks the render thread to preserve an old one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The frame was handed to the transport.
    Published,
    /// The frame was dropped; counted, logged at a low rate.
    Dropped,
}
