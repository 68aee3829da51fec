// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared protocol definitions for the framelink frame transport.
//!
//! Both halves of the transport link against this crate:
//!
//! - the shipper (producer) runs inside the compatibility sandbox and
//!   publishes rendered BGRA frames,
//! - the receiver (consumer) runs natively on the host and feeds the
//!   hardware compression session.
//!
//! Two interchangeable transports carry the same logical frame stream: a
//! loopback TCP bytestream ([`wire`]) and a lock-free shared-memory ring
//! ([`region`]).

pub mod error;
pub mod frame;
pub mod region;
pub mod wire;

pub use error::{LinkError, Result};
pub use frame::{Frame, Pose};
pub use region::{RegionHeader, ShmRegion, SlotState, StreamConfig};
pub use wire::{FrameHeader, InitHeader};

/// Default TCP port for the loopback transport.
pub const DEFAULT_TCP_PORT: u16 = 9944;

/// Default path of the shared-memory region file. The receiver creates and
/// unlinks it; the shipper only maps it.
pub const DEFAULT_REGION_PATH: &str = "/tmp/alvr_frame_buffer.shm";
