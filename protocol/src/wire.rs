// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Byte-exact wire format for the TCP transport.
//!
//! Both headers are serialised little-endian with no alignment holes; the
//! encoded sizes are fixed constants and any mismatch between peers is a
//! wire incompatibility. Serialisation is explicit rather than a
//! `#[repr(packed)]` transmute so the layout cannot drift with the
//! compiler.

use std::io::{self, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::frame::Pose;

/// Encoded size of [`InitHeader`] in bytes.
pub const INIT_HEADER_BYTES: usize = 40;

/// Encoded size of [`FrameHeader`] in bytes.
pub const FRAME_HEADER_BYTES: usize = 81;

/// Sent exactly once by the shipper when a connection is established.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitHeader {
    /// Number of swapchain images the producer cycles through.
    pub num_images: u32,
    /// Producer device identity, opaque to the receiver.
    pub device_uuid: [u8; 16],
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Producer-side pixel-format identifier. The receiver logs it and
    /// nothing more; the payload is always 32-bit BGRA.
    pub format_tag: u32,
    /// Producer-side memory index, opaque to the receiver.
    pub mem_index: u32,
    /// PID of the producer process, for diagnostics.
    pub source_pid: u32,
}

impl InitHeader {
    /// Appends the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(INIT_HEADER_BYTES);
        buf.extend_from_slice(&self.num_images.to_le_bytes());
        buf.extend_from_slice(&self.device_uuid);
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.format_tag.to_le_bytes());
        buf.extend_from_slice(&self.mem_index.to_le_bytes());
        buf.extend_from_slice(&self.source_pid.to_le_bytes());
    }

    /// Decodes a header from exactly [`INIT_HEADER_BYTES`] bytes.
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        let num_images = data.read_u32::<LittleEndian>()?;
        let mut device_uuid = [0u8; 16];
        data.read_exact(&mut device_uuid)?;
        Ok(InitHeader {
            num_images,
            device_uuid,
            width: data.read_u32::<LittleEndian>()?,
            height: data.read_u32::<LittleEndian>()?,
            format_tag: data.read_u32::<LittleEndian>()?,
            mem_index: data.read_u32::<LittleEndian>()?,
            source_pid: data.read_u32::<LittleEndian>()?,
        })
    }
}

/// Precedes every frame payload on the TCP transport. Immediately followed
/// by `data_size` pixel bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameHeader {
    /// Swapchain image index.
    pub image_index: u32,
    /// Frame sequence number, truncated to 32 bits on the wire.
    pub frame_number: u32,
    /// Opaque timing value. The legacy path carried a GPU-timeline value
    /// here; the receiver decides the interpretation per session.
    pub semaphore_value: u64,
    /// Render pose for this frame.
    pub pose: Pose,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Bytes per row of the payload.
    pub stride: u32,
    /// Non-zero when the producer requests an IDR.
    pub is_idr: bool,
    /// Payload length in bytes.
    pub data_size: u32,
}

impl FrameHeader {
    /// Appends the encoded header to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(FRAME_HEADER_BYTES);
        buf.extend_from_slice(&self.image_index.to_le_bytes());
        buf.extend_from_slice(&self.frame_number.to_le_bytes());
        buf.extend_from_slice(&self.semaphore_value.to_le_bytes());
        for row in &self.pose {
            for v in row {
                buf.extend_from_slice(&v.to_le_bytes());
            }
        }
        buf.extend_from_slice(&self.width.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.stride.to_le_bytes());
        buf.push(u8::from(self.is_idr));
        buf.extend_from_slice(&self.data_size.to_le_bytes());
    }

    /// Decodes a header from exactly [`FRAME_HEADER_BYTES`] bytes.
    pub fn decode(mut data: &[u8]) -> io::Result<Self> {
        let image_index = data.read_u32::<LittleEndian>()?;
        let frame_number = data.read_u32::<LittleEndian>()?;
        let semaphore_value = data.read_u64::<LittleEndian>()?;
        let mut pose = [[0.0f32; 4]; 3];
        for row in &mut pose {
            for v in row.iter_mut() {
                *v = data.read_f32::<LittleEndian>()?;
            }
        }
        Ok(FrameHeader {
            image_index,
            frame_number,
            semaphore_value,
            pose,
            width: data.read_u32::<LittleEndian>()?,
            height: data.read_u32::<LittleEndian>()?,
            stride: data.read_u32::<LittleEndian>()?,
            is_idr: data.read_u8()? != 0,
            data_size: data.read_u32::<LittleEndian>()?,
        })
    }
}
