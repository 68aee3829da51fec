// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Frame sources.
//!
//! The renderer and the GPU readback live outside this crate; a
//! [`FrameSource`] is the seam through which staged CPU-side BGRA pixels
//! enter the transport. The built-in test-pattern source lets the shipper
//! binary drive either transport end to end without a renderer.

use framelink_protocol::frame::{Pose, POSE_IDENTITY};
use framelink_protocol::Result;

/// One staged frame, pixels borrowed from the source's own buffer.
#[derive(Debug)]
pub struct SourcedFrame<'a> {
    /// BGRA pixel bytes, `height * stride` long.
    pub pixels: &'a [u8],
    /// Bytes per row.
    pub stride: u32,
    /// Render pose for this frame.
    pub pose: Pose,
    /// Whether the renderer asks for an independently decodable frame.
    pub is_idr: bool,
}

/// A producer of staged CPU-side frames.
pub trait FrameSource: Send {
    /// Initialise for the given geometry.
    fn init(&mut self, width: u32, height: u32) -> Result<()>;

    /// Stage the next frame.
    fn next_frame(&mut self) -> Result<SourcedFrame<'_>>;

    /// Current frame dimensions.
    fn dimensions(&self) -> (u32, u32);
}

/// Deterministic moving-gradient source.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame_count: u64,
    buffer: Vec<u8>,
}

impl TestPatternSource {
    pub fn new() -> Self {
        TestPatternSource {
            width: 0,
            height: 0,
            frame_count: 0,
            buffer: Vec::new(),
        }
    }
}

impl Default for TestPatternSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for TestPatternSource {
    fn init(&mut self, width: u32, height: u32) -> Result<()> {
        self.width = width;
        self.height = height;
        self.buffer.resize(width as usize * height as usize * 4, 0);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<SourcedFrame<'_>> {
        let phase = (self.frame_count % 256) as u8;
        let width = self.width as usize;

        for y in 0..self.height as usize {
            for x in 0..width {
                let offset = (y * width + x) * 4;
                self.buffer[offset] = (x as u8).wrapping_add(phase); // B
                self.buffer[offset + 1] = (y as u8).wrapping_add(phase); // G
                self.buffer[offset + 2] = ((x + y) as u8).wrapping_add(phase); // R
                self.buffer[offset + 3] = 255; // A
            }
        }

        // Drift the pose a little so the receiver's pose plumbing sees
        // changing values rather than a constant.
        let mut pose = POSE_IDENTITY;
        pose[0][3] = (self.frame_count as f32) * 0.001;
        pose[2][3] = -1.5;

        self.frame_count += 1;

        Ok(SourcedFrame {
            pixels: &self.buffer,
            stride: self.width * 4,
            pose,
            is_idr: false,
        })
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_matches_geometry() {
        let mut source = TestPatternSource::new();
        source.init(32, 16).unwrap();
        let frame = source.next_frame().unwrap();
        assert_eq!(frame.pixels.len(), 32 * 16 * 4);
        assert_eq!(frame.stride, 128);
        assert_eq!(source.dimensions(), (32, 16));
    }

    #[test]
    fn test_pattern_varies_per_frame() {
        let mut source = TestPatternSource::new();
        source.init(8, 8).unwrap();
        let first = source.next_frame().unwrap().pixels.to_vec();
        let second = source.next_frame().unwrap().pixels.to_vec();
        assert_ne!(first, second);
    }

    #[test]
    fn test_pattern_pose_drifts() {
        let mut source = TestPatternSource::new();
        source.init(8, 8).unwrap();
        let a = source.next_frame().unwrap().pose;
        let b = source.next_frame().unwrap().pose;
        assert_ne!(a[0][3], b[0][3]);
    }
}
