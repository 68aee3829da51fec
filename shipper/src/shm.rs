// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory producer.
//!
//! `submit` is wait-free: at most `NUM_BUFFERS` CAS probes, one bounded
//! memcpy, no I/O. When every slot is busy the frame is dropped on the
//! spot — the receiver may fall behind by at most `NUM_BUFFERS - 1`
//! frames, never further.

use std::path::Path;
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use framelink_protocol::frame::copy_rows;
use framelink_protocol::region::{
    RegionStats, ShmRegion, SlotHeader, SlotState, StreamConfig, NUM_BUFFERS,
};
use framelink_protocol::{Frame, LinkError, Result};

use crate::SubmitOutcome;

const INIT_POLL_TICK: Duration = Duration::from_millis(1);
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Producer half of the shared-memory ring.
#[derive(Debug)]
pub struct ShmProducer {
    region: ShmRegion,
    drops_since_log: u64,
    last_drop_log: Option<Instant>,
}

impl ShmProducer {
    /// Maps an existing region file. The receiver must have created it;
    /// identity is validated in [`init`](Self::init) once the receiver has
    /// published `initialized`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let region = ShmRegion::open(path)?;
        Ok(ShmProducer {
            region,
            drops_since_log: 0,
            last_drop_log: None,
        })
    }

    /// Waits for the receiver to finish region setup, validates the
    /// identity fields, and publishes the stream geometry. Refuses to use
    /// a region with foreign magic or an unsupported version.
    pub fn init(&self, cfg: StreamConfig, wait_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + wait_timeout;
        let header = self.region.header();
        while !header.is_initialized() {
            if Instant::now() >= deadline {
                return Err(LinkError::Config(format!(
                    "region {} was never initialized by a receiver",
                    self.region.path().display()
                )));
            }
            std::thread::sleep(INIT_POLL_TICK);
        }
        header.validate()?;
        header.set_stream_config(cfg);
        info!(
            "shm stream configured: {}x{} format_tag={}",
            cfg.width, cfg.height, cfg.format_tag
        );
        Ok(())
    }

    /// Publishes one frame into the ring, or drops it when no slot is
    /// free. Never blocks beyond the pixel copy.
    pub fn submit(&mut self, frame: &Frame) -> Result<SubmitOutcome> {
        frame.validate()?;
        let header = self.region.header();
        if header.shutdown_requested() {
            return Err(LinkError::PeerGone("region shutdown requested".into()));
        }

        let start = (header.write_sequence.load(Ordering::Relaxed) % NUM_BUFFERS as u64) as usize;
        for probe in 0..NUM_BUFFERS {
            let index = (start + probe) % NUM_BUFFERS;
            let slot = self.region.slot(index);
            if !slot.try_claim(SlotState::Empty, SlotState::Writing) {
                continue;
            }

            self.stage_pixels(index, frame);
            slot.stage(&SlotHeader {
                width: frame.width,
                height: frame.height,
                stride: frame.tight_stride(),
                timestamp_ns: frame.target_timestamp_ns,
                frame_number: frame.frame_number,
                is_idr: frame.is_idr,
                pose: frame.pose,
            });

            // Pixel and header writes must be visible before the state
            // store that hands the slot to the receiver.
            fence(Ordering::Release);
            slot.release(SlotState::Ready);

            header.write_sequence.fetch_add(1, Ordering::Relaxed);
            header.frames_written.fetch_add(1, Ordering::Relaxed);
            debug!("published frame {} in slot {index}", frame.frame_number);
            return Ok(SubmitOutcome::Published);
        }

        header.frames_dropped.fetch_add(1, Ordering::Relaxed);
        self.note_drop();
        Ok(SubmitOutcome::Dropped)
    }

    /// Producer-side shutdown. The receiver owns the region lifecycle, so
    /// there is nothing to reclaim or unlink here; slots it still holds
    /// drain on its side. Idempotent.
    pub fn shutdown(&mut self) {
        info!("shm producer stopping, {:?}", self.stats());
    }

    /// Counter snapshot from the region header.
    pub fn stats(&self) -> RegionStats {
        self.region.header().stats()
    }

    fn stage_pixels(&self, index: usize, frame: &Frame) {
        let row = frame.tight_stride() as usize;
        // SAFETY: the slot is owned in the Writing state, and validate()
        // bounded tight_size() by MAX_FRAME_SIZE.
        let slab = unsafe {
            std::slice::from_raw_parts_mut(self.region.pixel_ptr(index), frame.tight_size())
        };
        copy_rows(
            slab,
            row,
            frame.pixels,
            frame.stride as usize,
            row,
            frame.height as usize,
        );
    }

    fn note_drop(&mut self) {
        self.drops_since_log += 1;
        let now = Instant::now();
        let due = self
            .last_drop_log
            .map_or(true, |last| now.duration_since(last) >= DROP_LOG_INTERVAL);
        if due {
            warn!(
                "ring full, dropped {} frame(s) at the transport",
                self.drops_since_log
            );
            self.drops_since_log = 0;
            self.last_drop_log = Some(now);
        }
    }
}
