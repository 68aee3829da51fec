// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared-memory consumer.
//!
//! The receiver owns the region lifecycle: it creates and initialises the
//! file, drains the ring, and unlinks the file at shutdown. Slot claims
//! use the same CAS protocol as the producer; the acquire load of `Ready`
//! pairs with the producer's release fence, so staged pixels and headers
//! are fully visible before the encoder sees them.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, info};

use framelink_protocol::region::{
    RegionStats, ShmRegion, SlotHeader, SlotState, StreamConfig, MAX_FRAME_SIZE, NUM_BUFFERS,
};
use framelink_protocol::Result;

const POLL_TICK: Duration = Duration::from_millis(1);
const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 128;

/// A claimed slot, held in the `Encoding` state until
/// [`ShmConsumer::complete`] returns it to the ring.
#[derive(Debug)]
pub struct ReadySlot {
    /// Ring index of the claimed slot.
    pub index: usize,
    /// Frame metadata copied out of the slot.
    pub header: SlotHeader,
}

/// Consumer half of the shared-memory ring.
pub struct ShmConsumer {
    region: ShmRegion,
    last_frame_number: Option<u64>,
}

impl ShmConsumer {
    /// Creates and initialises the region file (mode 0600), ready for a
    /// producer to map.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let region = ShmRegion::create(path)?;
        info!("region created at {}", region.path().display());
        Ok(ShmConsumer {
            region,
            last_frame_number: None,
        })
    }

    /// Blocks until a producer publishes the stream geometry, `exiting`
    /// is observed, or shutdown is requested.
    pub fn wait_for_producer(&self, exiting: &AtomicBool) -> Option<StreamConfig> {
        loop {
            if let Some(cfg) = self.region.header().stream_config() {
                info!(
                    "producer attached: {}x{} format_tag={}",
                    cfg.width, cfg.height, cfg.format_tag
                );
                return Some(cfg);
            }
            if exiting.load(Ordering::Relaxed) || self.region.header().shutdown_requested() {
                return None;
            }
            std::thread::sleep(POLL_TICK);
        }
    }

    /// Claims the next `Ready` slot, preferring the lowest frame number.
    /// Spins with backoff up to `timeout`, then yields with `None`. Stale
    /// slots (frame number below the last consumed one) go straight back
    /// to `Empty` and count as dropped.
    pub fn next_ready_slot(&mut self, timeout: Duration, exiting: &AtomicBool) -> Option<ReadySlot> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            if exiting.load(Ordering::Relaxed) || self.region.header().shutdown_requested() {
                return None;
            }

            let header = self.region.header();
            let start =
                (header.read_sequence.load(Ordering::Relaxed) % NUM_BUFFERS as u64) as usize;
            let mut best: Option<(usize, u64)> = None;
            for probe in 0..NUM_BUFFERS {
                let index = (start + probe) % NUM_BUFFERS;
                let slot = self.region.slot(index);
                if slot.state() != SlotState::Ready {
                    continue;
                }
                let frame_number = slot.snapshot().frame_number;
                if best.map_or(true, |(_, lowest)| frame_number < lowest) {
                    best = Some((index, frame_number));
                }
            }

            if let Some((index, frame_number)) = best {
                let slot = self.region.slot(index);
                if !slot.try_claim(SlotState::Ready, SlotState::Encoding) {
                    continue;
                }
                if self.last_frame_number.map_or(false, |last| frame_number < last) {
                    slot.release(SlotState::Empty);
                    header.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    debug!("skipped stale slot {index} (frame {frame_number})");
                    continue;
                }
                self.last_frame_number = Some(frame_number);
                return Some(ReadySlot {
                    index,
                    header: slot.snapshot(),
                });
            }

            if Instant::now() >= deadline {
                return None;
            }
            if spins < SPIN_LIMIT {
                std::hint::spin_loop();
                spins += 1;
            } else if spins < YIELD_LIMIT {
                std::thread::yield_now();
                spins += 1;
            } else {
                std::thread::sleep(POLL_TICK);
            }
        }
    }

    /// The staged pixel bytes of a claimed slot.
    pub fn pixels(&self, ready: &ReadySlot) -> &[u8] {
        let len =
            (ready.header.height as usize * ready.header.stride as usize).min(MAX_FRAME_SIZE);
        // SAFETY: the slot is held in the Encoding state, so the producer
        // cannot touch the slab; len is bounded by the slab size.
        unsafe { std::slice::from_raw_parts(self.region.pixel_ptr(ready.index), len) }
    }

    /// Returns a consumed slot to the ring. Called after the encoder has
    /// accepted the frame, before any completion has run.
    pub fn complete(&mut self, ready: ReadySlot) {
        let slot = self.region.slot(ready.index);
        slot.release(SlotState::Empty);
        let header = self.region.header();
        header.read_sequence.fetch_add(1, Ordering::Relaxed);
        header.frames_encoded.fetch_add(1, Ordering::Relaxed);
    }

    /// Signals the producer to drain to quiescence.
    pub fn request_shutdown(&self) {
        self.region.header().request_shutdown();
    }

    /// Removes the region file. Idempotent; also happens on drop.
    pub fn unlink(&self) {
        self.region.unlink();
    }

    /// Counter snapshot from the region header.
    pub fn stats(&self) -> RegionStats {
        self.region.header().stats()
    }

    /// The underlying region, for diagnostics.
    pub fn region(&self) -> &ShmRegion {
        &self.region
    }
}
