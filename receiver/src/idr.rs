// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Keyframe scheduling.
//!
//! Three event sources feed one pending flag; however many events arrive
//! before the next frame, exactly one IDR is forced. The periodic
//! 180-frame keyframe cadence belongs to the compression session itself,
//! not to this scheduler.

use std::sync::atomic::{AtomicBool, Ordering};

/// Collects "the next frame must be an IDR" requests.
#[derive(Debug, Default)]
pub struct IdrScheduler {
    pending: AtomicBool,
}

impl IdrScheduler {
    pub fn new() -> Self {
        IdrScheduler {
            pending: AtomicBool::new(false),
        }
    }

    /// A new stream is starting; its first frame must be decodable.
    pub fn on_stream_start(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// The network layer reported loss; the decoder needs a resync point.
    pub fn on_packet_loss(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Explicit request from the control plane.
    pub fn insert_idr(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Returns whether the next frame must be forced to an IDR and clears
    /// the flag. Pending events coalesce into a single `true`.
    pub fn check_and_clear(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }
}
