// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Network sink seam.
//!
//! The packetiser lives outside this crate; packed Annex-B samples leave
//! through a single function. The sink runs on its own thread, fed by the
//! completion hand-off, so it never blocks the encoder callbacks.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::encoder::Codec;
use framelink_protocol::Result;

/// Downstream consumer of the packed bitstream.
pub trait BitstreamSink: Send {
    fn emit_nal_stream(
        &mut self,
        codec: Codec,
        annexb: &[u8],
        target_timestamp_ns: u64,
        is_keyframe: bool,
    ) -> Result<()>;
}

/// Sink that only logs. The receiver binary uses it when no packetiser
/// is wired up.
#[derive(Debug, Default)]
pub struct LogSink {
    frames: u64,
    bytes: u64,
    keyframes: u64,
}

impl LogSink {
    pub fn new() -> Self {
        LogSink::default()
    }
}

impl BitstreamSink for LogSink {
    fn emit_nal_stream(
        &mut self,
        codec: Codec,
        annexb: &[u8],
        target_timestamp_ns: u64,
        is_keyframe: bool,
    ) -> Result<()> {
        self.frames += 1;
        self.bytes += annexb.len() as u64;
        if is_keyframe {
            self.keyframes += 1;
        }
        debug!(
            "{codec:?} sample: {} bytes, ts={target_timestamp_ns}, keyframe={is_keyframe} \
             (total {} frames / {} keyframes / {} bytes)",
            annexb.len(),
            self.frames,
            self.keyframes,
            self.bytes
        );
        Ok(())
    }
}

/// One emitted sample, as recorded by [`CollectSink`].
#[derive(Debug, Clone)]
pub struct SunkSample {
    pub annexb: Vec<u8>,
    pub target_timestamp_ns: u64,
    pub is_keyframe: bool,
}

/// Sink that records every sample; shared with tests through the inner
/// `Arc`.
#[derive(Debug, Default)]
pub struct CollectSink {
    samples: Arc<Mutex<Vec<SunkSample>>>,
}

impl CollectSink {
    pub fn new() -> Self {
        CollectSink::default()
    }

    /// Handle to the recorded samples.
    pub fn samples(&self) -> Arc<Mutex<Vec<SunkSample>>> {
        Arc::clone(&self.samples)
    }
}

impl BitstreamSink for CollectSink {
    fn emit_nal_stream(
        &mut self,
        _codec: Codec,
        annexb: &[u8],
        target_timestamp_ns: u64,
        is_keyframe: bool,
    ) -> Result<()> {
        self.samples
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(SunkSample {
                annexb: annexb.to_vec(),
                target_timestamp_ns,
                is_keyframe,
            });
        Ok(())
    }
}
