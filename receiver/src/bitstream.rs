// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Bitstream post-processing.
//!
//! The compression session emits samples whose payload is a concatenation
//! of NAL units, each prefixed with a 4-byte big-endian length. The
//! network side wants Annex-B: units separated by the start code
//! `00 00 00 01`, with the parameter sets prepended on every keyframe so
//! the stream is decodable from that point forward. The packer does not
//! inspect NAL headers and never reorders.

use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;

use crate::encoder::{EncodedSample, TimeValue};

/// Annex-B start code.
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// One packed sample, ready for the network sink.
#[derive(Debug, Clone)]
pub struct PackedBitstream {
    /// Annex-B bytes.
    pub annexb: Vec<u8>,
    /// Whether the sample is independently decodable.
    pub is_keyframe: bool,
    /// Presentation timestamp, carried through from the sample.
    pub pts: TimeValue,
}

/// Converts length-prefixed samples to Annex-B. Safe to call from any
/// thread the compression session uses for completions.
#[derive(Debug, Default)]
pub struct BitstreamPacker {
    truncated_tails: AtomicU64,
}

impl BitstreamPacker {
    pub fn new() -> Self {
        BitstreamPacker {
            truncated_tails: AtomicU64::new(0),
        }
    }

    /// Number of samples whose payload ended mid-unit.
    pub fn truncated_tails(&self) -> u64 {
        self.truncated_tails.load(Ordering::Relaxed)
    }

    /// Packs one sample. A keyframe is a sample whose not-sync attachment
    /// is absent or false.
    pub fn pack(&self, sample: &EncodedSample) -> PackedBitstream {
        let is_keyframe = !sample.not_sync.unwrap_or(false);

        let mut annexb = Vec::with_capacity(sample.data.len() + 64);
        if is_keyframe {
            for parameter_set in &sample.parameter_sets {
                annexb.extend_from_slice(&START_CODE);
                annexb.extend_from_slice(parameter_set);
            }
        }

        let mut rest = sample.data.as_slice();
        while !rest.is_empty() {
            if rest.len() < 4 {
                warn!(
                    "sample payload ends with a {}-byte partial length prefix, truncating",
                    rest.len()
                );
                self.truncated_tails.fetch_add(1, Ordering::Relaxed);
                break;
            }
            let unit_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let body = &rest[4..];
            if unit_len > body.len() {
                warn!(
                    "NAL length {unit_len} exceeds remaining {} bytes, truncating",
                    body.len()
                );
                self.truncated_tails.fetch_add(1, Ordering::Relaxed);
                break;
            }
            annexb.extend_from_slice(&START_CODE);
            annexb.extend_from_slice(&body[..unit_len]);
            rest = &body[unit_len..];
        }

        PackedBitstream {
            annexb,
            is_keyframe,
            pts: sample.pts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_prefixed(units: &[&[u8]]) -> Vec<u8> {
        let mut data = Vec::new();
        for unit in units {
            data.extend_from_slice(&(unit.len() as u32).to_be_bytes());
            data.extend_from_slice(unit);
        }
        data
    }

    fn sample(data: Vec<u8>, not_sync: Option<bool>) -> EncodedSample {
        EncodedSample {
            data,
            parameter_sets: vec![
                vec![0x40, 0x01, 0x0c],
                vec![0x42, 0x01, 0x01],
                vec![0x44, 0x01, 0xc0],
            ],
            not_sync,
            pts: TimeValue {
                value: 0,
                timescale: 90,
            },
        }
    }

    #[test]
    fn keyframe_gets_parameter_sets_in_order() {
        let packer = BitstreamPacker::new();
        let slice = [0x26u8, 0x01, 0xaf];
        let packed = packer.pack(&sample(length_prefixed(&[&slice]), Some(false)));

        assert!(packed.is_keyframe);
        let mut expected = Vec::new();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&[0x40, 0x01, 0x0c]);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&[0x42, 0x01, 0x01]);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&[0x44, 0x01, 0xc0]);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&slice);
        assert_eq!(packed.annexb, expected);
    }

    #[test]
    fn absent_attachment_means_keyframe() {
        let packer = BitstreamPacker::new();
        let packed = packer.pack(&sample(length_prefixed(&[&[0x26, 0x01]]), None));
        assert!(packed.is_keyframe);
        assert_eq!(&packed.annexb[..4], &START_CODE);
    }

    #[test]
    fn non_keyframe_has_no_parameter_sets() {
        let packer = BitstreamPacker::new();
        let slice = [0x02u8, 0x01, 0x99];
        let packed = packer.pack(&sample(length_prefixed(&[&slice]), Some(true)));

        assert!(!packed.is_keyframe);
        let mut expected = Vec::new();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&slice);
        assert_eq!(packed.annexb, expected);
    }

    #[test]
    fn multiple_units_each_get_a_start_code() {
        let packer = BitstreamPacker::new();
        let a = [0x02u8, 0x01];
        let b = [0x02u8, 0x02, 0x03];
        let packed = packer.pack(&sample(length_prefixed(&[&a, &b]), Some(true)));

        let mut expected = Vec::new();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&a);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&b);
        assert_eq!(packed.annexb, expected);
    }

    #[test]
    fn oversized_unit_length_truncates_silently() {
        let packer = BitstreamPacker::new();
        let mut data = Vec::new();
        data.extend_from_slice(&2u32.to_be_bytes());
        data.extend_from_slice(&[0x02, 0x01]);
        // Declares 100 bytes, carries 1.
        data.extend_from_slice(&100u32.to_be_bytes());
        data.push(0xff);

        let packed = packer.pack(&sample(data, Some(true)));
        let mut expected = Vec::new();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&[0x02, 0x01]);
        assert_eq!(packed.annexb, expected);
        assert_eq!(packer.truncated_tails(), 1);
    }

    #[test]
    fn partial_length_prefix_truncates() {
        let packer = BitstreamPacker::new();
        let packed = packer.pack(&sample(vec![0x00, 0x00], Some(true)));
        assert!(packed.annexb.is_empty());
        assert_eq!(packer.truncated_tails(), 1);
    }

    #[test]
    fn empty_payload_packs_to_nothing() {
        let packer = BitstreamPacker::new();
        let packed = packer.pack(&sample(Vec::new(), Some(true)));
        assert!(packed.annexb.is_empty());
        assert_eq!(packer.truncated_tails(), 0);
    }

    #[test]
    fn every_unit_is_start_code_delimited() {
        let packer = BitstreamPacker::new();
        let units: Vec<Vec<u8>> = (0u8..5).map(|i| vec![0x02, i, i, i]).collect();
        let refs: Vec<&[u8]> = units.iter().map(Vec::as_slice).collect();
        let packed = packer.pack(&sample(length_prefixed(&refs), Some(true)));

        let mut offset = 0;
        let mut count = 0;
        while offset < packed.annexb.len() {
            assert_eq!(&packed.annexb[offset..offset + 4], &START_CODE);
            offset += 4 + 4; // start code + unit body
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
