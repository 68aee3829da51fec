// Copyright 2025 framelink Authors
// SPDX-License-Identifier: Apache-2.0

//! Pose lookup.
//!
//! The pose store itself lives outside this crate; the receiver only
//! queries it with the 3x4 pose carried on each frame. Frames are
//! processed whether a match exists or not.

use std::collections::VecDeque;
use std::sync::Mutex;

use framelink_protocol::Pose;

/// A matched pose entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseMatch {
    /// The stored pose.
    pub pose: Pose,
    /// Timestamp associated with the stored pose.
    pub target_timestamp_ns: u64,
}

/// Pose history queried once per frame.
pub trait PoseHistory: Send + Sync {
    /// The stored entry closest to `pose`, if any.
    fn best_match(&self, pose: &Pose) -> Option<PoseMatch>;
}

/// History that never matches. Used when no pose store is wired up.
#[derive(Debug, Default)]
pub struct NullPoseHistory;

impl PoseHistory for NullPoseHistory {
    fn best_match(&self, _pose: &Pose) -> Option<PoseMatch> {
        None
    }
}

/// Bounded in-memory history matching by elementwise squared distance.
#[derive(Debug)]
pub struct RecentPoseHistory {
    entries: Mutex<VecDeque<PoseMatch>>,
    capacity: usize,
}

impl RecentPoseHistory {
    pub fn new(capacity: usize) -> Self {
        RecentPoseHistory {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Records a pose; the oldest entry falls out past capacity.
    pub fn record(&self, pose: Pose, target_timestamp_ns: u64) {
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(PoseMatch {
            pose,
            target_timestamp_ns,
        });
    }
}

fn pose_distance(a: &Pose, b: &Pose) -> f32 {
    let mut sum = 0.0;
    for row in 0..3 {
        for col in 0..4 {
            let d = a[row][col] - b[row][col];
            sum += d * d;
        }
    }
    sum
}

impl PoseHistory for RecentPoseHistory {
    fn best_match(&self, pose: &Pose) -> Option<PoseMatch> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        entries
            .iter()
            .min_by(|a, b| {
                pose_distance(&a.pose, pose)
                    .partial_cmp(&pose_distance(&b.pose, pose))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use framelink_protocol::frame::POSE_IDENTITY;

    fn translated(x: f32) -> Pose {
        let mut pose = POSE_IDENTITY;
        pose[0][3] = x;
        pose
    }

    #[test]
    fn null_history_never_matches() {
        assert!(NullPoseHistory.best_match(&POSE_IDENTITY).is_none());
    }

    #[test]
    fn empty_history_never_matches() {
        let history = RecentPoseHistory::new(4);
        assert!(history.best_match(&POSE_IDENTITY).is_none());
    }

    #[test]
    fn picks_the_nearest_pose() {
        let history = RecentPoseHistory::new(4);
        history.record(translated(0.0), 100);
        history.record(translated(1.0), 200);
        history.record(translated(2.0), 300);

        let matched = history.best_match(&translated(1.1)).unwrap();
        assert_eq!(matched.target_timestamp_ns, 200);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let history = RecentPoseHistory::new(2);
        history.record(translated(0.0), 100);
        history.record(translated(10.0), 200);
        history.record(translated(20.0), 300);

        // The entry at 0.0 has been evicted; nearest is now 10.0.
        let matched = history.best_match(&translated(0.0)).unwrap();
        assert_eq!(matched.target_timestamp_ns, 200);
    }
}
