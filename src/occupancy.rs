use std::collections::HashSet;

use crate::metadata::{DetectionBox, OccupancySnapshot};

/// 统计单个视频内出现过的行人 ID
///
/// 累计人数等于出现过的不同 ID 个数，只增不减；当前人数只看本帧。
#[derive(Debug, Default)]
pub struct OccupancyAggregator {
    seen: HashSet<u64>,
    current: HashSet<u64>,
    frame_index: u64,
}

impl OccupancyAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用本帧检测结果更新统计。没有 ID 的检测框不参与计数。
    pub fn observe(&mut self, detections: &[DetectionBox]) -> OccupancySnapshot {
        self.frame_index += 1;
        self.current.clear();
        self.current
            .extend(detections.iter().filter_map(|d| d.identity));
        self.seen.extend(self.current.iter().copied());
        self.snapshot()
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        OccupancySnapshot {
            current_count: self.current.len(),
            cumulative_count: self.seen.len(),
            frame_index: self.frame_index,
        }
    }

    pub fn cumulative_count(&self) -> usize {
        self.seen.len()
    }

    pub fn frames_observed(&self) -> u64 {
        self.frame_index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ids: &[u64]) -> Vec<DetectionBox> {
        ids.iter()
            .map(|&id| DetectionBox::new(0, 0, 10, 10, 0.9).with_identity(id))
            .collect()
    }

    #[test]
    fn synthetic_stream_counts() {
        let mut agg = OccupancyAggregator::new();
        let frames = [frame(&[1, 2]), frame(&[2, 3]), frame(&[])];
        let snapshots: Vec<_> = frames.iter().map(|f| agg.observe(f)).collect();

        let cumulative: Vec<_> = snapshots.iter().map(|s| s.cumulative_count).collect();
        let current: Vec<_> = snapshots.iter().map(|s| s.current_count).collect();
        assert_eq!(cumulative, vec![2, 3, 3]);
        assert_eq!(current, vec![2, 2, 0]);
        assert_eq!(snapshots[2].frame_index, 3);
    }

    #[test]
    fn cumulative_never_decreases_and_bounds_current() {
        let mut agg = OccupancyAggregator::new();
        let mut last = 0;
        for i in 0..200u64 {
            let ids: Vec<u64> = (0..(i % 7)).map(|k| (i / 3 + k) % 40).collect();
            let snap = agg.observe(&frame(&ids));
            assert!(snap.current_count <= snap.cumulative_count);
            assert!(snap.cumulative_count >= last);
            last = snap.cumulative_count;
        }
    }

    #[test]
    fn untracked_boxes_are_ignored() {
        let mut agg = OccupancyAggregator::new();
        let mut dets = frame(&[4]);
        dets.push(DetectionBox::new(5, 5, 20, 20, 0.7));
        let snap = agg.observe(&dets);
        assert_eq!(snap.current_count, 1);
        assert_eq!(snap.cumulative_count, 1);
    }

    #[test]
    fn duplicate_ids_in_one_frame_count_once() {
        let mut agg = OccupancyAggregator::new();
        let snap = agg.observe(&frame(&[9, 9]));
        assert_eq!(snap.current_count, 1);
        assert_eq!(agg.cumulative_count(), 1);
    }
}
