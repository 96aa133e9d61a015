//! Merge planning over the root snapshot
//!
//! The planner sees only persisted segments. The default policy keeps the
//! live-document size distribution roughly geometric: segments are binned
//! into tiers growing by `segments_per_tier` from `floor_segment_docs`, and
//! any tier holding more than `segments_per_tier` segments yields a merge
//! task over its smallest members. Tasks reclaiming more deleted documents
//! run first.

use crate::config::MergePolicyConfig;
use crate::error::Result;
use crate::segment::SegmentId;

/// Planner view of one mergeable segment
#[derive(Clone, Copy, Debug)]
pub struct PlanSegment {
    pub id: SegmentId,
    /// Documents in the segment, live and deleted alike
    pub doc_count: u32,
    /// Live documents at plan time
    pub live_doc_count: u64,
}

impl PlanSegment {
    fn reclaimable(&self) -> u64 {
        self.doc_count as u64 - self.live_doc_count
    }
}

/// One planned merge over at least two segments
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeTask {
    pub segment_ids: Vec<SegmentId>,
}

/// Planner output; empty when the layout needs no work
#[derive(Clone, Debug, Default)]
pub struct MergePlan {
    pub tasks: Vec<MergeTask>,
}

impl MergePlan {
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Pluggable merge planning policy
pub trait MergePolicy: Send + Sync {
    fn plan(&self, segments: &[PlanSegment]) -> Result<MergePlan>;
}

/// Default policy: geometric tiers with a deleted-documents tie-break
pub struct TieredMergePolicy {
    config: MergePolicyConfig,
}

impl TieredMergePolicy {
    pub fn new(config: MergePolicyConfig) -> Self {
        Self { config }
    }

    /// Tier of a segment given its live size; tier k spans
    /// `floor * ratio^k .. floor * ratio^(k+1)`
    fn tier_of(&self, live: u64) -> usize {
        let floor = self.config.floor_segment_docs.max(1);
        let ratio = (self.config.segments_per_tier as u64).max(2);

        let size = live.max(floor);
        let mut tier = 0;
        let mut tier_max = floor.saturating_mul(ratio);
        while size > tier_max && tier < 32 {
            tier += 1;
            match tier_max.checked_mul(ratio) {
                Some(next) => tier_max = next,
                None => break,
            }
        }
        tier
    }
}

impl Default for TieredMergePolicy {
    fn default() -> Self {
        Self::new(MergePolicyConfig::default())
    }
}

impl MergePolicy for TieredMergePolicy {
    fn plan(&self, segments: &[PlanSegment]) -> Result<MergePlan> {
        let mut tiers: Vec<Vec<PlanSegment>> = Vec::new();

        for seg in segments {
            // segments at the ceiling are left alone
            if seg.live_doc_count >= self.config.max_segment_docs {
                continue;
            }
            let tier = self.tier_of(seg.live_doc_count);
            if tiers.len() <= tier {
                tiers.resize_with(tier + 1, Vec::new);
            }
            tiers[tier].push(*seg);
        }

        let mut scored: Vec<(u64, MergeTask)> = Vec::new();

        for tier in &mut tiers {
            if tier.len() <= self.config.segments_per_tier {
                continue;
            }

            // merge the smallest members of the overloaded tier
            tier.sort_by_key(|s| s.live_doc_count);
            let want = (tier.len() - self.config.segments_per_tier + 1)
                .clamp(2, self.config.max_segments_per_merge.max(2));

            let mut chosen: Vec<PlanSegment> = tier.iter().take(want).copied().collect();

            // respect the ceiling for the merged result
            while chosen.len() > 2
                && chosen.iter().map(|s| s.live_doc_count).sum::<u64>()
                    > self.config.max_segment_docs
            {
                chosen.pop();
            }
            if chosen.len() < 2
                || chosen.iter().map(|s| s.live_doc_count).sum::<u64>()
                    > self.config.max_segment_docs
            {
                continue;
            }

            let reclaim: u64 = chosen.iter().map(|s| s.reclaimable()).sum();
            scored.push((
                reclaim,
                MergeTask {
                    segment_ids: chosen.iter().map(|s| s.id).collect(),
                },
            ));
        }

        // tasks eliminating the most deleted documents go first
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        Ok(MergePlan {
            tasks: scored.into_iter().map(|(_, task)| task).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(id: u64, doc_count: u32, live: u64) -> PlanSegment {
        PlanSegment {
            id: SegmentId::new(id),
            doc_count,
            live_doc_count: live,
        }
    }

    fn policy(segments_per_tier: usize, max_per_merge: usize) -> TieredMergePolicy {
        TieredMergePolicy::new(MergePolicyConfig {
            floor_segment_docs: 100,
            max_segment_docs: 10_000,
            segments_per_tier,
            max_segments_per_merge: max_per_merge,
        })
    }

    #[test]
    fn test_empty_when_few_segments() {
        let policy = policy(4, 4);
        let segments: Vec<_> = (0..3).map(|i| seg(i, 10, 10)).collect();
        assert!(policy.plan(&segments).unwrap().is_empty());
    }

    #[test]
    fn test_overloaded_tier_produces_task() {
        let policy = policy(4, 10);
        let segments: Vec<_> = (0..6).map(|i| seg(i, 10, 10)).collect();

        let plan = policy.plan(&segments).unwrap();
        assert_eq!(plan.tasks.len(), 1);
        assert!(plan.tasks[0].segment_ids.len() >= 2);
    }

    #[test]
    fn test_ceiling_excludes_huge_segments() {
        let policy = policy(2, 10);
        let segments = vec![
            seg(1, 20_000, 20_000),
            seg(2, 20_000, 20_000),
            seg(3, 20_000, 20_000),
            seg(4, 10, 10),
        ];
        // the huge segments are not candidates; one small segment is not enough
        assert!(policy.plan(&segments).unwrap().is_empty());
    }

    #[test]
    fn test_delete_heavy_task_first() {
        let policy = policy(1, 2);
        // two overloaded tiers: tier 0 (small, delete-free) and tier 1
        // (larger, delete-heavy)
        let segments = vec![
            seg(1, 10, 10),
            seg(2, 10, 10),
            seg(3, 5_000, 2_000),
            seg(4, 5_000, 2_000),
        ];

        let plan = policy.plan(&segments).unwrap();
        assert_eq!(plan.tasks.len(), 2);
        // the delete-heavy pair runs first
        assert!(plan.tasks[0]
            .segment_ids
            .contains(&SegmentId::new(3)));
    }

    #[test]
    fn test_max_segments_per_merge() {
        let policy = policy(2, 3);
        let segments: Vec<_> = (0..10).map(|i| seg(i, 10, 10)).collect();

        let plan = policy.plan(&segments).unwrap();
        assert!(!plan.is_empty());
        for task in &plan.tasks {
            assert!(task.segment_ids.len() <= 3);
        }
    }

    #[test]
    fn test_tier_assignment() {
        let policy = policy(10, 10);
        // floor 100, ratio 10: tier 0 up to 1_000, tier 1 up to 10_000
        assert_eq!(policy.tier_of(5), 0);
        assert_eq!(policy.tier_of(100), 0);
        assert_eq!(policy.tier_of(1_000), 0);
        assert_eq!(policy.tier_of(1_001), 1);
        assert_eq!(policy.tier_of(10_000), 1);
        assert_eq!(policy.tier_of(10_001), 2);
    }
}
