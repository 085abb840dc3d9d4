// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Logical volumes (spec §3).

use uuid::Uuid;

use crate::model::segment::{PvHandle, Segment, SegId};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LvStatus: u32 {
        const ACTIVE       = 0b0000_0000_0001;
        const READ_ONLY    = 0b0000_0000_0010;
        const SUSPENDED    = 0b0000_0000_0100;
        const VISIBLE      = 0b0000_0000_1000;
        const PVMOVE       = 0b0000_0001_0000;
        /// Role flags: invariant 7 requires exactly one segment of the
        /// matching type when one of these is set (spec §3).
        const MIRROR_IMAGE = 0b0000_0010_0000;
        const RAID_IMAGE   = 0b0000_0100_0000;
        const RAID_META    = 0b0000_1000_0000;
        const THIN_POOL    = 0b0001_0000_0000;
        const THIN_VOLUME  = 0b0010_0000_0000;
        const SNAPSHOT     = 0b0100_0000_0000;
        const COW          = 0b1000_0000_0000;
        const LOCKED       = 0b1_0000_0000_0000;
        const NOTSYNCED    = 0b10_0000_0000_0000;
    }
}

#[derive(Debug, Clone)]
pub struct Lv {
    pub uuid: Uuid,
    pub name: String,
    /// Size in logical extents; always equals the sum of `segments[*].len`
    /// (spec §3 invariant 1).
    pub le_count: u64,
    /// Ordered, gapless partition of `[0, le_count)` (spec §3 invariant 1).
    pub segments: Vec<Segment>,
    /// Every segment area, anywhere in the VG, that points at this LV —
    /// the inverse of every `Area::Lv` in any segment's `areas` or
    /// `meta_areas` (spec §3 invariant 4, "back-reference multiset").
    pub segs_using_this_lv: Vec<SegId>,
    pub status: LvStatus,
    pub tags: Vec<String>,
    pub minor: Option<u32>,
    pub read_ahead: Option<u32>,
}

impl Lv {
    pub fn new(uuid: Uuid, name: String, le_count: u64) -> Self {
        Lv {
            uuid,
            name,
            le_count,
            segments: Vec::new(),
            segs_using_this_lv: Vec::new(),
            status: LvStatus::ACTIVE | LvStatus::VISIBLE,
            tags: Vec::new(),
            minor: None,
            read_ahead: None,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// True if `segments` exactly partitions `[0, le_count)` with no
    /// gaps, overlaps, or out-of-order entries (spec §3 invariant 1).
    pub fn segments_partition_cleanly(&self) -> bool {
        let mut expected = 0u64;
        for seg in &self.segments {
            if seg.le != expected {
                return false;
            }
            expected += seg.len;
        }
        expected == self.le_count
    }

    /// Every PV this LV draws extents from, directly, across all its
    /// segments (duplicates possible; used by `pv_dependencies`-style
    /// checks higher up).
    pub fn pv_dependencies(&self) -> impl Iterator<Item = PvHandle> + '_ {
        self.segments.iter().flat_map(|s| s.pv_dependencies())
    }

    pub fn segment_at(&self, le: u64) -> Option<&Segment> {
        self.segments.iter().find(|s| s.le <= le && le < s.end_le())
    }

    pub fn segment_at_mut(&mut self, le: u64) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.le <= le && le < s.end_le())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::segment::{Segment, SegmentType};

    #[test]
    fn fresh_lv_with_no_segments_only_partitions_when_empty() {
        let lv = Lv::new(Uuid::new_v4(), "empty".into(), 0);
        assert!(lv.segments_partition_cleanly());

        let mut lv = Lv::new(Uuid::new_v4(), "nonempty".into(), 10);
        assert!(!lv.segments_partition_cleanly());
        lv.segments.push(Segment::new(SegmentType::Striped, 0, 10, 1, 10));
        assert!(lv.segments_partition_cleanly());
    }

    #[test]
    fn gap_between_segments_fails_partition_check() {
        let mut lv = Lv::new(Uuid::new_v4(), "gapped".into(), 20);
        lv.segments.push(Segment::new(SegmentType::Striped, 0, 5, 1, 5));
        lv.segments.push(Segment::new(SegmentType::Striped, 10, 10, 1, 10));
        assert!(!lv.segments_partition_cleanly());
    }
}
