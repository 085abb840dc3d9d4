// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Physical volumes and the PV segment list (spec §3).

use uuid::Uuid;

use crate::model::segment::LvHandle;

/// One slot of a PV's segment list. The list always totally covers
/// `[0, pe_count)` with no gaps or overlaps (spec §3 invariant 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PvSegState {
    Free,
    Allocated { lv: LvHandle, seg_index: usize, area_index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PvSegment {
    pub pe_start: u64,
    pub pe_len: u64,
    pub state: PvSegState,
}

impl PvSegment {
    pub fn is_free(&self) -> bool {
        matches!(self.state, PvSegState::Free)
    }

    pub fn end(&self) -> u64 {
        self.pe_start + self.pe_len
    }
}

#[derive(Debug, Clone)]
pub struct Pv {
    pub uuid: Uuid,
    pub name: String,
    pub device_path: String,
    /// Size of one physical extent, in sectors.
    pub pe_size: u64,
    /// Sector offset of the first extent (after label + metadata areas).
    pub pe_start: u64,
    /// Total extents on the device, free or allocated.
    pub pe_count: u64,
    pub tags: Vec<String>,
    /// Totally covers `[0, pe_count)`; see `PvSegment`.
    pub segments: Vec<PvSegment>,
}

impl Pv {
    pub fn new(uuid: Uuid, name: String, device_path: String, pe_size: u64, pe_start: u64, pe_count: u64) -> Self {
        Pv {
            uuid,
            name,
            device_path,
            pe_size,
            pe_start,
            pe_count,
            tags: Vec::new(),
            segments: vec![PvSegment { pe_start: 0, pe_len: pe_count, state: PvSegState::Free }],
        }
    }

    pub fn free_count(&self) -> u64 {
        self.segments.iter().filter(|s| s.is_free()).map(|s| s.pe_len).sum()
    }

    pub fn allocated_count(&self) -> u64 {
        self.pe_count - self.free_count()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Every free run of at least one extent, as `(pe_start, pe_len,
    /// segment_index)`.
    pub fn free_runs(&self) -> impl Iterator<Item = (u64, u64, usize)> + '_ {
        self.segments
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_free())
            .map(|(i, s)| (s.pe_start, s.pe_len, i))
    }

    /// Split the free segment at index `seg_index` so that exactly
    /// `len` extents starting at `offset` become a new segment, then
    /// mark it allocated. `offset` must equal the segment's `pe_start`
    /// and `len` must not exceed its `pe_len` (the allocator always
    /// calls this with an in-bounds sub-run, never a disjoint range).
    /// Returns the index of the newly allocated segment; the caller
    /// (which holds this PV's own handle) combines it into a
    /// `PvSegId`.
    pub fn allocate_range(
        &mut self,
        seg_index: usize,
        offset: u64,
        len: u64,
        lv: LvHandle,
        lv_seg_index: usize,
        area_index: usize,
    ) -> usize {
        let seg = self.segments[seg_index];
        assert!(seg.is_free());
        assert_eq!(seg.pe_start, offset);
        assert!(len <= seg.pe_len);

        let mut replacement = vec![PvSegment {
            pe_start: offset,
            pe_len: len,
            state: PvSegState::Allocated { lv, seg_index: lv_seg_index, area_index },
        }];
        if len < seg.pe_len {
            replacement.push(PvSegment {
                pe_start: offset + len,
                pe_len: seg.pe_len - len,
                state: PvSegState::Free,
            });
        }
        self.segments.splice(seg_index..=seg_index, replacement);
        seg_index
    }

    /// Split the allocated segment at `seg_index` into two, the first
    /// `first_len` extents long, both inheriting the original's state
    /// (the caller fixes up `state.seg_index` afterwards to match the
    /// LV segment list it just split). Returns `(first, second)`
    /// indices.
    pub fn split_allocated(&mut self, seg_index: usize, first_len: u64) -> (usize, usize) {
        let seg = self.segments[seg_index];
        assert!(!seg.is_free());
        assert!(first_len < seg.pe_len);
        let replacement = vec![
            PvSegment { pe_start: seg.pe_start, pe_len: first_len, state: seg.state },
            PvSegment { pe_start: seg.pe_start + first_len, pe_len: seg.pe_len - first_len, state: seg.state },
        ];
        self.segments.splice(seg_index..=seg_index, replacement);
        (seg_index, seg_index + 1)
    }

    /// Merge the allocated segments at `first` and `first + 1` into
    /// one, provided they are adjacent (`self.segments[first].end() ==
    /// self.segments[first + 1].pe_start`); the caller has already
    /// verified they describe the same LV/area at a contiguous offset.
    /// The merged segment keeps `first`'s state, which the caller
    /// fixes up afterwards.
    pub fn merge_allocated(&mut self, first: usize) {
        let a = self.segments[first];
        let b = self.segments[first + 1];
        assert!(!a.is_free() && !b.is_free());
        assert_eq!(a.end(), b.pe_start);
        let merged = PvSegment { pe_start: a.pe_start, pe_len: a.pe_len + b.pe_len, state: a.state };
        self.segments.splice(first..=first + 1, [merged]);
    }

    /// Mark `[pe_start, pe_start+len)` free again and coalesce with
    /// neighbouring free segments.
    pub fn release_range(&mut self, pe_start: u64, len: u64) {
        if let Some(idx) = self
            .segments
            .iter()
            .position(|s| s.pe_start == pe_start && s.pe_len == len)
        {
            self.segments[idx].state = PvSegState::Free;
            self.coalesce_free();
        }
    }

    fn coalesce_free(&mut self) {
        let mut merged: Vec<PvSegment> = Vec::with_capacity(self.segments.len());
        for seg in self.segments.drain(..) {
            if let Some(last) = merged.last_mut() {
                if last.is_free() && seg.is_free() {
                    last.pe_len += seg.pe_len;
                    continue;
                }
            }
            merged.push(seg);
        }
        self.segments = merged;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::arena::Arena;
    use crate::model::lv::Lv;

    fn fresh_pv(pe_count: u64) -> Pv {
        Pv::new(Uuid::new_v4(), "pv0".into(), "/dev/sda1".into(), 8192, 2048, pe_count)
    }

    #[test]
    fn new_pv_is_entirely_free() {
        let pv = fresh_pv(100);
        assert_eq!(pv.free_count(), 100);
        assert_eq!(pv.allocated_count(), 0);
        assert_eq!(pv.segments.len(), 1);
    }

    #[test]
    fn allocate_and_release_round_trips_to_single_free_segment() {
        let mut arena: Arena<Lv> = Arena::new();
        let lv = arena.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 10));
        let mut pv = fresh_pv(100);

        pv.allocate_range(0, 0, 10, lv, 0, 0);
        assert_eq!(pv.free_count(), 90);
        assert_eq!(pv.segments.len(), 2);

        pv.release_range(0, 10);
        assert_eq!(pv.free_count(), 100);
        assert_eq!(pv.segments.len(), 1);
    }
}
