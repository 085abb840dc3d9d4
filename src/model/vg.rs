// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The volume group: owns every PV and LV and is the sole entry point
//! for the structural operations of spec §4.1.

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::arena::Arena;
use crate::model::lv::Lv;
use crate::model::pv::{Pv, PvSegState};
use crate::model::segment::{Area, LvHandle, PvHandle, PvSegId, Segment, SegId};

pub struct Vg {
    pub uuid: Uuid,
    pub name: String,
    /// Sectors per logical/physical extent; identical across the VG.
    pub extent_size: u64,
    pub pvs: Arena<Pv>,
    pub lvs: Arena<Lv>,
    pub tags: Vec<String>,
}

impl Vg {
    pub fn new(uuid: Uuid, name: String, extent_size: u64) -> Self {
        Vg { uuid, name, extent_size, pvs: Arena::new(), lvs: Arena::new(), tags: Vec::new() }
    }

    pub fn lv(&self, h: LvHandle) -> Result<&Lv> {
        self.lvs.get(h).ok_or_else(|| Error::internal("dangling LV handle"))
    }

    pub fn lv_mut(&mut self, h: LvHandle) -> Result<&mut Lv> {
        self.lvs.get_mut(h).ok_or_else(|| Error::internal("dangling LV handle"))
    }

    pub fn pv(&self, h: PvHandle) -> Result<&Pv> {
        self.pvs.get(h).ok_or_else(|| Error::internal("dangling PV handle"))
    }

    pub fn pv_mut(&mut self, h: PvHandle) -> Result<&mut Pv> {
        self.pvs.get_mut(h).ok_or_else(|| Error::internal("dangling PV handle"))
    }

    /// Append a new, fully unassigned segment to the end of `lv`'s
    /// segment list, extending `le_count` by `seg.len` (spec §4.1
    /// `alloc_lv_segment`). The caller fills in areas afterwards with
    /// `set_lv_segment_area_pv`/`set_lv_segment_area_lv`.
    pub fn alloc_lv_segment(&mut self, lv_h: LvHandle, mut seg: Segment) -> Result<SegId> {
        let lv = self.lv_mut(lv_h)?;
        let expected_le = lv.segments.iter().map(|s| s.len).sum();
        if seg.le != expected_le {
            return Err(Error::internal(format!(
                "alloc_lv_segment: segment.le {} does not continue the LV's segment list at {}",
                seg.le, expected_le
            )));
        }
        seg.le = expected_le;
        let seg_index = lv.segments.len();
        lv.le_count += seg.len;
        lv.segments.push(seg);
        Ok(SegId { lv: lv_h, seg_index })
    }

    fn segment_mut(&mut self, seg_id: SegId) -> Result<&mut Segment> {
        let lv = self.lv_mut(seg_id.lv)?;
        lv.segments
            .get_mut(seg_id.seg_index)
            .ok_or_else(|| Error::internal("dangling segment index"))
    }

    /// Assign `area_index` of `seg_id` to `area_len` extents starting
    /// at `pe_start` on `pv_h` (spec §4.1 `set_lv_segment_area_pv`).
    pub fn set_lv_segment_area_pv(
        &mut self,
        seg_id: SegId,
        area_index: usize,
        pv_h: PvHandle,
        pe_start: u64,
    ) -> Result<()> {
        let area_len = {
            let seg = self.segment_mut(seg_id)?;
            if area_index >= seg.areas.len() {
                return Err(Error::internal("area index out of range"));
            }
            if seg.areas[area_index].is_assigned() {
                return Err(Error::internal("area already assigned"));
            }
            seg.area_len
        };

        let pv = self.pv_mut(pv_h)?;
        let pv_seg_index = pv
            .segments
            .iter()
            .position(|s| s.is_free() && s.pe_start <= pe_start && pe_start + area_len <= s.end())
            .ok_or_else(|| Error::internal("requested PV range is not a single free run"))?;
        let new_index = pv.allocate_range(pv_seg_index, pe_start, area_len, seg_id.lv, seg_id.seg_index, area_index);

        let seg = self.segment_mut(seg_id)?;
        seg.areas[area_index] = Area::Pv { pv_seg: PvSegId { pv: pv_h, seg_index: new_index }, pe_offset: pe_start };
        Ok(())
    }

    /// Assign `area_index` of `seg_id` to reference `target_lv` at
    /// `le_offset` (spec §4.1 `set_lv_segment_area_lv`) — used for
    /// mirror logs, snapshot COW stores, thin pool metadata/data.
    pub fn set_lv_segment_area_lv(
        &mut self,
        seg_id: SegId,
        area_index: usize,
        target_lv: LvHandle,
        le_offset: u64,
    ) -> Result<()> {
        {
            let seg = self.segment_mut(seg_id)?;
            if area_index >= seg.areas.len() {
                return Err(Error::internal("area index out of range"));
            }
            if seg.areas[area_index].is_assigned() {
                return Err(Error::internal("area already assigned"));
            }
            seg.areas[area_index] = Area::Lv { lv: target_lv, le_offset };
        }
        let target = self.lv_mut(target_lv)?;
        target.segs_using_this_lv.push(seg_id);
        Ok(())
    }

    /// As `set_lv_segment_area_lv`, but for `meta_areas` — mirror logs,
    /// thin pool metadata LVs, and snapshot COW stores / merge targets
    /// all attach here rather than to `areas`.
    pub fn set_lv_segment_meta_area_lv(&mut self, seg_id: SegId, area_index: usize, target_lv: LvHandle, le_offset: u64) -> Result<()> {
        {
            let seg = self.segment_mut(seg_id)?;
            if area_index >= seg.meta_areas.len() {
                return Err(Error::internal("meta area index out of range"));
            }
            if seg.meta_areas[area_index].is_assigned() {
                return Err(Error::internal("meta area already assigned"));
            }
            seg.meta_areas[area_index] = Area::Lv { lv: target_lv, le_offset };
        }
        let target = self.lv_mut(target_lv)?;
        target.segs_using_this_lv.push(seg_id);
        Ok(())
    }

    /// Undo either `set_lv_segment_area_pv` or `set_lv_segment_area_lv`,
    /// freeing PV extents or dropping the back-reference, and resetting
    /// the area to `Unassigned` (spec §4.1 `release_lv_segment_area`).
    pub fn release_lv_segment_area(&mut self, seg_id: SegId, area_index: usize) -> Result<()> {
        self.release_area(seg_id, area_index, false)
    }

    /// As `release_lv_segment_area`, but for `meta_areas` — RAID
    /// per-image metadata, a mirror log, a thin pool's metadata LV, or
    /// a snapshot's COW store / merge target.
    pub fn release_lv_segment_meta_area(&mut self, seg_id: SegId, area_index: usize) -> Result<()> {
        self.release_area(seg_id, area_index, true)
    }

    fn release_area(&mut self, seg_id: SegId, area_index: usize, meta: bool) -> Result<()> {
        let (area, area_len) = {
            let seg = self.segment_mut(seg_id)?;
            let slot = if meta { &mut seg.meta_areas } else { &mut seg.areas };
            let area = slot.get_mut(area_index).ok_or_else(|| Error::internal("area index out of range"))?;
            (std::mem::replace(area, Area::Unassigned), seg.area_len)
        };

        match area {
            Area::Unassigned => {}
            Area::Pv { pv_seg, .. } => {
                let pv = self.pv_mut(pv_seg.pv)?;
                let pv_seg_slot = pv
                    .segments
                    .get(pv_seg.seg_index)
                    .ok_or_else(|| Error::internal("dangling PV segment index"))?;
                let pe_start = pv_seg_slot.pe_start;
                pv.release_range(pe_start, area_len);
            }
            Area::Lv { lv, .. } => {
                let target = self.lv_mut(lv)?;
                target.segs_using_this_lv.retain(|&s| s != seg_id);
            }
        }
        Ok(())
    }

    /// Release then reassign an area to a different PV location (spec
    /// §4.1 `move_lv_segment_area`) — pvmove's building block.
    pub fn move_lv_segment_area(&mut self, seg_id: SegId, area_index: usize, new_pv: PvHandle, new_pe_start: u64) -> Result<()> {
        self.release_lv_segment_area(seg_id, area_index)?;
        self.set_lv_segment_area_pv(seg_id, area_index, new_pv, new_pe_start)
    }

    /// Split the segment spanning `le` into two at that boundary
    /// (spec §4.1 `lv_split_segment`). Only defined for segments with
    /// exactly one area per position (`area_count == 1`); splitting a
    /// striped/mirrored/raid segment would require re-deriving
    /// per-area offsets mid-stripe, which callers avoid by never
    /// requesting a split inside one.
    pub fn lv_split_segment(&mut self, lv_h: LvHandle, le: u64) -> Result<()> {
        let (idx, first_len, second_len, orig_area) = {
            let lv = self.lvs.get(lv_h).ok_or_else(|| Error::internal("dangling LV handle"))?;
            let idx = lv
                .segments
                .iter()
                .position(|s| s.le < le && le < s.end_le())
                .ok_or_else(|| Error::validation(format!("no segment boundary to split at LE {}", le)))?;
            let seg = &lv.segments[idx];
            if seg.area_count != 1 {
                return Err(Error::validation("cannot split a segment with more than one area"));
            }
            (idx, le - seg.le, seg.end_le() - le, seg.areas[0])
        };

        let lv = self.lvs.get(lv_h).unwrap();
        let seg = &lv.segments[idx];
        let mut first = seg.clone();
        first.len = first_len;
        first.area_len = first_len;
        let mut second = seg.clone();
        second.le = le;
        second.len = second_len;
        second.area_len = second_len;

        match orig_area {
            Area::Pv { pv_seg, pe_offset } => {
                let pv = self.pvs.get_mut(pv_seg.pv).ok_or_else(|| Error::internal("dangling PV handle"))?;
                let (first_pv_idx, second_pv_idx) = pv.split_allocated(pv_seg.seg_index, first_len);
                first.areas[0] = Area::Pv { pv_seg: PvSegId { pv: pv_seg.pv, seg_index: first_pv_idx }, pe_offset };
                second.areas[0] =
                    Area::Pv { pv_seg: PvSegId { pv: pv_seg.pv, seg_index: second_pv_idx }, pe_offset: pe_offset + first_len };
            }
            Area::Lv { lv: target, le_offset } => {
                second.areas[0] = Area::Lv { lv: target, le_offset: le_offset + first_len };
            }
            Area::Unassigned => {}
        }

        let lv = self.lvs.get_mut(lv_h).ok_or_else(|| Error::internal("dangling LV handle"))?;
        lv.segments.splice(idx..=idx, [first, second]);
        let segments = lv.segments.clone();

        for (i, seg) in segments.iter().enumerate().skip(idx) {
            if let Area::Pv { pv_seg, .. } = &seg.areas[0] {
                if let Some(pv) = self.pvs.get_mut(pv_seg.pv) {
                    if let Some(slot) = pv.segments.get_mut(pv_seg.seg_index) {
                        if let PvSegState::Allocated { seg_index, .. } = &mut slot.state {
                            *seg_index = i;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Merge adjacent segments `seg_index` and `seg_index + 1` of `lv`
    /// when they are the same type and their sole areas are
    /// contiguous on the same PV (spec §4.1 `lv_merge_segments`) — the
    /// inverse of `lv_split_segment`, used after a `pvmove` finishes.
    pub fn lv_merge_segments(&mut self, lv_h: LvHandle, seg_index: usize) -> Result<()> {
        let (b_len, pv_merge) = {
            let lv = self.lvs.get(lv_h).ok_or_else(|| Error::internal("dangling LV handle"))?;
            if seg_index + 1 >= lv.segments.len() {
                return Err(Error::validation("no following segment to merge with"));
            }
            let (a, b) = (&lv.segments[seg_index], &lv.segments[seg_index + 1]);
            if a.area_count != 1 || b.area_count != 1 || a.ty != b.ty {
                return Err(Error::validation("segments are not mergeable"));
            }
            let pv_merge = match (&a.areas[0], &b.areas[0]) {
                (Area::Pv { pv_seg: pa, pe_offset: oa }, Area::Pv { pv_seg: pb, pe_offset: ob }) => {
                    if pa.pv == pb.pv && oa + a.len == *ob {
                        Some(*pa)
                    } else {
                        return Err(Error::validation("segments are not adjacent on the same backing store"));
                    }
                }
                (Area::Lv { lv: la, le_offset: oa }, Area::Lv { lv: lb, le_offset: ob }) => {
                    if la == lb && oa + a.len == *ob {
                        None
                    } else {
                        return Err(Error::validation("segments are not adjacent on the same backing store"));
                    }
                }
                _ => return Err(Error::validation("segments are not adjacent on the same backing store")),
            };
            (b.len, pv_merge)
        };

        if let Some(pv_seg) = pv_merge {
            let pv = self.pvs.get_mut(pv_seg.pv).ok_or_else(|| Error::internal("dangling PV handle"))?;
            pv.merge_allocated(pv_seg.seg_index);
        }

        let lv = self.lvs.get_mut(lv_h).ok_or_else(|| Error::internal("dangling LV handle"))?;
        lv.segments[seg_index].len += b_len;
        lv.segments[seg_index].area_len += b_len;
        lv.segments.remove(seg_index + 1);
        let segments = lv.segments.clone();

        for (i, seg) in segments.iter().enumerate().skip(seg_index) {
            if let Area::Pv { pv_seg, .. } = &seg.areas[0] {
                if let Some(pv) = self.pvs.get_mut(pv_seg.pv) {
                    if let Some(slot) = pv.segments.get_mut(pv_seg.seg_index) {
                        if let PvSegState::Allocated { seg_index: si, .. } = &mut slot.state {
                            *si = i;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Validate every invariant in spec §3 against `lv` (spec §4.1
    /// `check_lv_segments`).
    pub fn check_lv_segments(&self, lv_h: LvHandle) -> Result<()> {
        crate::model::validate::validate_lv(self, lv_h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::segment::SegmentType;

    fn new_vg() -> Vg {
        Vg::new(Uuid::new_v4(), "vg0".into(), 8192)
    }

    fn new_pv(vg: &mut Vg, pe_count: u64) -> PvHandle {
        vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv".into(), "/dev/sda".into(), 8192, 2048, pe_count))
    }

    #[test]
    fn alloc_and_assign_linear_segment() {
        let mut vg = new_vg();
        let pv = new_pv(&mut vg, 100);
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));

        let seg_id = vg
            .alloc_lv_segment(lv, Segment::new(SegmentType::Striped, 0, 10, 1, 10))
            .unwrap();
        vg.set_lv_segment_area_pv(seg_id, 0, pv, 0).unwrap();

        assert_eq!(vg.lv(lv).unwrap().le_count, 10);
        assert!(vg.check_lv_segments(lv).is_ok());
        assert_eq!(vg.pv(pv).unwrap().free_count(), 90);
    }

    #[test]
    fn split_then_merge_round_trips() {
        let mut vg = new_vg();
        let pv = new_pv(&mut vg, 100);
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let seg_id = vg
            .alloc_lv_segment(lv, Segment::new(SegmentType::Striped, 0, 20, 1, 20))
            .unwrap();
        vg.set_lv_segment_area_pv(seg_id, 0, pv, 0).unwrap();

        vg.lv_split_segment(lv, 10).unwrap();
        assert_eq!(vg.lv(lv).unwrap().segments.len(), 2);
        assert!(vg.check_lv_segments(lv).is_ok());

        vg.lv_merge_segments(lv, 0).unwrap();
        assert_eq!(vg.lv(lv).unwrap().segments.len(), 1);
        assert!(vg.check_lv_segments(lv).is_ok());
    }

    #[test]
    fn release_area_frees_pv_extents() {
        let mut vg = new_vg();
        let pv = new_pv(&mut vg, 100);
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let seg_id = vg
            .alloc_lv_segment(lv, Segment::new(SegmentType::Striped, 0, 10, 1, 10))
            .unwrap();
        vg.set_lv_segment_area_pv(seg_id, 0, pv, 0).unwrap();
        vg.release_lv_segment_area(seg_id, 0).unwrap();
        assert_eq!(vg.pv(pv).unwrap().free_count(), 100);
    }
}
