// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! LV-level operations built on top of `model::vg::Vg` and the
//! allocator (spec §4.3).

use crate::alloc::allocator::{allocate, mirror_log_extents, AllocRequest};
use crate::alloc::policy::AllocPolicy;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::model::lv::Lv;
use crate::model::segment::{Area, LvHandle, Segment, SegmentType};
use crate::model::vg::Vg;

/// Default mirror/RAID bitmap region size, in 512-byte sectors (2 MiB),
/// matching `DEFAULT_RAID_REGION_SIZE` in `lv_manip.c`.
const DEFAULT_REGION_SIZE_SECTORS: u64 = 2 * 1024 * 1024 / 512;

/// An MD bitmap has room for at most 2^21 regions. Double `region_size`
/// until `data_sectors` fits within that many regions (spec §8:
/// "`lv_extend` on a mirror whose MD bitmap would exceed 2^21 regions
/// doubles `region_size` until the product fits").
fn region_size_for(data_sectors: u64, initial: u64) -> u64 {
    const MAX_REGIONS: u64 = 1 << 21;
    let mut region_size = initial.max(1);
    while data_sectors.div_ceil(region_size) > MAX_REGIONS {
        region_size *= 2;
    }
    region_size
}

/// Grow `lv` by `extents` logical extents of `ty`, spread over
/// `area_count` (+ `parity_count`) parallel areas under `policy`
/// (spec §4.3 `lv_extend`). Allocation and commit happen atomically
/// from the caller's point of view: either every area lands or the VG
/// is left exactly as it was. A `Mirror` segment additionally grows a
/// bitmap log, sized and region-capped per spec §8, landed on its own
/// PV whenever `mirror_logs_require_separate_pvs` is set.
pub fn lv_extend(
    vg: &mut Vg,
    ctx: &CoreContext,
    lv_h: LvHandle,
    ty: SegmentType,
    extents: u64,
    area_count: u32,
    parity_count: u32,
    policy: AllocPolicy,
) -> Result<()> {
    if extents == 0 {
        return Err(Error::validation("lv_extend: requested extent count is zero"));
    }
    let log_region_size = matches!(ty, SegmentType::Mirror)
        .then(|| region_size_for(extents * vg.extent_size, DEFAULT_REGION_SIZE_SECTORS));
    let req = AllocRequest {
        ty: ty.clone(),
        area_count,
        parity_count,
        area_len: extents,
        policy,
        lv: lv_h,
        allowed_pvs: None,
        parallel_areas: Vec::new(),
        log_region_size,
    };
    let plan = allocate(vg, ctx, &req)?;
    let data_areas = (area_count + parity_count) as usize;
    debug_assert_eq!(plan.areas.len(), data_areas + if log_region_size.is_some() { 1 } else { 0 });

    let le = vg.lv(lv_h)?.segments.iter().map(|s| s.len).sum();
    let mut seg = Segment::new(ty, le, extents, area_count, extents);
    seg.region_size = log_region_size;
    if log_region_size.is_some() {
        seg.meta_areas.push(Area::Unassigned);
    }
    let seg_id = vg.alloc_lv_segment(lv_h, seg)?;

    let mut areas = plan.areas.into_iter();
    for area_index in 0..data_areas {
        let (pv, pe_start) = areas.next().ok_or_else(|| Error::internal("allocator returned too few areas"))?;
        if let Err(e) = vg.set_lv_segment_area_pv(seg_id, area_index, pv, pe_start) {
            for i in 0..area_index {
                let _ = vg.release_lv_segment_area(seg_id, i);
            }
            return Err(e);
        }
    }
    if let Some(region_size) = log_region_size {
        let (pv, pe_start) = areas.next().ok_or_else(|| Error::internal("allocator did not return a log area"))?;
        let log_len = mirror_log_extents(extents, vg.extent_size, region_size);
        let log_name = format!("{}_mlog", vg.lv(lv_h)?.name);
        let log_lv = vg.lvs.alloc(Lv::new(uuid::Uuid::new_v4(), log_name, 0));
        let log_seg_id = vg.alloc_lv_segment(log_lv, Segment::new(SegmentType::Striped, 0, log_len, 1, log_len))?;
        let commit = vg
            .set_lv_segment_area_pv(log_seg_id, 0, pv, pe_start)
            .and_then(|_| vg.set_lv_segment_meta_area_lv(seg_id, 0, log_lv, 0));
        if let Err(e) = commit {
            vg.lvs.remove(log_lv);
            for i in 0..data_areas {
                let _ = vg.release_lv_segment_area(seg_id, i);
            }
            return Err(e);
        }
    }
    log::info!("extended LV {} by {} extents under policy {:?}", vg.lv(lv_h)?.name, extents, req.policy);
    Ok(())
}

/// Shrink `lv` by `extents` logical extents, removing whole trailing
/// segments and truncating the last surviving one as needed (spec
/// §4.3 `lv_reduce`). Extents are released back to their PVs as each
/// segment is dropped.
pub fn lv_reduce(vg: &mut Vg, lv_h: LvHandle, extents: u64) -> Result<()> {
    let le_count = vg.lv(lv_h)?.le_count;
    if extents > le_count {
        return Err(Error::validation(format!("lv_reduce: cannot remove {} extents from an LV of {}", extents, le_count)));
    }
    let mut remaining = extents;
    while remaining > 0 {
        let (last_index, last_len, area_count, meta_count) = {
            let lv = vg.lv(lv_h)?;
            let last = lv.segments.last().ok_or_else(|| Error::internal("lv_reduce: LV has extents but no segments"))?;
            (lv.segments.len() - 1, last.len, last.area_count, last.meta_areas.len())
        };
        if remaining >= last_len {
            let seg_id = crate::model::segment::SegId { lv: lv_h, seg_index: last_index };
            for area_index in 0..area_count as usize {
                vg.release_lv_segment_area(seg_id, area_index)?;
            }
            for area_index in 0..meta_count {
                vg.release_lv_segment_meta_area(seg_id, area_index)?;
            }
            vg.lv_mut(lv_h)?.segments.pop();
            vg.lv_mut(lv_h)?.le_count -= last_len;
            remaining -= last_len;
        } else {
            let split_at = vg.lv(lv_h)?.segments[last_index].le + (last_len - remaining);
            vg.lv_split_segment(lv_h, split_at)?;
            let lv = vg.lv_mut(lv_h)?;
            let dropped = lv.segments.pop().unwrap();
            lv.le_count -= dropped.len;
            for area_index in 0..dropped.area_count as usize {
                vg.release_lv_segment_area(crate::model::segment::SegId { lv: lv_h, seg_index: last_index + 1 }, area_index)
                    .ok();
            }
            remaining = 0;
        }
    }
    vg.check_lv_segments(lv_h)
}

/// Rename `lv` in place, rejecting collisions with any other LV in the
/// VG (spec §4.3 `lv_rename`).
pub fn lv_rename(vg: &mut Vg, lv_h: LvHandle, new_name: &str) -> Result<()> {
    if vg.lvs.iter().any(|(h, lv)| h != lv_h && lv.name == new_name) {
        return Err(Error::validation(format!("an LV named {} already exists in this VG", new_name)));
    }
    vg.lv_mut(lv_h)?.name = new_name.to_string();
    Ok(())
}

/// Every LV that must be torn down alongside `lv_h`: `lv_h` itself
/// plus every LV it depends on transitively through `Area::Lv` links
/// that exist solely to serve it (mirror logs, snapshot COW stores,
/// thin pool metadata/data) and that no other visible LV also uses.
fn dependent_lvs(vg: &Vg, lv_h: LvHandle) -> Vec<LvHandle> {
    let mut stack = vec![lv_h];
    let mut out = Vec::new();
    while let Some(h) = stack.pop() {
        if out.contains(&h) {
            continue;
        }
        out.push(h);
        if let Ok(lv) = vg.lv(h) {
            for seg in &lv.segments {
                for area in seg.areas.iter().chain(seg.meta_areas.iter()) {
                    if let Area::Lv { lv: target, .. } = area {
                        let solely_used_here = vg
                            .lv(*target)
                            .map(|t| t.segs_using_this_lv.iter().all(|s| s.lv == h))
                            .unwrap_or(false);
                        if solely_used_here {
                            stack.push(*target);
                        }
                    }
                }
            }
        }
    }
    out
}

/// Remove `lv_h` and every private dependent LV (mirror logs,
/// snapshot stores, ...) that would otherwise be orphaned (spec §4.3
/// `lv_remove_with_dependencies`). Refuses if any *other* visible LV
/// still references one of them.
pub fn lv_remove_with_dependencies(vg: &mut Vg, lv_h: LvHandle) -> Result<()> {
    let victims = dependent_lvs(vg, lv_h);
    for &victim in &victims {
        let lv = vg.lv(victim)?;
        let external_refs = lv.segs_using_this_lv.iter().any(|s| !victims.contains(&s.lv));
        if external_refs {
            return Err(Error::validation(format!(
                "cannot remove LV {}: still referenced by an LV outside its own dependency set",
                lv.name
            )));
        }
    }

    for &victim in &victims {
        let seg_count = vg.lv(victim)?.segments.len();
        for seg_index in 0..seg_count {
            let seg_id = crate::model::segment::SegId { lv: victim, seg_index };
            let area_count = vg.lv(victim)?.segments[seg_index].areas.len();
            for area_index in 0..area_count {
                vg.release_lv_segment_area(seg_id, area_index)?;
            }
            let meta_count = vg.lv(victim)?.segments[seg_index].meta_areas.len();
            for area_index in 0..meta_count {
                vg.release_lv_segment_meta_area(seg_id, area_index)?;
            }
        }
        vg.lvs.remove(victim);
    }
    Ok(())
}

/// Insert a new, internal LV between `lv_h` and all of its current
/// segments, moving every existing segment onto the new layer and
/// replacing `lv_h`'s own segment list with a single full-size area
/// pointing at it (spec §4.3 `insert_layer_for_lv`). Used to slot a
/// mirror or a thin-pool data volume underneath an LV that callers
/// keep the name and UUID of.
pub fn insert_layer_for_lv(vg: &mut Vg, lv_h: LvHandle, layer_name: &str) -> Result<LvHandle> {
    let (le_count, moved_segments, old_uuid) = {
        let lv = vg.lv(lv_h)?;
        (lv.le_count, lv.segments.clone(), lv.uuid)
    };

    let layer = vg.lvs.alloc(Lv::new(uuid::Uuid::new_v4(), layer_name.to_string(), le_count));
    vg.lv_mut(layer)?.segments = moved_segments;

    // Areas that pointed at lv_h's old segments by PV/LV reference did
    // not move; only the segment *list* moved to the new layer, so any
    // back-references recorded against lv_h's old segment indices must
    // be repointed at the layer.
    let seg_count = vg.lv(layer)?.segments.len();
    for seg_index in 0..seg_count {
        let area_count = vg.lv(layer)?.segments[seg_index].areas.len();
        for area_index in 0..area_count {
            if let Area::Lv { lv: target, .. } = vg.lv(layer)?.segments[seg_index].areas[area_index] {
                let target_lv = vg.lv_mut(target)?;
                for back in target_lv.segs_using_this_lv.iter_mut() {
                    if back.lv == lv_h && back.seg_index == seg_index {
                        back.lv = layer;
                    }
                }
            }
            if let Area::Pv { pv_seg, .. } = vg.lv(layer)?.segments[seg_index].areas[area_index] {
                if let Some(pv) = vg.pvs.get_mut(pv_seg.pv) {
                    if let Some(slot) = pv.segments.get_mut(pv_seg.seg_index) {
                        if let crate::model::pv::PvSegState::Allocated { lv, .. } = &mut slot.state {
                            *lv = layer;
                        }
                    }
                }
            }
        }
    }

    let lv = vg.lv_mut(lv_h)?;
    lv.segments = vec![Segment::new(SegmentType::Striped, 0, le_count, 1, le_count)];
    lv.segments[0].areas[0] = Area::Lv { lv: layer, le_offset: 0 };
    let _ = old_uuid;

    let layer_lv = vg.lv_mut(layer)?;
    layer_lv.segs_using_this_lv.push(crate::model::segment::SegId { lv: lv_h, seg_index: 0 });

    Ok(layer)
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::model::pv::Pv;

    fn vg_with_pv(pe_count: u64) -> (Vg, crate::model::segment::PvHandle) {
        let mut vg = Vg::new(Uuid::new_v4(), "vg0".into(), 8192);
        let pv = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv0".into(), "/dev/sda".into(), 8192, 2048, pe_count));
        (vg, pv)
    }

    #[test]
    fn extend_then_reduce_returns_to_empty() {
        let (mut vg, _pv) = vg_with_pv(100);
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let ctx = CoreContext::default();

        lv_extend(&mut vg, &ctx, lv, SegmentType::Striped, 20, 1, 0, AllocPolicy::Normal).unwrap();
        assert_eq!(vg.lv(lv).unwrap().le_count, 20);

        lv_reduce(&mut vg, lv, 5).unwrap();
        assert_eq!(vg.lv(lv).unwrap().le_count, 15);
        assert!(vg.check_lv_segments(lv).is_ok());

        lv_reduce(&mut vg, lv, 15).unwrap();
        assert_eq!(vg.lv(lv).unwrap().le_count, 0);
        assert_eq!(vg.pv(_pv).unwrap().free_count(), 100);
    }

    #[test]
    fn rename_rejects_collision() {
        let (mut vg, _pv) = vg_with_pv(10);
        let a = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "a".into(), 0));
        let _b = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "b".into(), 0));
        assert!(lv_rename(&mut vg, a, "b").is_err());
        assert!(lv_rename(&mut vg, a, "c").is_ok());
        assert_eq!(vg.lv(a).unwrap().name, "c");
    }

    #[test]
    fn insert_layer_moves_segments_and_preserves_size() {
        let (mut vg, pv) = vg_with_pv(50);
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let ctx = CoreContext::default();
        lv_extend(&mut vg, &ctx, lv, SegmentType::Striped, 10, 1, 0, AllocPolicy::Normal).unwrap();

        let layer = insert_layer_for_lv(&mut vg, lv, "lv0_mimage").unwrap();
        assert_eq!(vg.lv(lv).unwrap().segments.len(), 1);
        assert_eq!(vg.lv(lv).unwrap().le_count, 10);
        assert_eq!(vg.lv(layer).unwrap().le_count, 10);
        assert!(vg.check_lv_segments(lv).is_ok());
        assert!(vg.check_lv_segments(layer).is_ok());
        let _ = pv;
    }

    #[test]
    fn mirror_extend_grows_a_private_log_lv() {
        let (mut vg, _pv) = vg_with_pv(50);
        let ctx = CoreContext::default();
        let data = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "data".into(), 0));
        lv_extend(&mut vg, &ctx, data, SegmentType::Mirror, 10, 1, 0, AllocPolicy::Normal).unwrap();

        let seg = &vg.lv(data).unwrap().segments[0];
        assert!(seg.region_size.is_some());
        assert_eq!(seg.meta_areas.len(), 1);
        assert!(seg.meta_areas[0].is_assigned());
    }

    #[test]
    fn remove_with_dependencies_takes_private_log_with_it() {
        let (mut vg, _pv) = vg_with_pv(50);
        let ctx = CoreContext::default();
        let data = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "data".into(), 0));
        lv_extend(&mut vg, &ctx, data, SegmentType::Mirror, 10, 1, 0, AllocPolicy::Normal).unwrap();

        let log = match vg.lv(data).unwrap().segments[0].meta_areas[0] {
            Area::Lv { lv, .. } => lv,
            _ => panic!("mirror segment has no private log LV"),
        };

        lv_remove_with_dependencies(&mut vg, data).unwrap();
        assert!(vg.lv(data).is_err());
        assert!(vg.lv(log).is_err());
    }
}
