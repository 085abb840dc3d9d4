// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Whole-VG invariant checking (spec §3). Every mutating operation in
//! `vg.rs` keeps these true by construction; this module exists to
//! assert that after a sequence of operations (and, more importantly,
//! after decoding a VG from on-disk metadata) they still hold.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::model::lv::LvStatus;
use crate::model::pv::PvSegState;
use crate::model::segment::{Area, LvHandle, SegId, SegmentType};
use crate::model::vg::Vg;

/// Run every structural invariant over the whole VG. Returns the first
/// violation found; callers that want all of them should not treat
/// this as exhaustive.
pub fn validate(vg: &Vg) -> Result<()> {
    for (lv_h, _) in vg.lvs.iter() {
        validate_lv(vg, lv_h)?;
    }

    for (pv_h, pv) in vg.pvs.iter() {
        let mut covered = 0u64;
        let mut prev_end = 0u64;
        for seg in &pv.segments {
            if seg.pe_start != prev_end {
                return Err(Error::validation(format!(
                    "PV {} ({}): segment gap at extent {}",
                    pv.name, pv.uuid, prev_end
                )));
            }
            prev_end = seg.end();
            covered += seg.pe_len;
            if let PvSegState::Allocated { lv, seg_index, .. } = seg.state {
                if vg.lvs.get(lv).is_none() {
                    return Err(Error::validation(format!(
                        "PV {}: allocated segment references an LV that does not exist",
                        pv.name
                    )));
                }
                if vg.lvs.get(lv).and_then(|l| l.segments.get(seg_index)).is_none() {
                    return Err(Error::validation(format!(
                        "PV {}: allocated segment references out-of-range LV segment index {}",
                        pv.name, seg_index
                    )));
                }
            }
        }
        if prev_end != pv.pe_count {
            return Err(Error::validation(format!(
                "PV {} ({}): segments cover {} of {} extents",
                pv.name, pv.uuid, prev_end, pv.pe_count
            )));
        }
        if covered != pv.pe_count {
            return Err(Error::internal("PV segment coverage sum mismatch"));
        }
        let _ = pv_h;
    }

    check_back_references(vg)?;
    Ok(())
}

/// Devices of a single RAID array the allocator/target builder must
/// stay within (spec §3 invariant 6), per `merge.c`'s
/// `DEFAULT_RAID_MAX_IMAGES` check.
const DEFAULT_RAID_MAX_IMAGES: u32 = 64;

/// Run every per-LV invariant from spec §3 (1, 2, 5, 6, 7, 8) against
/// one LV. `validate` calls this for every LV in the VG;
/// `Vg::check_lv_segments` calls it directly for a single LV.
pub fn validate_lv(vg: &Vg, lv_h: LvHandle) -> Result<()> {
    let lv = vg.lv(lv_h)?;

    if !lv.segments_partition_cleanly() {
        return Err(Error::validation(format!(
            "LV {} ({}): segments do not partition [0, {})",
            lv.name, lv.uuid, lv.le_count
        )));
    }

    for (i, seg) in lv.segments.iter().enumerate() {
        if seg.ty.area_len_equals_len() {
            if seg.area_len != seg.len {
                return Err(Error::validation(format!(
                    "LV {} segment {}: area_len {} != len {} for non-striped segment",
                    lv.name, i, seg.area_len, seg.len
                )));
            }
        } else if seg.area_len * u64::from(seg.area_count) != seg.len {
            return Err(Error::validation(format!(
                "LV {} segment {}: area_len {} * area_count {} != len {}",
                lv.name, i, seg.area_len, seg.area_count, seg.len
            )));
        }
        if seg.areas.len() != seg.area_count as usize {
            return Err(Error::validation(format!(
                "LV {} segment {}: areas.len() {} != area_count {}",
                lv.name, i, seg.areas.len(), seg.area_count
            )));
        }
        for area in seg.areas.iter().chain(seg.meta_areas.iter()) {
            match area {
                Area::Pv { pv_seg, .. } => {
                    if vg.pvs.get(pv_seg.pv).is_none() {
                        return Err(Error::validation(format!(
                            "LV {} segment {}: area references a PV that does not exist",
                            lv.name, i
                        )));
                    }
                }
                Area::Lv { lv: target, .. } => {
                    if vg.lvs.get(*target).is_none() {
                        return Err(Error::validation(format!(
                            "LV {} segment {}: area references an LV that does not exist",
                            lv.name, i
                        )));
                    }
                }
                Area::Unassigned => {}
            }
        }

        if let SegmentType::Raid(level) = &seg.ty {
            if seg.area_count < level.min_area_count() || seg.area_count > DEFAULT_RAID_MAX_IMAGES {
                return Err(Error::validation(format!(
                    "LV {} segment {}: raid area_count {} outside [{}, {}] for {:?}",
                    lv.name, i, seg.area_count, level.min_area_count(), DEFAULT_RAID_MAX_IMAGES, level
                )));
            }
            if let Some(region_size) = seg.region_size {
                if region_size == 0 || region_size & (region_size - 1) != 0 {
                    return Err(Error::validation(format!(
                        "LV {} segment {}: raid region_size {} is not a power of two",
                        lv.name, i, region_size
                    )));
                }
            }
            if seg.extents_copied > seg.area_len {
                return Err(Error::validation(format!(
                    "LV {} segment {}: extents_copied {} exceeds area_len {}",
                    lv.name, i, seg.extents_copied, seg.area_len
                )));
            }
        }

        if matches!(seg.ty, SegmentType::ThinPool) {
            check_thin_pool_sub_lvs(vg, &lv.name, seg)?;
        }

        if matches!(seg.ty, SegmentType::Snapshot) {
            let origin = seg.areas.first();
            let cow = seg.meta_areas.first();
            if let (Some(Area::Lv { lv: origin_lv, .. }), Some(Area::Lv { lv: cow_lv, .. })) = (origin, cow) {
                if origin_lv == cow_lv {
                    return Err(Error::validation(format!(
                        "LV {} segment {}: snapshot origin and cow refer to the same LV",
                        lv.name, i
                    )));
                }
            }
        }
    }

    check_role_flags(lv)?;
    Ok(())
}

/// Invariant 7: an LV whose status carries a role flag has exactly one
/// segment of the matching segment type.
fn check_role_flags(lv: &crate::model::lv::Lv) -> Result<()> {
    let roles: [(LvStatus, fn(&SegmentType) -> bool); 6] = [
        (LvStatus::THIN_POOL, |t| matches!(t, SegmentType::ThinPool)),
        (LvStatus::THIN_VOLUME, |t| matches!(t, SegmentType::Thin)),
        (LvStatus::SNAPSHOT, |t| matches!(t, SegmentType::Snapshot)),
        (LvStatus::MIRROR_IMAGE, |t| matches!(t, SegmentType::Striped)),
        (LvStatus::RAID_IMAGE, |t| matches!(t, SegmentType::Striped)),
        (LvStatus::RAID_META, |t| matches!(t, SegmentType::Striped)),
    ];
    for (flag, matches_role) in roles {
        if !lv.status.contains(flag) {
            continue;
        }
        let matching = lv.segments.iter().filter(|s| matches_role(&s.ty)).count();
        if lv.segments.len() != 1 || matching != 1 {
            return Err(Error::validation(format!(
                "LV {}: status {:?} requires exactly one matching segment, found {} of {}",
                lv.name, flag, matching, lv.segments.len()
            )));
        }
    }
    Ok(())
}

/// Invariant 5: a thin pool's data and metadata sub-LVs each have
/// exactly one segment whose single LV-area points back to the pool,
/// and are named `<pool>_tdata`/`<pool>_tmeta`.
fn check_thin_pool_sub_lvs(vg: &Vg, pool_name: &str, seg: &crate::model::segment::Segment) -> Result<()> {
    let data_lv = match seg.areas.first() {
        Some(Area::Lv { lv, .. }) => *lv,
        _ => return Err(Error::validation(format!("thin pool {}: data area is not LV-backed", pool_name))),
    };
    let meta_lv = match seg.meta_areas.first() {
        Some(Area::Lv { lv, .. }) => *lv,
        _ => return Err(Error::validation(format!("thin pool {}: metadata area is not LV-backed", pool_name))),
    };

    let data = vg.lv(data_lv)?;
    if data.segments.len() != 1 {
        return Err(Error::validation(format!("thin pool {}: data sub-LV has more than one segment", pool_name)));
    }
    if !data.name.ends_with("_tdata") {
        return Err(Error::validation(format!("thin pool {}: data sub-LV name {} lacks _tdata suffix", pool_name, data.name)));
    }

    let meta = vg.lv(meta_lv)?;
    if meta.segments.len() != 1 {
        return Err(Error::validation(format!("thin pool {}: metadata sub-LV has more than one segment", pool_name)));
    }
    if !meta.name.ends_with("_tmeta") {
        return Err(Error::validation(format!("thin pool {}: metadata sub-LV name {} lacks _tmeta suffix", pool_name, meta.name)));
    }
    Ok(())
}

/// Every `Area::Lv` in any segment's `areas` or `meta_areas` must have
/// a matching entry in the target LV's `segs_using_this_lv`, and vice
/// versa (spec §3 invariant 4).
fn check_back_references(vg: &Vg) -> Result<()> {
    let mut expected: HashMap<LvHandle, Vec<SegId>> = HashMap::new();
    for (lv_h, lv) in vg.lvs.iter() {
        for (i, seg) in lv.segments.iter().enumerate() {
            for area in seg.areas.iter().chain(seg.meta_areas.iter()) {
                if let Area::Lv { lv: target, .. } = area {
                    expected.entry(*target).or_default().push(SegId { lv: lv_h, seg_index: i });
                }
            }
        }
    }

    for (lv_h, lv) in vg.lvs.iter() {
        let mut want = expected.remove(&lv_h).unwrap_or_default();
        let mut have = lv.segs_using_this_lv.clone();
        want.sort_by_key(|s| (s.lv.index(), s.seg_index));
        have.sort_by_key(|s| (s.lv.index(), s.seg_index));
        if want != have {
            return Err(Error::validation(format!(
                "LV {}: segs_using_this_lv does not match the areas that actually reference it",
                lv.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::model::lv::Lv;
    use crate::model::pv::Pv;
    use crate::model::segment::{Segment, SegmentType};
    use crate::model::vg::Vg;

    #[test]
    fn clean_vg_validates() {
        let mut vg = Vg::new(Uuid::new_v4(), "vg0".into(), 8192);
        let pv = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv0".into(), "/dev/sda".into(), 8192, 2048, 100));
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let seg_id = vg.alloc_lv_segment(lv, Segment::new(SegmentType::Striped, 0, 10, 1, 10)).unwrap();
        vg.set_lv_segment_area_pv(seg_id, 0, pv, 0).unwrap();
        assert!(validate(&vg).is_ok());
    }

    #[test]
    fn back_reference_mismatch_is_caught() {
        let mut vg = Vg::new(Uuid::new_v4(), "vg0".into(), 8192);
        let data = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "data".into(), 10));
        let log = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "log".into(), 1));
        let seg_id = vg.alloc_lv_segment(data, Segment::new(SegmentType::Mirror, 0, 10, 1, 10)).unwrap();
        vg.set_lv_segment_area_lv(seg_id, 0, log, 0).unwrap();
        assert!(validate(&vg).is_ok());

        vg.lvs.get_mut(log).unwrap().segs_using_this_lv.clear();
        assert!(validate(&vg).is_err());
    }
}
