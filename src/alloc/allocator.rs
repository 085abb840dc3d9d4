// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The extent allocator (spec §4.2): walks the policy ladder, places
//! each parallel area of a new segment on a free PV run, and reports
//! back exactly where so the caller can commit it through
//! `Vg::set_lv_segment_area_pv`.
//!
//! This module only *chooses* placements; it never mutates the VG.
//! Committing a chosen `AllocResult` is always a separate, explicit
//! step so a caller can inspect (or reject) a plan before extents are
//! actually marked allocated.

use crate::alloc::policy::AllocPolicy;
use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::model::pv::Pv;
use crate::model::segment::{LvHandle, PvHandle, SegmentType};
use crate::model::vg::Vg;

/// A request to place one new segment's worth of parallel areas.
#[derive(Clone)]
pub struct AllocRequest {
    pub ty: SegmentType,
    /// Number of striped/mirrored/raid-data areas, excluding parity.
    pub area_count: u32,
    /// RAID parity areas (0 for everything else); see `RaidLevel::parity_devs`.
    pub parity_count: u32,
    /// Extents needed in each area.
    pub area_len: u64,
    pub policy: AllocPolicy,
    /// The LV being extended; drives CLING's "already in use" PV set.
    pub lv: LvHandle,
    /// Restrict placement to these PVs only, if given (the `--alloc`
    /// `vgextend`-style PV list on the command line).
    pub allowed_pvs: Option<Vec<PvHandle>>,
    /// PVs already in use by a sibling area of the segment this
    /// request is building (as opposed to `lv`'s whole history) that
    /// must not be reused — pvmove's source PV, or a mirror image
    /// already placed earlier in the same `lv_extend` call.
    pub parallel_areas: Vec<PvHandle>,
    /// Region size of the mirror log this request must also allocate,
    /// if any. When set, `allocate` places one extra area sized by
    /// `mirror_log_extents` alongside the data areas.
    pub log_region_size: Option<u64>,
}

/// A single chosen placement: `area_count + parity_count` entries, in
/// the order `set_lv_segment_area_pv` should assign them (data areas
/// first, then parity/meta areas).
pub struct AllocResult {
    pub policy_used: AllocPolicy,
    pub areas: Vec<(PvHandle, u64)>,
}

/// Data extents needed to store a mirror log covering `data_extents`
/// extents of `extent_size` sectors each, given `region_size` sectors
/// per dirty-region bit. One bit per region, rounded up to a whole
/// extent, plus the one-sector log header (spec §4.2, mirror log
/// sizing formula).
pub fn mirror_log_extents(data_extents: u64, extent_size: u64, region_size: u64) -> u64 {
    let data_sectors = data_extents * extent_size;
    let regions = data_sectors.div_ceil(region_size.max(1));
    let bitset_bytes = regions.div_ceil(8);
    let log_sectors = 1 + bitset_bytes.div_ceil(512);
    log_sectors.div_ceil(extent_size.max(1))
}

/// Total extents a request will consume across every area, including
/// RAID parity, the `area_multiple` factor that parallel areas impose,
/// and (if requested) a mirror log (spec §4.2).
pub fn total_extents_required(req: &AllocRequest, extent_size: u64) -> u64 {
    let data = req.area_len * u64::from(req.area_count + req.parity_count);
    let log = req.log_region_size.map(|rs| mirror_log_extents(req.area_len, extent_size, rs)).unwrap_or(0);
    data + log
}

struct FreeRun {
    pv: PvHandle,
    pe_start: u64,
    len: u64,
}

fn collect_free_runs(vg: &Vg, allowed: Option<&[PvHandle]>) -> Vec<FreeRun> {
    let mut runs = Vec::new();
    for (pv_h, pv) in vg.pvs.iter() {
        if let Some(allowed) = allowed {
            if !allowed.contains(&pv_h) {
                continue;
            }
        }
        for (pe_start, len, _idx) in pv.free_runs() {
            runs.push(FreeRun { pv: pv_h, pe_start, len });
        }
    }
    runs
}

/// Whether `pv` already carries an area of the LV being extended
/// (CLING's candidate set) or shares a configured tag with one
/// (CLING_BY_TAGS). Plain CLING only looks at the trailing segment's
/// PVs; `ctx.maximise_cling` widens the check to the LV's entire
/// history.
fn pv_is_cling_candidate(vg: &Vg, ctx: &CoreContext, req: &AllocRequest, pv: PvHandle, by_tags: bool) -> bool {
    let Ok(lv) = vg.lv(req.lv) else { return false };
    let used: Vec<PvHandle> = if ctx.maximise_cling {
        lv.pv_dependencies().collect()
    } else {
        lv.segments.last().map(|s| s.pv_dependencies().collect()).unwrap_or_default()
    };
    if used.contains(&pv) {
        return true;
    }
    if !by_tags || ctx.cling_tag_list.is_empty() {
        return false;
    }
    let Ok(candidate) = vg.pv(pv) else { return false };
    used.iter()
        .filter_map(|h| vg.pv(*h).ok())
        .any(|used_pv| cling_tags_match(ctx, used_pv, candidate))
}

/// `CLING_BY_TAGS` tag rule (spec §4.2): for a configured `@TAG` entry
/// both PVs must carry `TAG`; the wildcard `@*` matches if the two PVs
/// share any tag at all.
fn cling_tags_match(ctx: &CoreContext, a: &Pv, b: &Pv) -> bool {
    ctx.cling_tag_list.iter().any(|entry| match entry.as_str() {
        "@*" => a.tags.iter().any(|t| b.has_tag(t)),
        entry => match entry.strip_prefix('@') {
            Some(tag) => a.has_tag(tag) && b.has_tag(tag),
            None => false,
        },
    })
}

/// Try to satisfy `req` under exactly one policy, with no fallback.
/// `Inherit` is resolved against `ctx.default_policy` before this is
/// ever called.
fn try_policy(vg: &Vg, ctx: &CoreContext, req: &AllocRequest, policy: AllocPolicy) -> Result<Vec<(PvHandle, u64)>> {
    let allowed: Option<&[PvHandle]> = req.allowed_pvs.as_deref();
    let mut runs = collect_free_runs(vg, allowed);

    if !policy.allows_shared_pv_across_areas() && !req.parallel_areas.is_empty() {
        runs.retain(|r| !req.parallel_areas.contains(&r.pv));
    }

    if policy == AllocPolicy::Contiguous {
        let lv = vg.lv(req.lv)?;
        let last = lv.segments.last().ok_or_else(|| Error::validation("CONTIGUOUS requires an existing segment to extend"))?;
        let (pv, end_offset) = match last.areas.first() {
            Some(crate::model::segment::Area::Pv { pv_seg, pe_offset }) => {
                let pv_segment_len = vg
                    .pv(pv_seg.pv)?
                    .segments
                    .get(pv_seg.seg_index)
                    .ok_or_else(|| Error::internal("dangling PV segment index"))?
                    .pe_len;
                (pv_seg.pv, pe_offset + pv_segment_len)
            }
            _ => return Err(Error::validation("CONTIGUOUS requires the LV's last area to be PV-backed")),
        };
        runs.retain(|r| r.pv == pv && r.pe_start == end_offset);
    } else if matches!(policy, AllocPolicy::Cling | AllocPolicy::ClingByTags) {
        let by_tags = policy == AllocPolicy::ClingByTags;
        runs.retain(|r| pv_is_cling_candidate(vg, ctx, req, r.pv, by_tags));
    }

    let total_areas = (req.area_count + req.parity_count) as usize;
    let allow_shared = policy.allows_shared_pv_across_areas() || total_areas == 1;
    let mut used_pvs: Vec<PvHandle> = Vec::new();
    let mut chosen = Vec::with_capacity(total_areas);

    for _ in 0..total_areas {
        let pick = runs
            .iter()
            .position(|r| r.len >= req.area_len && (allow_shared || !used_pvs.contains(&r.pv)))
            .ok_or_else(|| Error::AllocFailed {
                policy,
                reason: "not enough distinct PVs with free space for every parallel area".into(),
            })?;
        let run = &mut runs[pick];
        chosen.push((run.pv, run.pe_start));
        used_pvs.push(run.pv);
        run.pe_start += req.area_len;
        run.len -= req.area_len;
        if run.len == 0 {
            runs.remove(pick);
        }
    }

    Ok(chosen)
}

/// Walk the policy ladder starting at `req.policy` (resolving
/// `Inherit` against `ctx.default_policy` first). If
/// `ctx.maximise_cling` is set, a failure at one rung falls through to
/// the next looser one; otherwise the first failure is final (spec
/// §4.2).
pub fn allocate(vg: &Vg, ctx: &CoreContext, req: &AllocRequest) -> Result<AllocResult> {
    let mut policy = if req.policy == AllocPolicy::Inherit { ctx.default_policy } else { req.policy };

    let needed = total_extents_required(req, vg.extent_size);
    let free_total: u64 = vg.pvs.iter().map(|(_, pv)| pv.free_count()).sum();
    if free_total < needed {
        return Err(Error::AllocFailed {
            policy,
            reason: format!("insufficient free space in VG: need {} extents, have {}", needed, free_total),
        });
    }

    loop {
        match try_policy(vg, ctx, req, policy) {
            Ok(mut areas) => {
                if let Some(region_size) = req.log_region_size {
                    let log_len = mirror_log_extents(req.area_len, vg.extent_size, region_size);
                    let data_pvs: Vec<PvHandle> = areas.iter().map(|(pv, _)| *pv).collect();
                    match allocate_log_area(vg, ctx, req, policy, log_len, &data_pvs) {
                        Ok(log_area) => areas.push(log_area),
                        Err(e) => return Err(e),
                    }
                }
                return Ok(AllocResult { policy_used: policy, areas });
            }
            Err(e) if ctx.maximise_cling => match policy.next_looser() {
                Some(AllocPolicy::ClingByTags) if ctx.cling_tag_list.is_empty() => {
                    policy = AllocPolicy::ClingByTags.next_looser().expect("ClingByTags always has a looser rung");
                }
                Some(next) => policy = next,
                None => return Err(e),
            },
            Err(e) => return Err(e),
        }
    }
}

/// Place the one extra area a mirror/RAID log needs, excluding the
/// data PVs already chosen when `ctx.mirror_logs_require_separate_pvs`
/// (spec §4.2 "avoid PVs already chosen for mirror logs").
fn allocate_log_area(
    vg: &Vg,
    ctx: &CoreContext,
    req: &AllocRequest,
    policy: AllocPolicy,
    log_len: u64,
    data_pvs: &[PvHandle],
) -> Result<(PvHandle, u64)> {
    let mut parallel_areas = req.parallel_areas.clone();
    if ctx.mirror_logs_require_separate_pvs {
        parallel_areas.extend(data_pvs.iter().copied());
    }
    let log_req = AllocRequest {
        ty: req.ty.clone(),
        area_count: 1,
        parity_count: 0,
        area_len: log_len,
        policy,
        lv: req.lv,
        allowed_pvs: req.allowed_pvs.clone(),
        parallel_areas,
        log_region_size: None,
    };
    try_policy(vg, ctx, &log_req, policy).map(|areas| areas[0])
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::model::lv::Lv;
    use crate::model::pv::Pv;

    fn vg_with_two_pvs() -> (Vg, PvHandle, PvHandle) {
        let mut vg = Vg::new(Uuid::new_v4(), "vg0".into(), 8192);
        let a = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv0".into(), "/dev/sda".into(), 8192, 2048, 50));
        let b = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv1".into(), "/dev/sdb".into(), 8192, 2048, 50));
        (vg, a, b)
    }

    #[test]
    fn normal_policy_spreads_striped_areas_across_pvs() {
        let (mut vg, pv_a, pv_b) = vg_with_two_pvs();
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let ctx = CoreContext::default();
        let req = AllocRequest {
            ty: SegmentType::Striped,
            area_count: 2,
            parity_count: 0,
            area_len: 10,
            policy: AllocPolicy::Normal,
            lv,
            allowed_pvs: None,
            parallel_areas: Vec::new(),
            log_region_size: None,
        };
        let result = allocate(&vg, &ctx, &req).unwrap();
        assert_eq!(result.areas.len(), 2);
        let pvs_used: Vec<PvHandle> = result.areas.iter().map(|(pv, _)| *pv).collect();
        assert!(pvs_used.contains(&pv_a));
        assert!(pvs_used.contains(&pv_b));
    }

    #[test]
    fn insufficient_space_fails_fast_without_walking_the_ladder() {
        let (mut vg, _pv_a, _pv_b) = vg_with_two_pvs();
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let ctx = CoreContext::default();
        let req = AllocRequest {
            ty: SegmentType::Striped,
            area_count: 1,
            parity_count: 0,
            area_len: 1000,
            policy: AllocPolicy::Normal,
            lv,
            allowed_pvs: None,
            parallel_areas: Vec::new(),
            log_region_size: None,
        };
        let err = allocate(&vg, &ctx, &req).unwrap_err();
        assert!(matches!(err, Error::AllocFailed { .. }));
    }

    #[test]
    fn mirror_log_size_is_at_least_one_extent() {
        assert!(mirror_log_extents(1000, 8192, 2 * 1024 * 1024 / 512) >= 1);
    }

    #[test]
    fn mirror_create_lands_the_log_on_a_third_pv() {
        let mut vg = Vg::new(Uuid::new_v4(), "vg0".into(), 8192);
        let a = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv0".into(), "/dev/sda".into(), 8192, 2048, 50));
        let b = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv1".into(), "/dev/sdb".into(), 8192, 2048, 50));
        let c = vg.pvs.alloc(Pv::new(Uuid::new_v4(), "pv2".into(), "/dev/sdc".into(), 8192, 2048, 50));
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let ctx = CoreContext::default();
        let req = AllocRequest {
            ty: SegmentType::Mirror,
            area_count: 2,
            parity_count: 0,
            area_len: 10,
            policy: AllocPolicy::Normal,
            lv,
            allowed_pvs: None,
            parallel_areas: Vec::new(),
            log_region_size: Some(512 * 1024 / 512),
        };
        let result = allocate(&vg, &ctx, &req).unwrap();
        assert_eq!(result.areas.len(), 3);
        let pvs_used: Vec<PvHandle> = result.areas.iter().map(|(pv, _)| *pv).collect();
        assert!(pvs_used.contains(&a));
        assert!(pvs_used.contains(&b));
        assert!(pvs_used.contains(&c));
    }

    #[test]
    fn parallel_areas_are_excluded_from_a_fresh_placement() {
        let (mut vg, pv_a, pv_b) = vg_with_two_pvs();
        let lv = vg.lvs.alloc(Lv::new(Uuid::new_v4(), "lv0".into(), 0));
        let ctx = CoreContext::default();
        let req = AllocRequest {
            ty: SegmentType::Striped,
            area_count: 1,
            parity_count: 0,
            area_len: 10,
            policy: AllocPolicy::Normal,
            lv,
            allowed_pvs: None,
            parallel_areas: vec![pv_a],
            log_region_size: None,
        };
        let result = allocate(&vg, &ctx, &req).unwrap();
        assert_eq!(result.areas[0].0, pv_b);
    }
}
