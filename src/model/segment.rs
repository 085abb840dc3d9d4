// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! LV segments, areas and the closed set of segment types (spec §3).
//!
//! The source dispatches on segtype through function-pointer tables
//! (`segtype->ops->merge_segments`, ...). Per spec §9 ("Variadic type
//! dispatch on segtype") this is a closed enum instead, so every
//! `match` over segment kind in the allocator and target-tree builder
//! is exhaustiveness-checked by the compiler.

use std::collections::VecDeque;

use crate::model::arena::Handle;
use crate::model::lv::Lv;
use crate::model::pv::Pv;

pub type LvHandle = Handle<Lv>;
pub type PvHandle = Handle<Pv>;

/// Identifies one area slot of one segment of one LV.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SegId {
    pub lv: LvHandle,
    pub seg_index: usize,
}

/// Identifies one PV segment within a PV's segment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PvSegId {
    pub pv: PvHandle,
    pub seg_index: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLevel {
    Raid1,
    Raid4,
    Raid5,
    Raid6,
    Raid10,
}

impl RaidLevel {
    /// Devices dedicated to parity for a full-array create (spec §4.2).
    pub fn parity_devs(self) -> u32 {
        match self {
            RaidLevel::Raid1 | RaidLevel::Raid10 => 0,
            RaidLevel::Raid4 | RaidLevel::Raid5 => 1,
            RaidLevel::Raid6 => 2,
        }
    }

    /// Minimum `area_count` this level may be created with (spec §3
    /// invariant 6).
    pub fn min_area_count(self) -> u32 {
        match self {
            RaidLevel::Raid1 => 2,
            RaidLevel::Raid4 | RaidLevel::Raid5 => 2,
            RaidLevel::Raid6 => 5,
            RaidLevel::Raid10 => 4,
        }
    }

    pub fn dm_target_name(self) -> &'static str {
        match self {
            RaidLevel::Raid1 => "raid1",
            RaidLevel::Raid4 => "raid4",
            RaidLevel::Raid5 => "raid5_ls",
            RaidLevel::Raid6 => "raid6_zr",
            RaidLevel::Raid10 => "raid10",
        }
    }
}

/// A thin pool message queued for submission after resume (spec §4.4
/// "Post-resume messages").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThinMessage {
    CreateThin { device_id: u32 },
    CreateSnap { device_id: u32, origin_id: u32 },
    Delete { device_id: u32 },
    Trim { device_id: u32 },
    SetTransactionId { old: u64, new: u64 },
}

impl ThinMessage {
    /// The errno the kernel's response is tolerated against (spec §4.4,
    /// §7 "transient kernel failure").
    pub fn expected_errno(&self) -> Option<i32> {
        match self {
            ThinMessage::CreateThin { .. } => Some(libc::EEXIST),
            ThinMessage::Delete { .. } => Some(libc::ENODATA),
            _ => None,
        }
    }
}

/// The closed set of segment kinds (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentType {
    /// `stripes == 1` is the degenerate "linear" case.
    Striped,
    Mirror,
    Raid(RaidLevel),
    SnapshotOrigin,
    Snapshot,
    SnapshotMerge,
    ThinPool,
    Thin,
    Cache,
    Zero,
    Error,
    Crypt { cipher: String },
    Replicator,
    ReplicatorDev,
}

impl SegmentType {
    pub fn is_virtual(&self) -> bool {
        matches!(self, SegmentType::Zero | SegmentType::Error)
    }

    /// True for segment types that own exactly one area per position
    /// (as opposed to striped, where `area_len * area_count == len`).
    pub fn area_len_equals_len(&self) -> bool {
        !matches!(self, SegmentType::Striped | SegmentType::Mirror | SegmentType::Raid(_))
    }
}

/// One discriminated-union area of a segment (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Area {
    Unassigned,
    Pv { pv_seg: PvSegId, pe_offset: u64 },
    Lv { lv: LvHandle, le_offset: u64 },
}

impl Area {
    pub fn is_assigned(&self) -> bool {
        !matches!(self, Area::Unassigned)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AreaStatus: u32 {
        const RAID_META = 0b0000_0001;
    }
}

/// One contiguous run of logical extents within an LV (spec §3).
#[derive(Debug, Clone)]
pub struct Segment {
    pub ty: SegmentType,
    pub le: u64,
    pub len: u64,
    pub area_count: u32,
    pub area_len: u64,
    pub areas: Vec<Area>,
    /// An auxiliary LV-or-PV-backed area alongside `areas`: RAID's
    /// per-image metadata devices (parallel to `areas`, one per data
    /// image), a mirror's dirty-log LV, a thin pool's metadata LV, or
    /// a snapshot's COW store / merge target. Which of these applies
    /// is determined by `ty`; unused for segment types that need none.
    pub meta_areas: Vec<Area>,

    pub stripe_size: Option<u64>,
    pub chunk_size: Option<u64>,
    pub region_size: Option<u64>,
    pub extents_copied: u64,
    /// One bit per image that needs a rebuild (spec §4.4, raid target line).
    pub rebuilds: u64,

    pub transaction_id: u64,
    pub device_id: Option<u32>,
    pub thin_messages: VecDeque<ThinMessage>,
}

impl Segment {
    pub fn new(ty: SegmentType, le: u64, len: u64, area_count: u32, area_len: u64) -> Self {
        Segment {
            ty,
            le,
            len,
            area_count,
            area_len,
            areas: vec![Area::Unassigned; area_count as usize],
            meta_areas: Vec::new(),
            stripe_size: None,
            chunk_size: None,
            region_size: None,
            extents_copied: 0,
            rebuilds: 0,
            transaction_id: 0,
            device_id: None,
            thin_messages: VecDeque::new(),
        }
    }

    pub fn end_le(&self) -> u64 {
        self.le + self.len
    }

    /// Every PV this segment, directly, draws extents from (spec:
    /// used by `pv_remove`'s "PV in use by LV" check and by the
    /// allocator's `parallel_areas` avoidance).
    pub fn pv_dependencies(&self) -> impl Iterator<Item = PvHandle> + '_ {
        self.areas.iter().chain(self.meta_areas.iter()).filter_map(|a| match a {
            Area::Pv { pv_seg, .. } => Some(pv_seg.pv),
            _ => None,
        })
    }
}
