// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! On-disk format decoders for the metadata this crate needs to read
//! back out of segment types it doesn't itself own the layout of:
//! the dm-raid superblock written to an `rmeta` sub-LV, and the VDO
//! geometry block written to the start of a VDO backend (spec §5).

pub mod raid_sb;
pub mod vdo_geom;

pub use raid_sb::RaidSuperblock;
pub use vdo_geom::{VdoComponent, VdoVolumeGeometry};
