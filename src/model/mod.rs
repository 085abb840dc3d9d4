// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The metadata model: volume groups, physical and logical volumes,
//! segments and areas (spec §3).

pub mod arena;
pub mod lv;
pub mod pv;
pub mod segment;
pub mod validate;
pub mod vg;

pub use lv::{Lv, LvStatus};
pub use pv::{Pv, PvSegState, PvSegment};
pub use segment::{Area, LvHandle, PvHandle, PvSegId, RaidLevel, Segment, SegId, SegmentType, ThinMessage};
pub use validate::validate;
pub use vg::Vg;
