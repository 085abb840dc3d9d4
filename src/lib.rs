// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core metadata model, extent allocator, and device-mapper
//! target-tree builder for an LVM-style volume manager.
//!
//! This crate has no notion of a text-format on-disk VG metadata area
//! or of a running `lvmetad`/locking daemon; it owns the in-memory VG
//! graph, the allocator that places new extents on it, and the code
//! that turns a VG into a device-mapper device tree. Callers supply
//! the VG (however they parsed or synced it) and a [`CoreContext`].

pub mod alloc;
pub mod context;
pub mod dm;
pub mod error;
pub mod format;
pub mod model;
pub mod ops;

pub use context::{CoreContext, KernelVersion};
pub use error::{Error, Result};
pub use model::{Lv, Pv, Vg};
