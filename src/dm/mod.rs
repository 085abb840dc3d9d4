// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The device-mapper target-tree builder (spec §4.4, §6).
//!
//! A VG's active LVs form a DAG of kernel devices: a mirror's top-level
//! device depends on its images and its log, a thin LV depends on its
//! pool, and so on. `DmTree` holds that DAG with each node's believed
//! kernel state; `activate`/`deactivate` walk it in the order the
//! kernel requires (children before parents for create/load/resume,
//! parents before children for suspend/remove) and drive a [`Task`]
//! to actually issue the ioctls.
//!
//! `Task` is the seam: production code drives the real kernel through
//! the `devicemapper` crate, tests drive an in-memory fake that just
//! records what was called.

pub mod name;
pub mod target;
pub mod udev;

use std::collections::{HashMap, HashSet};

use crate::context::CoreContext;
use crate::error::{Error, Result};
use crate::model::segment::{Area, LvHandle, ThinMessage};
use crate::model::vg::Vg;

/// Where a node sits in the kernel's own device lifecycle (spec §4.4,
/// "node state machine").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Absent,
    PresentInactive,
    PresentLive,
    PresentLiveAndInactiveTable,
    PresentSuspended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLine {
    pub start: u64,
    pub length: u64,
    pub target_type: String,
    pub params: String,
}

#[derive(Debug, Clone)]
pub struct DmNode {
    pub name: String,
    pub uuid: String,
    pub state: NodeState,
    pub table: Vec<TargetLine>,
    pub messages: Vec<ThinMessage>,
    children: Vec<usize>,
}

/// The DAG of kernel devices backing some subset of a VG's LVs.
#[derive(Debug, Default)]
pub struct DmTree {
    nodes: Vec<DmNode>,
    by_name: HashMap<String, usize>,
}

impl DmTree {
    pub fn new() -> Self {
        DmTree::default()
    }

    /// Add (or update, if `name` already exists) a node. `depends_on`
    /// names every device this node's table references by major:minor
    /// and must therefore exist (though not necessarily be live)
    /// before this node's table is loaded.
    pub fn add_node(&mut self, name: &str, uuid: &str, table: Vec<TargetLine>, depends_on: &[&str]) -> Result<usize> {
        let idx = if let Some(&idx) = self.by_name.get(name) {
            idx
        } else {
            let idx = self.nodes.len();
            self.nodes.push(DmNode {
                name: name.to_string(),
                uuid: uuid.to_string(),
                state: NodeState::Absent,
                table: Vec::new(),
                messages: Vec::new(),
                children: Vec::new(),
            });
            self.by_name.insert(name.to_string(), idx);
            idx
        };
        self.nodes[idx].table = table;

        let mut child_indices = Vec::with_capacity(depends_on.len());
        for dep in depends_on {
            let dep_idx = *self
                .by_name
                .get(*dep)
                .ok_or_else(|| Error::internal(format!("target tree references unknown device {}", dep)))?;
            child_indices.push(dep_idx);
        }
        self.nodes[idx].children = child_indices;
        Ok(idx)
    }

    pub fn node(&self, idx: usize) -> &DmNode {
        &self.nodes[idx]
    }

    pub fn queue_message(&mut self, idx: usize, msg: ThinMessage) {
        self.nodes[idx].messages.push(msg);
    }

    /// Every node, children before the parents that depend on them.
    /// Suitable for create/load/resume.
    pub fn children_first_order(&self) -> Vec<usize> {
        let mut visited = HashSet::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        for start in 0..self.nodes.len() {
            self.visit(start, &mut visited, &mut out);
        }
        out
    }

    fn visit(&self, idx: usize, visited: &mut HashSet<usize>, out: &mut Vec<usize>) {
        if !visited.insert(idx) {
            return;
        }
        for &child in &self.nodes[idx].children {
            self.visit(child, visited, out);
        }
        out.push(idx);
    }

    /// The reverse: parents before the children they depend on.
    /// Suitable for suspend/remove.
    pub fn parents_first_order(&self) -> Vec<usize> {
        let mut order = self.children_first_order();
        order.reverse();
        order
    }
}

/// Add the node for `lv`'s current segments to `tree`, naming it and
/// building its table via `name`/`target` (spec §4.4). Any sub-LV one
/// of `lv`'s areas references (a mirror log, a thin pool's data/meta
/// LVs, a snapshot's cow store) must already have its own node in
/// `tree` — callers walk the LV graph bottom-up, exactly as
/// `DmTree::children_first_order` later replays it against the kernel.
pub fn add_lv_node(
    tree: &mut DmTree,
    vg: &Vg,
    lv_h: LvHandle,
    ctx: &CoreContext,
    resolver: &dyn target::DeviceResolver,
) -> Result<usize> {
    let lv = vg.lv(lv_h)?;
    let dm_name = name::mangled_device_name(&vg.name, &lv.name, None);
    let dm_uuid = name::device_uuid(&vg.uuid, &lv.uuid, None);

    let mut table = Vec::with_capacity(lv.segments.len());
    for seg in &lv.segments {
        let start = seg.le * vg.extent_size;
        let length = seg.len * vg.extent_size;
        table.push(target::build_target_line(seg, ctx, vg.extent_size, start, length, resolver)?);
    }

    let mut depends_on = Vec::new();
    for seg in &lv.segments {
        for area in seg.areas.iter().chain(seg.meta_areas.iter()) {
            if let Area::Lv { lv: target_lv, .. } = area {
                let dep = vg.lv(*target_lv)?;
                let dep_name = name::mangled_device_name(&vg.name, &dep.name, None);
                if !depends_on.contains(&dep_name) {
                    depends_on.push(dep_name);
                }
            }
        }
    }
    let depends_on_refs: Vec<&str> = depends_on.iter().map(String::as_str).collect();

    tree.add_node(&dm_name, &dm_uuid, table, &depends_on_refs)
}

/// Issues the individual ioctls a tree traversal calls for. Message
/// failures report the kernel errno directly so the caller can weigh
/// it against `ThinMessage::expected_errno` (spec §7, "transient
/// kernel failure").
pub trait Task {
    fn create(&mut self, name: &str, uuid: &str) -> Result<()>;
    fn load(&mut self, name: &str, table: &[TargetLine]) -> Result<()>;
    fn suspend(&mut self, name: &str) -> Result<()>;
    fn resume(&mut self, name: &str) -> Result<()>;
    fn remove(&mut self, name: &str) -> Result<()>;
    fn message(&mut self, name: &str, msg: &ThinMessage) -> std::result::Result<(), i32>;
}

/// Bring every node in `tree` up to `PresentLive` with its current
/// table, creating devices that don't exist yet and suspending only
/// those that were already live (so a freshly-created device is
/// loaded-then-resumed without ever being suspended) (spec §4.4,
/// "traversal rules").
pub fn activate(tree: &mut DmTree, task: &mut dyn Task) -> Result<()> {
    let order = tree.children_first_order();

    for &idx in &order {
        if tree.nodes[idx].state == NodeState::Absent {
            task.create(&tree.nodes[idx].name, &tree.nodes[idx].uuid)?;
            tree.nodes[idx].state = NodeState::PresentInactive;
        }
    }

    let was_live: HashSet<usize> =
        order.iter().copied().filter(|&i| tree.nodes[i].state == NodeState::PresentLive).collect();
    for &idx in tree.parents_first_order().iter().filter(|i| was_live.contains(i)) {
        task.suspend(&tree.nodes[idx].name)?;
        tree.nodes[idx].state = NodeState::PresentSuspended;
    }

    for &idx in &order {
        let table = tree.nodes[idx].table.clone();
        task.load(&tree.nodes[idx].name, &table)?;
        tree.nodes[idx].state = NodeState::PresentLiveAndInactiveTable;
    }

    for &idx in &order {
        task.resume(&tree.nodes[idx].name)?;
        tree.nodes[idx].state = NodeState::PresentLive;
    }

    for &idx in &order {
        let messages = tree.nodes[idx].messages.clone();
        for msg in &messages {
            if let Err(errno) = task.message(&tree.nodes[idx].name, msg) {
                if msg.expected_errno() != Some(errno) {
                    return Err(Error::FatalKernel(format!(
                        "message to {} failed with errno {}",
                        tree.nodes[idx].name, errno
                    )));
                }
            }
        }
        tree.nodes[idx].messages.clear();
    }

    Ok(())
}

/// Tear every node in `tree` down, parents before the children they
/// reference, so a device is never removed while something still
/// points at it (spec §4.4).
pub fn deactivate(tree: &mut DmTree, task: &mut dyn Task) -> Result<()> {
    for idx in tree.parents_first_order() {
        if tree.nodes[idx].state != NodeState::Absent {
            task.remove(&tree.nodes[idx].name)?;
            tree.nodes[idx].state = NodeState::Absent;
        }
    }
    Ok(())
}
