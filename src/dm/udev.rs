// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! udev-sync cookie handling and the node-operation log used to elide
//! no-op device-mapper calls (spec §6).
//!
//! Every ioctl that changes a device's visible state is tagged with a
//! cookie minted by `CoreContext::new_cookie`. The kernel increments a
//! System-V semaphore keyed on that cookie once per tagged change, and
//! `udevadm settle`-style callers wait on it to reach zero. If udev
//! itself is not running (containers, early boot), callers fall back
//! to `mknod`-ing the device node directly instead of waiting forever.

use std::collections::HashMap;
use std::io;

use nix::sys::stat::{mknod, Mode, SFlag};

use crate::error::{Error, Result};

bitflags::bitflags! {
    /// Bits ORed into the upper half of a udev cookie (spec §6,
    /// "Cookie flag bits"). Order and values follow the flag dump in
    /// `libdm-common.c`'s cookie logging (`DISABLE_DM_RULES` through
    /// `PRIMARY_SOURCE`, low bit to high).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CookieFlags: u16 {
        const DISABLE_DM_RULES         = 0x0001;
        const DISABLE_SUBSYSTEM_RULES  = 0x0002;
        const DISABLE_DISK_RULES       = 0x0004;
        const DISABLE_OTHER_RULES      = 0x0008;
        const LOW_PRIORITY_FLAG        = 0x0010;
        const DISABLE_LIBRARY_FALLBACK = 0x0020;
        const PRIMARY_SOURCE_FLAG      = 0x0040;
    }
}

/// Create `/dev/<dm_dir>/<name>` by hand with `mknod`, for when no
/// udev daemon is running to react to the uevent at all.
pub fn mknod_fallback(dm_dir: &str, name: &str, major: u32, minor: u32) -> Result<()> {
    let path = format!("{}/{}", dm_dir, name);
    let dev = nix::sys::stat::makedev(u64::from(major), u64::from(minor));
    mknod(path.as_str(), SFlag::S_IFBLK, Mode::from_bits_truncate(0o660), dev)?;
    Ok(())
}

/// A System-V semaphore keyed by a udev cookie (spec §6, "udev-sync
/// protocol"): the builder creates it initialised to 1, increments it
/// once per submitted operation tagged with that cookie, and waits for
/// it to reach zero once the batch is flushed. Udev's own rules
/// decrement it on completion of each rule; a `wait_for_zero` with
/// nothing ever incremented past the initial 1 would block forever, so
/// callers must `dec` once for the initial count before waiting.
pub struct UdevSemaphore {
    semid: libc::c_int,
}

impl UdevSemaphore {
    /// `semget` the semaphore for `cookie`, creating it if absent, and
    /// set its value to 1.
    pub fn create(cookie: u32) -> Result<Self> {
        let semid = unsafe { libc::semget(cookie as libc::key_t, 1, libc::IPC_CREAT | 0o600) };
        check(semid)?;
        let sem = UdevSemaphore { semid };
        sem.set_value(1)?;
        Ok(sem)
    }

    fn set_value(&self, value: libc::c_int) -> Result<()> {
        check(unsafe { libc::semctl(self.semid, 0, libc::SETVAL, value) })?;
        Ok(())
    }

    fn semop_delta(&self, delta: i16) -> Result<()> {
        let mut ops = [libc::sembuf { sem_num: 0, sem_op: delta, sem_flg: 0 }];
        check(unsafe { libc::semop(self.semid, ops.as_mut_ptr(), 1) })?;
        Ok(())
    }

    /// Increment by one submitted operation.
    pub fn inc(&self) -> Result<()> {
        self.semop_delta(1)
    }

    /// Block until the semaphore reads zero.
    pub fn wait_for_zero(&self) -> Result<()> {
        let mut ops = [libc::sembuf { sem_num: 0, sem_op: 0, sem_flg: 0 }];
        check(unsafe { libc::semop(self.semid, ops.as_mut_ptr(), 1) })?;
        Ok(())
    }

    /// Remove the semaphore set. Callers do this once the batch has
    /// settled; a leaked semaphore set otherwise outlives the process.
    pub fn remove(self) -> Result<()> {
        check(unsafe { libc::semctl(self.semid, 0, libc::IPC_RMID) })?;
        Ok(())
    }
}

fn check(rc: libc::c_int) -> Result<()> {
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

bitflags::bitflags! {
    /// Stackable per-device node operations (spec §6, "each node
    /// operation is also logged as a stackable op... so that
    /// self-cancelling pairs are elided"). Queued at each mutating
    /// ioctl, flushed once per commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeOp: u8 {
        const NODE_ADD        = 0x01;
        const NODE_DEL        = 0x02;
        const NODE_RENAME     = 0x04;
        const NODE_READ_AHEAD = 0x08;
    }
}

/// Per-device-name stack of pending node operations, eliding
/// self-cancelling `ADD`/`DEL` pairs (spec §6) instead of replaying
/// every operation literally.
#[derive(Debug, Default)]
pub struct NodeOpLog {
    pending: HashMap<String, NodeOp>,
}

impl NodeOpLog {
    pub fn new() -> Self {
        NodeOpLog::default()
    }

    /// Stack `op` onto `device`'s pending set. A freshly queued `ADD`
    /// cancels an already-pending `DEL` for the same device and vice
    /// versa, rather than carrying both through to the flush.
    pub fn queue(&mut self, device: &str, op: NodeOp) {
        let entry = self.pending.entry(device.to_string()).or_insert_with(NodeOp::empty);
        if op == NodeOp::NODE_ADD && entry.contains(NodeOp::NODE_DEL) {
            entry.remove(NodeOp::NODE_DEL);
        } else if op == NodeOp::NODE_DEL && entry.contains(NodeOp::NODE_ADD) {
            entry.remove(NodeOp::NODE_ADD);
        } else {
            *entry |= op;
        }
    }

    pub fn pending(&self, device: &str) -> NodeOp {
        self.pending.get(device).copied().unwrap_or(NodeOp::empty())
    }

    /// Drain every device with a nonempty pending set, for the caller
    /// to actually apply (or, for an elided pair, skip entirely).
    pub fn flush(&mut self) -> Vec<(String, NodeOp)> {
        self.pending.drain().filter(|(_, ops)| !ops.is_empty()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_del_cancels_to_nothing() {
        let mut log = NodeOpLog::new();
        log.queue("vg0-lv0", NodeOp::NODE_ADD);
        log.queue("vg0-lv0", NodeOp::NODE_DEL);
        assert!(log.pending("vg0-lv0").is_empty());
    }

    #[test]
    fn del_then_add_also_cancels() {
        let mut log = NodeOpLog::new();
        log.queue("vg0-lv0", NodeOp::NODE_DEL);
        log.queue("vg0-lv0", NodeOp::NODE_ADD);
        assert!(log.pending("vg0-lv0").is_empty());
    }

    #[test]
    fn unrelated_ops_stack_instead_of_cancelling() {
        let mut log = NodeOpLog::new();
        log.queue("vg0-lv0", NodeOp::NODE_ADD);
        log.queue("vg0-lv0", NodeOp::NODE_READ_AHEAD);
        assert_eq!(log.pending("vg0-lv0"), NodeOp::NODE_ADD | NodeOp::NODE_READ_AHEAD);
    }

    #[test]
    fn flush_drains_only_nonempty_entries() {
        let mut log = NodeOpLog::new();
        log.queue("vg0-lv0", NodeOp::NODE_ADD);
        log.queue("vg0-lv1", NodeOp::NODE_ADD);
        log.queue("vg0-lv1", NodeOp::NODE_DEL);
        let flushed = log.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].0, "vg0-lv0");
    }

    #[test]
    fn cookie_flags_combine() {
        let flags = CookieFlags::DISABLE_DISK_RULES | CookieFlags::LOW_PRIORITY_FLAG;
        assert!(flags.contains(CookieFlags::DISABLE_DISK_RULES));
        assert!(!flags.contains(CookieFlags::PRIMARY_SOURCE_FLAG));
    }

    #[test]
    fn cookie_flags_cover_every_bit_spec_names() {
        let all = CookieFlags::DISABLE_DM_RULES
            | CookieFlags::DISABLE_SUBSYSTEM_RULES
            | CookieFlags::DISABLE_DISK_RULES
            | CookieFlags::DISABLE_OTHER_RULES
            | CookieFlags::LOW_PRIORITY_FLAG
            | CookieFlags::DISABLE_LIBRARY_FALLBACK
            | CookieFlags::PRIMARY_SOURCE_FLAG;
        assert_eq!(all.bits(), 0x007F);
    }
}
