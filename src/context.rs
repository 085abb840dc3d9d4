// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Configuration and process-wide state, made explicit.
//!
//! The original source keeps the suspended-device counter, the udev
//! cookie and `_dm_dir` as process globals. Per spec §9 ("Design
//! Notes"), this crate collects them into one `CoreContext` that
//! callers construct once and thread through every mutating entry
//! point, instead of hidden singletons.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::alloc::policy::AllocPolicy;

/// Kernel version gate for `handle_errors` vs `block_on_error` mirror
/// params (spec §4.4): `handle_errors` iff kernel >= 2.6.22.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct KernelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl KernelVersion {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        KernelVersion { major, minor, patch }
    }

    pub fn supports_handle_errors(&self) -> bool {
        *self >= KernelVersion::new(2, 6, 22)
    }
}

/// Process-wide configuration and counters threaded explicitly rather
/// than read from hidden statics.
pub struct CoreContext {
    /// Directory device nodes are created under, e.g. `/dev/mapper`.
    pub dm_dir: String,
    /// Default allocation policy used when a caller passes `Inherit`.
    pub default_policy: AllocPolicy,
    /// Whether mirror logs must land on a PV not used by any mirror
    /// image of the same LV.
    pub mirror_logs_require_separate_pvs: bool,
    /// Widen CLING to the whole LV history, not just the trailing LE,
    /// and retry once if the first NORMAL pass left gaps.
    pub maximise_cling: bool,
    /// `@TAG` / `@*` entries consulted by `CLING_BY_TAGS`.
    pub cling_tag_list: Vec<String>,
    /// Gates mirror target parameter selection (spec §4.4).
    pub kernel_version: KernelVersion,

    suspended_devices: AtomicU32,
    udev_cookie: AtomicU32,
}

impl CoreContext {
    pub fn new(kernel_version: KernelVersion) -> Self {
        CoreContext {
            dm_dir: "/dev/mapper".to_string(),
            default_policy: AllocPolicy::Normal,
            mirror_logs_require_separate_pvs: true,
            maximise_cling: true,
            cling_tag_list: Vec::new(),
            kernel_version,
            suspended_devices: AtomicU32::new(0),
            udev_cookie: AtomicU32::new(0),
        }
    }

    pub fn inc_suspended(&self) -> u32 {
        self.suspended_devices.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn dec_suspended(&self) -> u32 {
        self.suspended_devices.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn suspended_count(&self) -> u32 {
        self.suspended_devices.load(Ordering::SeqCst)
    }

    /// Mint a new udev-sync cookie: bits 0-15 are a magic, bits 16-31
    /// are supplied flag bits plus a random low half contributed by the
    /// caller (spec §6, "Cookie flag bits").
    pub fn new_cookie(&self, flags: u16, random_low: u16) -> u32 {
        const DM_COOKIE_MAGIC: u16 = 0x0D4D;
        let cookie = (u32::from(flags) << 16) | u32::from(DM_COOKIE_MAGIC ^ random_low);
        self.udev_cookie.store(cookie, Ordering::SeqCst);
        cookie
    }

    pub fn current_cookie(&self) -> u32 {
        self.udev_cookie.load(Ordering::SeqCst)
    }
}

impl Default for CoreContext {
    fn default() -> Self {
        CoreContext::new(KernelVersion::new(5, 10, 0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suspend_counter_round_trips() {
        let ctx = CoreContext::default();
        assert_eq!(ctx.inc_suspended(), 1);
        assert_eq!(ctx.inc_suspended(), 2);
        assert_eq!(ctx.dec_suspended(), 1);
        assert_eq!(ctx.suspended_count(), 1);
    }

    #[test]
    fn kernel_version_gate() {
        assert!(KernelVersion::new(2, 6, 22).supports_handle_errors());
        assert!(KernelVersion::new(3, 0, 0).supports_handle_errors());
        assert!(!KernelVersion::new(2, 6, 21).supports_handle_errors());
    }
}
