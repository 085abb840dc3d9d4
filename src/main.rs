// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thin binary entry point. Argument parsing, VG-lock acquisition and
//! the text-format metadata reader all live outside this crate (they
//! drive it, rather than the other way around); this binary exists so
//! the crate has something to smoke-test against during development.

use std::fs;

use melvin::{CoreContext, KernelVersion};

fn main() {
    env_logger::init();

    let release = fs::read_to_string("/proc/sys/kernel/osrelease").unwrap_or_default();
    let kernel_version = parse_kernel_version(release.trim()).unwrap_or(KernelVersion::new(0, 0, 0));

    let ctx = CoreContext::new(kernel_version);
    log::info!(
        "melvin core initialized, kernel {:?}, dm_dir {}",
        kernel_version,
        ctx.dm_dir
    );
}

fn parse_kernel_version(release: &str) -> Option<KernelVersion> {
    let core = release.split(|c: char| !c.is_ascii_digit() && c != '.').next()?;
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().unwrap_or("0").parse().ok()?;
    let patch = parts.next().unwrap_or("0").parse().ok()?;
    Some(KernelVersion::new(major, minor, patch))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_typical_uname_release_string() {
        assert_eq!(parse_kernel_version("6.8.0-40-generic"), Some(KernelVersion::new(6, 8, 0)));
        assert_eq!(parse_kernel_version("5.10.0"), Some(KernelVersion::new(5, 10, 0)));
    }
}
