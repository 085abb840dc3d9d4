// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Decoder for the dm-raid on-disk superblock written to the start of
//! each `rmeta` sub-LV (spec §5, "RAID superblock").
//!
//! The kernel's own layout (`drivers/md/dm-raid.c`) is little-endian
//! throughout except the magic, which userspace has always compared
//! against a byte-swapped constant; this decoder preserves that
//! asymmetry rather than silently "fixing" it; a real pristine
//! superblock would stop matching otherwise.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{Error, Result};

const MAGIC: u32 = 0x446D_5264;
const FEATURE_FLAG_SUPPORTS_V190: u32 = 0x1;
const MAX_RAID_DEVICES: usize = 253;
const UINT64_BITS: usize = 64;
const DISKS_ARRAY_ELEMS: usize = (MAX_RAID_DEVICES + (UINT64_BITS - 1)) / UINT64_BITS;

const OFF_MAGIC: usize = 0;
const OFF_COMPAT_FEATURES: usize = 4;
const OFF_FAILED_DEVICES: usize = 8 + 4 * 4;
const OFF_FLAGS: usize = OFF_FAILED_DEVICES + 8 + 4 * 7;
const OFF_EXTENDED_FAILED_DEVICES: usize = OFF_FLAGS + 4 + 4 * 14;

/// Size of the pristine (pre-1.9.0) superblock, i.e. everything up to
/// and including `flags`'s would-be offset were the extension absent.
const PRISTINE_SB_SIZE: usize = OFF_FLAGS;
const EXTENDED_SB_SIZE: usize = OFF_EXTENDED_FAILED_DEVICES + 8 * (DISKS_ARRAY_ELEMS - 1) + 4;

/// I/O buffer size a real caller reads into, large enough to cover 4K
/// native sector devices.
pub const SB_BUFSZ: usize = 4096;

/// A decoded dm-raid superblock. Only the fields this crate actually
/// needs (failed-device accounting) are modeled; the dummy padding
/// fields from the kernel layout are skipped over, not stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaidSuperblock {
    pub compat_features: u32,
    pub failed_devices: u64,
    pub extended_failed_devices: Option<[u64; DISKS_ARRAY_ELEMS - 1]>,
}

impl RaidSuperblock {
    /// Decode a superblock from the first `SB_BUFSZ` (or more) bytes
    /// read from an rmeta sub-LV. Fails if the magic doesn't match;
    /// everything else is trusted verbatim, as `sb_size` cannot exceed
    /// `buf.len()` for any superblock this crate itself ever wrote.
    pub fn decode(buf: &[u8]) -> Result<RaidSuperblock> {
        if buf.len() < PRISTINE_SB_SIZE {
            return Err(Error::validation("RAID superblock buffer too short"));
        }
        let magic = BigEndian::read_u32(&buf[OFF_MAGIC..OFF_MAGIC + 4]);
        if magic != MAGIC {
            return Err(Error::validation("no RAID signature on device"));
        }

        let compat_features = LittleEndian::read_u32(&buf[OFF_COMPAT_FEATURES..OFF_COMPAT_FEATURES + 4]);
        let failed_devices = LittleEndian::read_u64(&buf[OFF_FAILED_DEVICES..OFF_FAILED_DEVICES + 8]);

        let extended_failed_devices = if compat_features & FEATURE_FLAG_SUPPORTS_V190 != 0 {
            if buf.len() < EXTENDED_SB_SIZE {
                return Err(Error::validation("v1.9.0 RAID superblock truncated"));
            }
            let mut arr = [0u64; DISKS_ARRAY_ELEMS - 1];
            for (i, slot) in arr.iter_mut().enumerate() {
                let off = OFF_EXTENDED_FAILED_DEVICES + i * 8;
                *slot = LittleEndian::read_u64(&buf[off..off + 8]);
            }
            Some(arr)
        } else {
            None
        };

        Ok(RaidSuperblock { compat_features, failed_devices, extended_failed_devices })
    }

    /// Size in bytes of the on-disk superblock this decode actually
    /// covers: the pristine layout, or the full v1.9.0-extended one.
    pub fn sb_size(&self) -> usize {
        if self.compat_features & FEATURE_FLAG_SUPPORTS_V190 != 0 {
            EXTENDED_SB_SIZE
        } else {
            PRISTINE_SB_SIZE
        }
    }

    /// Highest failed-device count across the legacy bitmap and, if
    /// present, every extended bitmap word — mirroring the kernel's
    /// own "max, not sum" accounting for overlapping bit ranges.
    pub fn failed_device_count(&self) -> u32 {
        let mut r = self.failed_devices.count_ones();
        if let Some(ext) = &self.extended_failed_devices {
            for word in ext {
                r = r.max(word.count_ones());
            }
        }
        r
    }

    /// Zero every failed-device bit, in place, as part of a
    /// read-modify-write re-mirroring the kernel's own clear path.
    pub fn clear_failed_devices(&mut self) {
        self.failed_devices = 0;
        if let Some(ext) = &mut self.extended_failed_devices {
            for word in ext.iter_mut() {
                *word = 0;
            }
        }
    }

    /// Re-serialize `failed_devices`/`extended_failed_devices` back
    /// into `buf` at the offsets they were read from, leaving every
    /// other byte of the superblock untouched.
    pub fn write_failed_devices(&self, buf: &mut [u8]) {
        LittleEndian::write_u64(&mut buf[OFF_FAILED_DEVICES..OFF_FAILED_DEVICES + 8], self.failed_devices);
        if let Some(ext) = &self.extended_failed_devices {
            for (i, word) in ext.iter().enumerate() {
                let off = OFF_EXTENDED_FAILED_DEVICES + i * 8;
                LittleEndian::write_u64(&mut buf[off..off + 8], *word);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pristine_buf() -> Vec<u8> {
        let mut buf = vec![0u8; SB_BUFSZ];
        BigEndian::write_u32(&mut buf[OFF_MAGIC..OFF_MAGIC + 4], MAGIC);
        buf
    }

    fn v190_buf() -> Vec<u8> {
        let mut buf = pristine_buf();
        LittleEndian::write_u32(&mut buf[OFF_COMPAT_FEATURES..OFF_COMPAT_FEATURES + 4], FEATURE_FLAG_SUPPORTS_V190);
        buf
    }

    #[test]
    fn rejects_wrong_magic() {
        let buf = vec![0u8; SB_BUFSZ];
        assert!(RaidSuperblock::decode(&buf).is_err());
    }

    #[test]
    fn pristine_superblock_has_no_extended_bitmap() {
        let buf = pristine_buf();
        let sb = RaidSuperblock::decode(&buf).unwrap();
        assert!(sb.extended_failed_devices.is_none());
        assert_eq!(sb.sb_size(), PRISTINE_SB_SIZE);
    }

    #[test]
    fn failed_device_count_takes_the_max_not_the_sum() {
        let mut buf = v190_buf();
        LittleEndian::write_u64(&mut buf[OFF_FAILED_DEVICES..OFF_FAILED_DEVICES + 8], 0b101);
        let off = OFF_EXTENDED_FAILED_DEVICES;
        LittleEndian::write_u64(&mut buf[off..off + 8], 0b1111);

        let sb = RaidSuperblock::decode(&buf).unwrap();
        assert_eq!(sb.failed_device_count(), 4);
    }

    #[test]
    fn count_then_clear_then_count_is_zero() {
        let mut buf = v190_buf();
        LittleEndian::write_u64(&mut buf[OFF_FAILED_DEVICES..OFF_FAILED_DEVICES + 8], 0b1011);

        let mut sb = RaidSuperblock::decode(&buf).unwrap();
        assert_eq!(sb.failed_device_count(), 3);

        sb.clear_failed_devices();
        sb.write_failed_devices(&mut buf);

        let reloaded = RaidSuperblock::decode(&buf).unwrap();
        assert_eq!(reloaded.failed_device_count(), 0);
    }
}
