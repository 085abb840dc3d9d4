// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Decoder for the VDO volume geometry block and the component section
//! that follows it (spec §5, "VDO geometry"). Every multi-byte field
//! in both the kernel and the on-disk format is little-endian; this
//! only decodes the handful of fields this crate needs to recover a
//! VDO-backed LV's logical size, not the full VDO component graph.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Error, Result};

const MAGIC: &[u8] = b"dmvdo001";
const GEOMETRY_BLOCK_ID: u32 = 5;

const HEADER_LEN: usize = 4 + 4 + 4 + 8; // id, major, minor, size
const GEOMETRY_BLOCK_LEN: usize = MAGIC.len() + HEADER_LEN + 4; // + checksum

const REGION_LEN: usize = 4 + 8; // id, start_block
const INDEX_CONFIG_LEN: usize = 4 + 4 + 1;
const GEOMETRY_V5_LEN: usize = 4 + 8 + 16 + 8 + 2 * REGION_LEN + INDEX_CONFIG_LEN;
const GEOMETRY_V4_LEN: usize = 4 + 8 + 16 + 2 * REGION_LEN + INDEX_CONFIG_LEN;

const VERSION_LEN: usize = 8; // major, minor
const CONFIG_LEN: usize = 8 * 5;
const COMPONENT_41_0_LEN: usize = 4 + 8 + 8 + CONFIG_LEN + 8;

const VDO_DATA_REGION: usize = 1;
const VDO_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdoHeader {
    pub id: u32,
    pub major_version: u32,
    pub minor_version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdoConfig {
    pub logical_blocks: u64,
    pub physical_blocks: u64,
    pub slab_size: u64,
    pub recovery_journal_size: u64,
    pub slab_journal_blocks: u64,
}

/// The fields this crate needs out of the geometry block at the start
/// of a VDO backend: the data region's starting block, and the bio
/// offset it's measured relative to (always 0 for the v4 layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdoVolumeGeometry {
    pub release_version: u32,
    pub nonce: u64,
    pub bio_offset: u64,
    pub data_region_start_block: u64,
}

impl VdoVolumeGeometry {
    /// Decode the geometry block found in the first 4096 bytes of a
    /// VDO backend device, dispatching on the header's major version
    /// the way the original reader does (v4 has no `bio_offset` field
    /// and always implies zero).
    pub fn decode(buf: &[u8]) -> Result<VdoVolumeGeometry> {
        if buf.len() < GEOMETRY_BLOCK_LEN {
            return Err(Error::validation("VDO geometry block buffer too short"));
        }
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::validation("mismatching VDO magic header"));
        }

        let header = decode_header(&buf[MAGIC.len()..MAGIC.len() + HEADER_LEN]);
        if header.id != GEOMETRY_BLOCK_ID {
            return Err(Error::validation(format!("expected geometry block, found block id {}", header.id)));
        }

        let body = &buf[GEOMETRY_BLOCK_LEN..];
        match header.major_version {
            4 => {
                if body.len() < GEOMETRY_V4_LEN {
                    return Err(Error::validation("VDO v4 geometry body truncated"));
                }
                let release_version = LittleEndian::read_u32(&body[0..4]);
                let nonce = LittleEndian::read_u64(&body[4..12]);
                let region_off = 4 + 8 + 16 + VDO_DATA_REGION * REGION_LEN;
                let data_region_start_block = LittleEndian::read_u64(&body[region_off + 4..region_off + 4 + 8]);
                Ok(VdoVolumeGeometry { release_version, nonce, bio_offset: 0, data_region_start_block })
            }
            5 => {
                if body.len() < GEOMETRY_V5_LEN {
                    return Err(Error::validation("VDO v5 geometry body truncated"));
                }
                let release_version = LittleEndian::read_u32(&body[0..4]);
                let nonce = LittleEndian::read_u64(&body[4..12]);
                let bio_offset = LittleEndian::read_u64(&body[12 + 16..12 + 16 + 8]);
                let region_off = 4 + 8 + 16 + 8 + VDO_DATA_REGION * REGION_LEN;
                let data_region_start_block = LittleEndian::read_u64(&body[region_off + 4..region_off + 4 + 8]);
                Ok(VdoVolumeGeometry { release_version, nonce, bio_offset, data_region_start_block })
            }
            other => Err(Error::validation(format!("unsupported VDO geometry version {}", other))),
        }
    }

    /// Byte offset of the data region, for seeking to the component
    /// section that follows it.
    pub fn data_region_byte_offset(&self) -> u64 {
        (self.data_region_start_block - self.bio_offset) * VDO_BLOCK_SIZE
    }
}

fn decode_header(buf: &[u8]) -> VdoHeader {
    VdoHeader {
        id: LittleEndian::read_u32(&buf[0..4]),
        major_version: LittleEndian::read_u32(&buf[4..8]),
        minor_version: LittleEndian::read_u32(&buf[8..12]),
    }
}

/// The `vdo_component_41_0` section that follows the data region's own
/// geometry-block-sized header at the start of that region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VdoComponent {
    pub nonce: u64,
    pub config: VdoConfig,
}

impl VdoComponent {
    /// Decode the component section from a buffer read at
    /// [`VdoVolumeGeometry::data_region_byte_offset`]. Rejects any
    /// component major version above 41, matching the original
    /// reader's "should be 41!" check.
    pub fn decode(buf: &[u8]) -> Result<VdoComponent> {
        if buf.len() < GEOMETRY_BLOCK_LEN + VERSION_LEN + COMPONENT_41_0_LEN {
            return Err(Error::validation("VDO component buffer too short"));
        }
        let version_off = GEOMETRY_BLOCK_LEN;
        let major_version = LittleEndian::read_u32(&buf[version_off..version_off + 4]);
        if major_version > 41 {
            return Err(Error::validation(format!("unknown VDO component version {}", major_version)));
        }

        let comp_off = version_off + VERSION_LEN;
        let config_off = comp_off + 4 + 8 + 8;
        let config = VdoConfig {
            logical_blocks: LittleEndian::read_u64(&buf[config_off..config_off + 8]),
            physical_blocks: LittleEndian::read_u64(&buf[config_off + 8..config_off + 16]),
            slab_size: LittleEndian::read_u64(&buf[config_off + 16..config_off + 24]),
            recovery_journal_size: LittleEndian::read_u64(&buf[config_off + 24..config_off + 32]),
            slab_journal_blocks: LittleEndian::read_u64(&buf[config_off + 32..config_off + 40]),
        };
        let nonce_off = config_off + CONFIG_LEN;
        let nonce = LittleEndian::read_u64(&buf[nonce_off..nonce_off + 8]);

        Ok(VdoComponent { nonce, config })
    }
}

/// Combine a decoded geometry block with the component section it
/// points at, verifying the nonces agree before trusting the logical
/// size (spec §5, "VDO geometry nonce check").
pub fn logical_blocks(geometry: &VdoVolumeGeometry, component: &VdoComponent) -> Result<u64> {
    if geometry.nonce != component.nonce {
        return Err(Error::validation(format!(
            "VDO metadata has mismatching nonces {} != {}",
            component.nonce, geometry.nonce
        )));
    }
    Ok(component.config.logical_blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry_v5_buf(nonce: u64, data_region_start: u64) -> Vec<u8> {
        let mut buf = vec![0u8; GEOMETRY_BLOCK_LEN + GEOMETRY_V5_LEN];
        buf[..MAGIC.len()].copy_from_slice(MAGIC);
        let hdr_off = MAGIC.len();
        LittleEndian::write_u32(&mut buf[hdr_off..hdr_off + 4], GEOMETRY_BLOCK_ID);
        LittleEndian::write_u32(&mut buf[hdr_off + 4..hdr_off + 8], 5);

        let body = &mut buf[GEOMETRY_BLOCK_LEN..];
        LittleEndian::write_u64(&mut body[4..12], nonce);
        let region_off = 4 + 8 + 16 + 8 + VDO_DATA_REGION * REGION_LEN;
        LittleEndian::write_u32(&mut body[region_off..region_off + 4], VDO_DATA_REGION as u32);
        LittleEndian::write_u64(&mut body[region_off + 4..region_off + 12], data_region_start);
        buf
    }

    fn component_buf(major_version: u32, nonce: u64, logical_blocks: u64) -> Vec<u8> {
        let mut buf = vec![0u8; GEOMETRY_BLOCK_LEN + VERSION_LEN + COMPONENT_41_0_LEN];
        let version_off = GEOMETRY_BLOCK_LEN;
        LittleEndian::write_u32(&mut buf[version_off..version_off + 4], major_version);

        let comp_off = version_off + VERSION_LEN;
        let config_off = comp_off + 4 + 8 + 8;
        LittleEndian::write_u64(&mut buf[config_off..config_off + 8], logical_blocks);
        let nonce_off = config_off + CONFIG_LEN;
        LittleEndian::write_u64(&mut buf[nonce_off..nonce_off + 8], nonce);
        buf
    }

    #[test]
    fn rejects_wrong_magic() {
        let buf = vec![0u8; GEOMETRY_BLOCK_LEN + GEOMETRY_V5_LEN];
        assert!(VdoVolumeGeometry::decode(&buf).is_err());
    }

    #[test]
    fn decodes_v5_geometry_and_computes_byte_offset() {
        let buf = geometry_v5_buf(42, 10);
        let geom = VdoVolumeGeometry::decode(&buf).unwrap();
        assert_eq!(geom.nonce, 42);
        assert_eq!(geom.data_region_start_block, 10);
        assert_eq!(geom.data_region_byte_offset(), 10 * VDO_BLOCK_SIZE);
    }

    #[test]
    fn rejects_component_version_above_41() {
        let buf = component_buf(42, 42, 1000);
        assert!(VdoComponent::decode(&buf).is_err());
    }

    #[test]
    fn mismatched_nonces_are_rejected() {
        let geom_buf = geometry_v5_buf(42, 10);
        let comp_buf = component_buf(41, 99, 1000);
        let geom = VdoVolumeGeometry::decode(&geom_buf).unwrap();
        let comp = VdoComponent::decode(&comp_buf).unwrap();
        assert!(logical_blocks(&geom, &comp).is_err());
    }

    #[test]
    fn matching_nonces_yield_logical_block_count() {
        let geom_buf = geometry_v5_buf(42, 10);
        let comp_buf = component_buf(41, 42, 123456);
        let geom = VdoVolumeGeometry::decode(&geom_buf).unwrap();
        let comp = VdoComponent::decode(&comp_buf).unwrap();
        assert_eq!(logical_blocks(&geom, &comp).unwrap(), 123456);
    }
}
