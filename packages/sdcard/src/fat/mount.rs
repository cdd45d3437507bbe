use super::{SdFatError, VolumeGeometry, DIR_ENTRY_SIZE, FIRST_DATA_CLUSTER};
use crate::block::{BlockDevice, BLOCK_SIZE};

const MBR_HIDDEN_SECTORS: usize = 0x1C6;
// Highest FAT16 cluster id is 0xFFEF, so ids 2..=0xFFEF.
const MAX_DATA_CLUSTERS: u32 = 0xFFEE;
const FS_TYPE_TAG: core::ops::Range<usize> = 0x36..0x3B;

/// The located boot sector and where it sits on the card.
#[derive(Clone, Copy)]
pub struct BootSector {
    pub raw: [u8; BLOCK_SIZE],
    pub offset: u32,
    pub hidden_sectors: u32,
}

/// Reads block 0, following an MBR-style outer sector to the real boot sector.
pub fn read_boot_sector<D: BlockDevice>(device: &mut D) -> Result<BootSector, SdFatError> {
    let mut raw = [0u8; BLOCK_SIZE];
    device.read_block(0, &mut raw)?;

    let mut hidden_sectors = 0u32;
    let mut offset = 0u32;
    if raw[0] == 0x00 {
        hidden_sectors = le_u32(&raw, MBR_HIDDEN_SECTORS);
        offset = hidden_sectors
            .checked_mul(BLOCK_SIZE as u32)
            .ok_or(SdFatError::LayoutOverflow)?;
        device.read_block(offset, &mut raw)?;
    }

    if raw[510] != 0x55 || raw[511] != 0xAA {
        log::warn!("sdfat: boot sector signature missing offset={}", offset);
        return Err(SdFatError::InvalidBootSector);
    }

    Ok(BootSector {
        raw,
        offset,
        hidden_sectors,
    })
}

pub fn parse_boot_sector(boot: &BootSector) -> Result<VolumeGeometry, SdFatError> {
    let raw = &boot.raw;

    let mut fs_type = [0u8; 5];
    fs_type.copy_from_slice(&raw[FS_TYPE_TAG]);
    if &fs_type != b"FAT16" {
        return Err(SdFatError::UnsupportedFatType(fs_type));
    }

    let bytes_per_sector = le_u16(raw, 0x0B);
    if bytes_per_sector != BLOCK_SIZE as u16 {
        return Err(SdFatError::UnsupportedSectorSize(bytes_per_sector));
    }

    let sectors_per_cluster = raw[0x0D];
    if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
        return Err(SdFatError::UnsupportedSectorsPerCluster(sectors_per_cluster));
    }

    let fat_count = raw[0x10];
    if fat_count == 0 {
        return Err(SdFatError::NoFatCopies);
    }

    let reserved_sectors = le_u16(raw, 0x0E);
    let root_entry_count = le_u16(raw, 0x11);
    let sectors_per_fat = le_u16(raw, 0x16) as u32;
    let total_16 = le_u16(raw, 0x13) as u32;
    let total_sectors = if total_16 != 0 {
        total_16
    } else {
        le_u32(raw, 0x20)
    };

    let sector = BLOCK_SIZE as u32;
    let bytes_per_cluster = sector * sectors_per_cluster as u32;
    let fat_size_bytes = sectors_per_fat * sector;
    let fat_offset = offset_after(boot.offset, reserved_sectors as u32, sector)?;
    let dir_table_offset = offset_after(fat_offset, fat_count as u32, fat_size_bytes)?;
    let dir_table_size = root_entry_count as u32 * DIR_ENTRY_SIZE as u32;
    let first_data_cluster_offset = offset_after(dir_table_offset, 1, dir_table_size)?;

    let metadata_sectors = (first_data_cluster_offset - boot.offset).div_ceil(sector);
    let cluster_count = total_sectors.saturating_sub(metadata_sectors) / sectors_per_cluster as u32;

    // Every allocatable cluster must be byte-addressable on the card.
    let by_fat = (fat_size_bytes / 2).saturating_sub(FIRST_DATA_CLUSTER as u32);
    let addressable = cluster_count.min(by_fat).min(MAX_DATA_CLUSTERS);
    offset_after(first_data_cluster_offset, addressable, bytes_per_cluster).map_err(|err| {
        log::warn!(
            "sdfat: data area past 4 GiB clusters={} cluster_bytes={}",
            addressable,
            bytes_per_cluster
        );
        err
    })?;

    Ok(VolumeGeometry {
        boot_sector_offset: boot.offset,
        hidden_sectors: boot.hidden_sectors,
        bytes_per_sector,
        sectors_per_cluster,
        bytes_per_cluster,
        reserved_sectors,
        fat_count,
        fat_size_bytes,
        fat_offset,
        root_entry_count,
        dir_table_offset,
        dir_table_size,
        first_data_cluster_offset,
        total_sectors,
        cluster_count,
    })
}

/// `base + count * size`, or `LayoutOverflow` when it leaves the 32-bit byte space.
fn offset_after(base: u32, count: u32, size: u32) -> Result<u32, SdFatError> {
    count
        .checked_mul(size)
        .and_then(|span| base.checked_add(span))
        .ok_or(SdFatError::LayoutOverflow)
}

pub(crate) fn le_u16(raw: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([raw[at], raw[at + 1]])
}

pub(crate) fn le_u32(raw: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]])
}
