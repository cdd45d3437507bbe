use super::FIRST_DATA_CLUSTER;
use crate::block::BLOCK_SIZE;

/// Volume layout decoded from the boot sector. All offsets are absolute card bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub boot_sector_offset: u32,
    pub hidden_sectors: u32,
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub bytes_per_cluster: u32,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub fat_size_bytes: u32,
    pub fat_offset: u32,
    pub root_entry_count: u16,
    pub dir_table_offset: u32,
    pub dir_table_size: u32,
    pub first_data_cluster_offset: u32,
    pub total_sectors: u32,
    pub cluster_count: u32,
}

impl VolumeGeometry {
    pub fn cluster_byte_offset(&self, cluster: u16) -> u32 {
        let index = cluster.saturating_sub(FIRST_DATA_CLUSTER) as u32;
        self.first_data_cluster_offset + index * self.bytes_per_cluster
    }

    pub fn is_block_index_valid(&self, block_index: u8) -> bool {
        block_index < self.sectors_per_cluster
    }

    /// Highest allocatable cluster, bounded by both the data area and the FAT.
    pub fn max_cluster(&self) -> u16 {
        let by_data = self.cluster_count.saturating_add(FIRST_DATA_CLUSTER as u32 - 1);
        let by_fat = (self.fat_size_bytes / 2).saturating_sub(1);
        by_data.min(by_fat).min(0xFFEF) as u16
    }

    /// Block offset and byte index of a cluster's entry in FAT copy `copy`.
    pub fn fat_entry_location(&self, cluster: u16, copy: u8) -> (u32, usize) {
        let byte = cluster as u32 * 2;
        let block = byte / BLOCK_SIZE as u32 * BLOCK_SIZE as u32;
        (
            self.fat_offset + copy as u32 * self.fat_size_bytes + block,
            (byte % BLOCK_SIZE as u32) as usize,
        )
    }

    pub fn dir_table_blocks(&self) -> u32 {
        self.dir_table_size.div_ceil(BLOCK_SIZE as u32)
    }
}
