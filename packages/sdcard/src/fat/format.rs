use super::{Fat16Volume, SdFatError, FIRST_DATA_CLUSTER};
use crate::block::{BlockDevice, BLOCK_SIZE};

const MEDIA_ENTRIES: [u8; 4] = [0xF8, 0xFF, 0xFF, 0xFF];

impl<D: BlockDevice> Fat16Volume<D> {
    /// Empties the volume: clears every FAT copy and the root directory, keeps the boot sector.
    pub fn quick_format(&mut self) -> Result<(), SdFatError> {
        let geometry = *self.geometry();
        let zero = [0u8; BLOCK_SIZE];
        let mut first = [0u8; BLOCK_SIZE];
        first[..MEDIA_ENTRIES.len()].copy_from_slice(&MEDIA_ENTRIES);

        let fat_blocks = geometry.fat_size_bytes / BLOCK_SIZE as u32;
        for copy in 0..geometry.fat_count as u32 {
            let base = geometry.fat_offset + copy * geometry.fat_size_bytes;
            for block in 0..fat_blocks {
                let data: &[u8] = if block == 0 { &first } else { &zero };
                self.write_block(base + block * BLOCK_SIZE as u32, data)?;
            }
        }
        for block in 0..geometry.dir_table_blocks() {
            self.write_block(geometry.dir_table_offset + block * BLOCK_SIZE as u32, &zero)?;
        }

        self.next_free_hint = FIRST_DATA_CLUSTER;
        log::info!(
            "sdfat: quick format fats={} fat_blocks={} dir_blocks={}",
            geometry.fat_count,
            fat_blocks,
            geometry.dir_table_blocks()
        );
        Ok(())
    }
}
