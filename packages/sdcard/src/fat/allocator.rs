use super::{
    Fat16Volume, SdFatError, FAT16_EOC_WRITE, FAT16_FREE, FIRST_DATA_CLUSTER,
};
use crate::block::{BlockDevice, BLOCK_SIZE};

impl<D: BlockDevice> Fat16Volume<D> {
    pub fn read_fat_entry(&mut self, cluster: u16) -> Result<u16, SdFatError> {
        self.check_cluster(cluster)?;
        let (offset, index) = self.geometry.fat_entry_location(cluster, 0);
        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(offset, &mut block)?;
        Ok(u16::from_le_bytes([block[index], block[index + 1]]))
    }

    /// Writes one FAT entry into every FAT copy.
    pub fn set_fat_entry(&mut self, cluster: u16, value: u16) -> Result<(), SdFatError> {
        self.check_cluster(cluster)?;
        let mut block = [0u8; BLOCK_SIZE];
        for copy in 0..self.geometry.fat_count {
            let (offset, index) = self.geometry.fat_entry_location(cluster, copy);
            self.read_block(offset, &mut block)?;
            block[index..index + 2].copy_from_slice(&value.to_le_bytes());
            self.write_block(offset, &block)?;
        }
        Ok(())
    }

    /// First free cluster at or after `hint`, wrapping to cluster 2. Claims nothing.
    pub fn peek_free_cluster(&mut self, hint: u16) -> Result<Option<u16>, SdFatError> {
        let max = self.geometry.max_cluster();
        if max < FIRST_DATA_CLUSTER {
            return Ok(None);
        }
        let start = hint.clamp(FIRST_DATA_CLUSTER, max);
        if let Some(cluster) = self.scan_free(start, max, 1)? {
            return Ok(Some(cluster));
        }
        if start > FIRST_DATA_CLUSTER {
            return self.scan_free(FIRST_DATA_CLUSTER, start - 1, 1);
        }
        Ok(None)
    }

    /// Finds a free cluster and claims it as end-of-chain. `None` means the volume is full.
    pub fn find_free_cluster(&mut self, hint: u16) -> Result<Option<u16>, SdFatError> {
        let Some(cluster) = self.peek_free_cluster(hint)? else {
            log::info!("sdfat: volume full hint={}", hint);
            return Ok(None);
        };
        self.set_fat_entry(cluster, FAT16_EOC_WRITE)?;
        self.advance_hint(cluster);
        log::debug!("sdfat: claim cluster={}", cluster);
        Ok(Some(cluster))
    }

    /// Claims the next free cluster after the last one handed out.
    pub fn allocate_cluster(&mut self) -> Result<Option<u16>, SdFatError> {
        self.find_free_cluster(self.next_free_hint)
    }

    pub fn link_cluster(&mut self, prev: u16, next: u16) -> Result<(), SdFatError> {
        self.check_cluster(next)?;
        self.set_fat_entry(prev, next)
    }

    /// Claims `count` adjacent free clusters as one chain and returns the first.
    pub fn allocate_contiguous(&mut self, count: u16) -> Result<Option<u16>, SdFatError> {
        if count == 0 {
            return Ok(None);
        }
        let max = self.geometry.max_cluster();
        let Some(first) = self.scan_free(FIRST_DATA_CLUSTER, max, count)? else {
            log::info!("sdfat: no contiguous run count={}", count);
            return Ok(None);
        };
        let last = first + (count - 1);
        for cluster in first..last {
            self.set_fat_entry(cluster, cluster + 1)?;
        }
        self.set_fat_entry(last, FAT16_EOC_WRITE)?;
        if (first..=last).contains(&self.next_free_hint) {
            self.advance_hint(last);
        }
        Ok(Some(first))
    }

    /// Returns an adjacent run of clusters to the free pool.
    pub fn release_contiguous(&mut self, first: u16, count: u16) -> Result<(), SdFatError> {
        for cluster in first..first.saturating_add(count) {
            self.set_fat_entry(cluster, FAT16_FREE)?;
        }
        if first < self.next_free_hint {
            self.next_free_hint = first.max(FIRST_DATA_CLUSTER);
        }
        Ok(())
    }

    /// Scans `[from, to]` block by block for `run` consecutive free entries.
    fn scan_free(&mut self, from: u16, to: u16, run: u16) -> Result<Option<u16>, SdFatError> {
        let mut block = [0u8; BLOCK_SIZE];
        let mut loaded: Option<u32> = None;
        let mut run_start = from;
        let mut run_len = 0u16;

        for cluster in from..=to {
            let (offset, index) = self.geometry.fat_entry_location(cluster, 0);
            if loaded != Some(offset) {
                self.read_block(offset, &mut block)?;
                loaded = Some(offset);
            }
            if u16::from_le_bytes([block[index], block[index + 1]]) == FAT16_FREE {
                if run_len == 0 {
                    run_start = cluster;
                }
                run_len += 1;
                if run_len == run {
                    return Ok(Some(run_start));
                }
            } else {
                run_len = 0;
            }
        }
        Ok(None)
    }

    fn advance_hint(&mut self, claimed: u16) {
        self.next_free_hint = if claimed >= self.geometry.max_cluster() {
            FIRST_DATA_CLUSTER
        } else {
            claimed + 1
        };
    }

    fn check_cluster(&self, cluster: u16) -> Result<(), SdFatError> {
        if cluster < FIRST_DATA_CLUSTER || cluster > self.geometry.max_cluster() {
            return Err(SdFatError::BadCluster(cluster));
        }
        Ok(())
    }
}
