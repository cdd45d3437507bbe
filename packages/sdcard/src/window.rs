use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::fat::{Fat16Volume, SdFatError, VolumeGeometry, WriteProgress};

/// Write position captured when a trigger fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bookmark {
    /// Slot written most recently.
    pub last_slot: u32,
    /// Slots holding data, at most one lap.
    pub filled: u32,
    /// Valid bytes in `last_slot`.
    pub last_len: usize,
}

impl Bookmark {
    /// Slot indices oldest first, ending at `last_slot`.
    pub fn chronological(&self, slot_count: u32) -> impl Iterator<Item = u32> {
        let filled = self.filled.min(slot_count);
        let start = (self.last_slot + 1 + slot_count - filled) % slot_count.max(1);
        (0..filled).map(move |step| (start + step) % slot_count)
    }
}

/// A contiguous run of chained clusters reused in place as a ring of blocks.
///
/// The run is claimed in the FAT so normal allocation never hands it out,
/// but no directory entry points at it.
#[derive(Clone, Copy, Debug)]
pub struct RingWindow {
    first_cluster: u16,
    clusters: u16,
    begin: u32,
    slot_count: u32,
    cursor: u32,
    written: u32,
    last_len: usize,
}

impl RingWindow {
    pub fn reserve<D: BlockDevice>(
        volume: &mut Fat16Volume<D>,
        clusters: u16,
    ) -> Result<Option<Self>, SdFatError> {
        let Some(first) = volume.allocate_contiguous(clusters)? else {
            return Ok(None);
        };
        let ring = Self::over(volume.geometry(), first, clusters);
        log::info!(
            "sdfat: ring reserved first_cluster={} clusters={} slots={}",
            first,
            clusters,
            ring.slot_count
        );
        Ok(Some(ring))
    }

    /// Ring over an already chained run starting at `first_cluster`.
    pub fn over(geometry: &VolumeGeometry, first_cluster: u16, clusters: u16) -> Self {
        Self {
            first_cluster,
            clusters,
            begin: geometry.cluster_byte_offset(first_cluster),
            slot_count: clusters as u32 * geometry.sectors_per_cluster as u32,
            cursor: 0,
            written: 0,
            last_len: 0,
        }
    }

    pub fn first_cluster(&self) -> u16 {
        self.first_cluster
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn begin_offset(&self) -> u32 {
        self.begin
    }

    pub fn slot_offset(&self, slot: u32) -> u32 {
        self.begin + (slot % self.slot_count) * BLOCK_SIZE as u32
    }

    /// Writes the next slot. A short `data` is only valid as the final write.
    pub fn write_slot<D: BlockDevice>(
        &mut self,
        volume: &mut Fat16Volume<D>,
        data: &[u8],
    ) -> Result<(), SdFatError> {
        volume.write_block(self.slot_offset(self.cursor), data)?;
        self.cursor = (self.cursor + 1) % self.slot_count;
        self.written = self.written.saturating_add(1);
        self.last_len = data.len();
        Ok(())
    }

    pub fn bookmark(&self) -> Option<Bookmark> {
        if self.written == 0 {
            return None;
        }
        Some(Bookmark {
            last_slot: (self.cursor + self.slot_count - 1) % self.slot_count,
            filled: self.written.min(self.slot_count),
            last_len: self.last_len,
        })
    }

    /// Feeds the lap ending at `bookmark` to `sink`, oldest block first.
    pub fn extract<D, S>(
        &self,
        volume: &mut Fat16Volume<D>,
        bookmark: Bookmark,
        mut sink: S,
    ) -> Result<WriteProgress, SdFatError>
    where
        D: BlockDevice,
        S: FnMut(&mut Fat16Volume<D>, &[u8]) -> Result<WriteProgress, SdFatError>,
    {
        let mut block = [0u8; BLOCK_SIZE];
        for slot in bookmark.chronological(self.slot_count) {
            volume.read_block(self.slot_offset(slot), &mut block)?;
            let len = if slot == bookmark.last_slot {
                bookmark.last_len
            } else {
                BLOCK_SIZE
            };
            if sink(volume, &block[..len])? == WriteProgress::VolumeFull {
                return Ok(WriteProgress::VolumeFull);
            }
        }
        Ok(WriteProgress::Written)
    }

    /// Returns the ring's clusters to the free pool.
    pub fn release<D: BlockDevice>(self, volume: &mut Fat16Volume<D>) -> Result<(), SdFatError> {
        volume.release_contiguous(self.first_cluster, self.clusters)?;
        log::info!("sdfat: ring released first_cluster={}", self.first_cluster);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::vec::Vec;

    use super::*;
    use crate::block::{FormatSpec, RamDisk};
    use crate::fat::FAT16_EOC_WRITE;

    fn volume() -> Fat16Volume<RamDisk> {
        Fat16Volume::mount(RamDisk::format(FormatSpec::new(128).with_fat_count(1))).expect("mount")
    }

    #[test]
    fn bookmark_after_two_laps_yields_one_lap_in_order() {
        let bookmark = Bookmark {
            last_slot: 2,
            filled: 5,
            last_len: BLOCK_SIZE,
        };
        let order: Vec<u32> = bookmark.chronological(5).collect();
        assert_eq!(order, [3, 4, 0, 1, 2]);
    }

    #[test]
    fn partial_lap_starts_at_slot_zero() {
        let bookmark = Bookmark {
            last_slot: 1,
            filled: 2,
            last_len: BLOCK_SIZE,
        };
        let order: Vec<u32> = bookmark.chronological(5).collect();
        assert_eq!(order, [0, 1]);
    }

    #[test]
    fn reserve_chains_a_closed_run() {
        let mut volume = volume();
        let ring = RingWindow::reserve(&mut volume, 5).expect("reserve").expect("space");
        assert_eq!(ring.first_cluster(), 2);
        assert_eq!(ring.slot_count(), 5);
        assert_eq!(ring.slot_offset(4) - ring.begin_offset(), 4 * 512);
        assert_eq!(ring.slot_offset(5), ring.begin_offset());
        assert_eq!(volume.read_fat_entry(6).expect("last"), FAT16_EOC_WRITE);
        assert_eq!(volume.allocate_cluster().expect("next"), Some(7));
    }

    #[test]
    fn extraction_exports_latest_lap_ending_at_bookmark() {
        let mut volume = volume();
        let mut ring = RingWindow::reserve(&mut volume, 5).expect("reserve").expect("space");
        for sequence in 0..13u8 {
            ring.write_slot(&mut volume, &[sequence; 512]).expect("slot");
        }
        let bookmark = ring.bookmark().expect("written");
        assert_eq!(bookmark.last_slot, 2);

        let mut seen = Vec::new();
        let progress = ring
            .extract(&mut volume, bookmark, |_, block| {
                seen.push(block[0]);
                Ok(WriteProgress::Written)
            })
            .expect("extract");
        assert_eq!(progress, WriteProgress::Written);
        assert_eq!(seen, [8, 9, 10, 11, 12]);
    }

    #[test]
    fn short_final_write_is_exported_at_its_length() {
        let mut volume = volume();
        let mut ring = RingWindow::reserve(&mut volume, 3).expect("reserve").expect("space");
        for sequence in 0..4u8 {
            ring.write_slot(&mut volume, &[sequence; 512]).expect("slot");
        }
        ring.write_slot(&mut volume, &[9; 40]).expect("tail");
        let bookmark = ring.bookmark().expect("written");
        assert_eq!(bookmark.last_len, 40);

        let mut seen = Vec::new();
        ring.extract(&mut volume, bookmark, |_, block| {
            seen.push((block[0], block.len()));
            Ok(WriteProgress::Written)
        })
        .expect("extract");
        assert_eq!(seen, [(2, 512), (3, 512), (9, 40)]);
    }

    #[test]
    fn release_frees_ring_clusters() {
        let mut volume = volume();
        let ring = RingWindow::reserve(&mut volume, 3).expect("reserve").expect("space");
        ring.release(&mut volume).expect("release");
        assert_eq!(volume.peek_free_cluster(2).expect("peek"), Some(2));
    }
}
