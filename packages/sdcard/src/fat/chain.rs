use super::{DirSlot, Fat16Volume, FileKind, SdFatError};
use crate::block::{BlockDevice, BLOCK_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteProgress {
    Written,
    /// No cluster was free for the block; nothing was written.
    VolumeFull,
}

/// Appends blocks to a file's cluster chain, claiming clusters as it fills them.
#[derive(Clone, Copy, Debug)]
pub struct ChainWriter {
    first_cluster: u16,
    cluster: u16,
    block_index: u8,
    size: u32,
    blocks: u32,
}

impl ChainWriter {
    /// Claims the first cluster of a new file. `None` when the volume is full.
    pub fn start<D: BlockDevice>(volume: &mut Fat16Volume<D>) -> Result<Option<Self>, SdFatError> {
        Ok(volume.allocate_cluster()?.map(|cluster| Self {
            first_cluster: cluster,
            cluster,
            block_index: 0,
            size: 0,
            blocks: 0,
        }))
    }

    pub fn first_cluster(&self) -> u16 {
        self.first_cluster
    }

    pub fn current_cluster(&self) -> u16 {
        self.cluster
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn blocks_written(&self) -> u32 {
        self.blocks
    }

    /// Writes `data` (at most one block) as the next block of the file.
    ///
    /// Only the final block of a file may be short.
    pub fn append<D: BlockDevice>(
        &mut self,
        volume: &mut Fat16Volume<D>,
        data: &[u8],
    ) -> Result<WriteProgress, SdFatError> {
        if !volume.geometry().is_block_index_valid(self.block_index) {
            let Some(next) = volume.allocate_cluster()? else {
                return Ok(WriteProgress::VolumeFull);
            };
            volume.link_cluster(self.cluster, next)?;
            self.cluster = next;
            self.block_index = 0;
        }

        let offset = volume.geometry().cluster_byte_offset(self.cluster)
            + self.block_index as u32 * BLOCK_SIZE as u32;
        volume.write_block(offset, data)?;
        self.block_index += 1;
        self.blocks += 1;
        self.size += data.len().min(BLOCK_SIZE) as u32;
        Ok(WriteProgress::Written)
    }

    /// Makes the file visible under the next free name of `kind`.
    pub fn commit<D: BlockDevice>(
        &self,
        volume: &mut Fat16Volume<D>,
        kind: &FileKind,
    ) -> Result<DirSlot, SdFatError> {
        let suffix = volume.next_file_suffix(kind)?;
        volume.commit_directory_entry(self.first_cluster, self.size, suffix, kind)
    }
}
