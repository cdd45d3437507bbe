use crate::block::{BlockDevice, StorageErrorKind, BLOCK_SIZE};
use crate::transport::SdError;

mod allocator;
mod chain;
mod dir;
mod format;
mod geometry;
mod mount;

pub use chain::{ChainWriter, WriteProgress};
pub use dir::{DirSlot, FileKind, FILE_SUFFIX_MAX};
pub use geometry::VolumeGeometry;
pub use mount::{parse_boot_sector, read_boot_sector, BootSector};

pub const DIR_ENTRY_SIZE: usize = 32;
pub const FAT16_FREE: u16 = 0x0000;
pub const FAT16_EOC: u16 = 0xFFF8;
pub const FAT16_EOC_WRITE: u16 = 0xFFFF;
pub const FIRST_DATA_CLUSTER: u16 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdFatError {
    Sd(SdError),
    InvalidBootSector,
    UnsupportedFatType([u8; 5]),
    UnsupportedSectorSize(u16),
    UnsupportedSectorsPerCluster(u8),
    NoFatCopies,
    LayoutOverflow,
    DirFull,
    SuffixExhausted,
    BadCluster(u16),
}

impl SdFatError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::Sd(err) => err.kind(),
            Self::InvalidBootSector | Self::UnsupportedFatType(_) => {
                StorageErrorKind::UnsupportedFilesystem
            }
            Self::UnsupportedSectorSize(_)
            | Self::UnsupportedSectorsPerCluster(_)
            | Self::NoFatCopies
            | Self::LayoutOverflow => StorageErrorKind::UnsupportedGeometry,
            Self::DirFull | Self::SuffixExhausted => StorageErrorKind::DirectoryFull,
            Self::BadCluster(_) => StorageErrorKind::Io,
        }
    }
}

impl From<SdError> for SdFatError {
    fn from(value: SdError) -> Self {
        Self::Sd(value)
    }
}

/// A mounted FAT16 volume. All on-card metadata changes go through here.
pub struct Fat16Volume<D> {
    device: D,
    geometry: VolumeGeometry,
    next_free_hint: u16,
}

impl<D: BlockDevice> Fat16Volume<D> {
    pub fn mount(mut device: D) -> Result<Self, SdFatError> {
        let boot = read_boot_sector(&mut device)?;
        let geometry = parse_boot_sector(&boot)?;
        log::info!(
            "sdfat: mount boot_offset={} spc={} fats={} fat_offset={} dir_offset={} data_offset={} clusters={}",
            geometry.boot_sector_offset,
            geometry.sectors_per_cluster,
            geometry.fat_count,
            geometry.fat_offset,
            geometry.dir_table_offset,
            geometry.first_data_cluster_offset,
            geometry.cluster_count
        );
        Ok(Self {
            device,
            geometry,
            next_free_hint: FIRST_DATA_CLUSTER,
        })
    }

    pub fn geometry(&self) -> &VolumeGeometry {
        &self.geometry
    }

    pub fn next_free_hint(&self) -> u16 {
        self.next_free_hint
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn read_block(&mut self, offset: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), SdFatError> {
        self.device.read_block(offset, out)?;
        Ok(())
    }

    pub fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), SdFatError> {
        self.device.write_block(offset, data)?;
        Ok(())
    }
}
