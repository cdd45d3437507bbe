use crate::transport::SdError;

pub const BLOCK_SIZE: usize = 512;

/// Failure classes every storage error projects onto.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageErrorKind {
    DeviceNotPresent,
    Io,
    UnsupportedFilesystem,
    UnsupportedGeometry,
    DirectoryFull,
}

/// Byte-addressed 512-byte block storage. Offsets are multiples of 512.
pub trait BlockDevice {
    fn read_block(&mut self, offset: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), SdError>;

    /// Writes up to one block; short data is zero padded.
    fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), SdError>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn read_block(&mut self, offset: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), SdError> {
        (**self).read_block(offset, out)
    }

    fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), SdError> {
        (**self).write_block(offset, data)
    }
}

#[cfg(any(test, feature = "ram-disk"))]
pub use ram::{FormatSpec, RamDisk};

#[cfg(any(test, feature = "ram-disk"))]
mod ram {
    use alloc::{vec, vec::Vec};

    use super::{BlockDevice, BLOCK_SIZE};
    use crate::transport::SdError;

    /// Layout of a FAT16 image built by [`RamDisk::format`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FormatSpec {
        pub total_sectors: u32,
        pub sectors_per_cluster: u8,
        pub reserved_sectors: u16,
        pub fat_count: u8,
        pub root_entries: u16,
        pub sectors_per_fat: u16,
        /// Nonzero places an MBR-style outer block in front of the volume.
        pub hidden_sectors: u32,
        pub bytes_per_sector: u16,
        pub fs_type: [u8; 8],
    }

    impl FormatSpec {
        pub fn new(total_sectors: u32) -> Self {
            let entries = total_sectors + 2;
            let sectors_per_fat = (entries * 2).div_ceil(BLOCK_SIZE as u32) as u16;
            Self {
                total_sectors,
                sectors_per_cluster: 1,
                reserved_sectors: 1,
                fat_count: 2,
                root_entries: 16,
                sectors_per_fat,
                hidden_sectors: 0,
                bytes_per_sector: BLOCK_SIZE as u16,
                fs_type: *b"FAT16   ",
            }
        }

        pub fn with_sectors_per_cluster(mut self, value: u8) -> Self {
            self.sectors_per_cluster = value;
            self
        }

        pub fn with_fat_count(mut self, value: u8) -> Self {
            self.fat_count = value;
            self
        }

        pub fn with_root_entries(mut self, value: u16) -> Self {
            self.root_entries = value;
            self
        }

        pub fn with_hidden_sectors(mut self, value: u32) -> Self {
            self.hidden_sectors = value;
            self
        }

        pub fn with_bytes_per_sector(mut self, value: u16) -> Self {
            self.bytes_per_sector = value;
            self
        }

        pub fn with_fs_type(mut self, value: &[u8; 8]) -> Self {
            self.fs_type = *value;
            self
        }

        fn boot_sector(&self) -> [u8; BLOCK_SIZE] {
            let mut raw = [0u8; BLOCK_SIZE];
            raw[0] = 0xEB;
            raw[1] = 0x3C;
            raw[2] = 0x90;
            raw[3..11].copy_from_slice(b"ZAPP1.0 ");
            raw[0x0B..0x0D].copy_from_slice(&self.bytes_per_sector.to_le_bytes());
            raw[0x0D] = self.sectors_per_cluster;
            raw[0x0E..0x10].copy_from_slice(&self.reserved_sectors.to_le_bytes());
            raw[0x10] = self.fat_count;
            raw[0x11..0x13].copy_from_slice(&self.root_entries.to_le_bytes());
            if self.total_sectors <= u16::MAX as u32 {
                raw[0x13..0x15].copy_from_slice(&(self.total_sectors as u16).to_le_bytes());
            } else {
                raw[0x20..0x24].copy_from_slice(&self.total_sectors.to_le_bytes());
            }
            raw[0x15] = 0xF8;
            raw[0x16..0x18].copy_from_slice(&self.sectors_per_fat.to_le_bytes());
            raw[0x1C..0x20].copy_from_slice(&self.hidden_sectors.to_le_bytes());
            raw[0x26] = 0x29;
            raw[0x2B..0x36].copy_from_slice(b"NO NAME    ");
            raw[0x36..0x3E].copy_from_slice(&self.fs_type);
            raw[0x1FE] = 0x55;
            raw[0x1FF] = 0xAA;
            raw
        }
    }

    /// In-memory block device with write-failure injection.
    pub struct RamDisk {
        data: Vec<u8>,
        writes: u32,
        reads: u32,
        fail_writes_after: Option<u32>,
    }

    impl RamDisk {
        pub fn new(blocks: usize) -> Self {
            Self {
                data: vec![0u8; blocks * BLOCK_SIZE],
                writes: 0,
                reads: 0,
                fail_writes_after: None,
            }
        }

        /// Blank FAT16 volume: boot sector, media entries in every FAT copy, empty root.
        pub fn format(spec: FormatSpec) -> Self {
            let blocks = (spec.hidden_sectors + spec.total_sectors) as usize;
            let mut disk = Self::new(blocks);
            let boot = spec.hidden_sectors as usize * BLOCK_SIZE;
            if spec.hidden_sectors != 0 {
                disk.data[0x1C6..0x1CA].copy_from_slice(&spec.hidden_sectors.to_le_bytes());
                disk.data[0x1FE] = 0x55;
                disk.data[0x1FF] = 0xAA;
            }
            disk.data[boot..boot + BLOCK_SIZE].copy_from_slice(&spec.boot_sector());

            let fat_size = spec.sectors_per_fat as usize * BLOCK_SIZE;
            let first_fat = boot + spec.reserved_sectors as usize * BLOCK_SIZE;
            for copy in 0..spec.fat_count as usize {
                let start = first_fat + copy * fat_size;
                disk.data[start..start + 4].copy_from_slice(&[0xF8, 0xFF, 0xFF, 0xFF]);
            }
            disk
        }

        pub fn writes(&self) -> u32 {
            self.writes
        }

        pub fn reads(&self) -> u32 {
            self.reads
        }

        /// Every write after the next `count` successful ones fails.
        pub fn fail_writes_after(&mut self, count: u32) {
            self.fail_writes_after = Some(self.writes + count);
        }

        pub fn clear_faults(&mut self) {
            self.fail_writes_after = None;
        }

        pub fn bytes(&self, offset: u32, len: usize) -> &[u8] {
            &self.data[offset as usize..offset as usize + len]
        }

        pub fn bytes_mut(&mut self, offset: u32, len: usize) -> &mut [u8] {
            &mut self.data[offset as usize..offset as usize + len]
        }

        fn range(&self, offset: u32) -> Result<core::ops::Range<usize>, SdError> {
            if offset % BLOCK_SIZE as u32 != 0 {
                return Err(SdError::MisalignedOffset(offset));
            }
            let start = offset as usize;
            let end = start + BLOCK_SIZE;
            if end > self.data.len() {
                return Err(SdError::OutOfRange(offset));
            }
            Ok(start..end)
        }
    }

    impl BlockDevice for RamDisk {
        fn read_block(&mut self, offset: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), SdError> {
            let range = self.range(offset)?;
            out.copy_from_slice(&self.data[range]);
            self.reads += 1;
            Ok(())
        }

        fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), SdError> {
            if data.len() > BLOCK_SIZE {
                return Err(SdError::OversizedWrite(data.len()));
            }
            let range = self.range(offset)?;
            if self
                .fail_writes_after
                .is_some_and(|limit| self.writes >= limit)
            {
                return Err(SdError::WriteDataRejected(0x0D));
            }
            let block = &mut self.data[range];
            block[..data.len()].copy_from_slice(data);
            block[data.len()..].fill(0);
            self.writes += 1;
            Ok(())
        }
    }
}
