use core::ops::ControlFlow;

use super::{Fat16Volume, SdFatError, DIR_ENTRY_SIZE};
use crate::block::{BlockDevice, BLOCK_SIZE};

const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;
const ATTR_VOLUME: u8 = 0x08;
const ATTR_LONG_NAME: u8 = 0x0F;
const ATTR_ARCHIVE: u8 = 0x20;
const SUFFIX_MIN_DIGITS: usize = 3;
const SUFFIX_MAX_DIGITS: usize = 4;

pub const FILE_SUFFIX_MAX: u16 = 9999;

/// Fixed 4-byte name prefix and extension shared by all files of one data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileKind {
    pub prefix: [u8; 4],
    pub extension: [u8; 3],
}

impl FileKind {
    pub const fn new(prefix: &[u8; 4], extension: &[u8; 3]) -> Self {
        Self {
            prefix: *prefix,
            extension: *extension,
        }
    }

    /// 8.3 name field, e.g. `DATA001 WAV`.
    pub fn short_name(&self, suffix: u16) -> Result<[u8; 11], SdFatError> {
        if suffix > FILE_SUFFIX_MAX {
            return Err(SdFatError::SuffixExhausted);
        }
        let mut name = [b' '; 11];
        name[..4].copy_from_slice(&self.prefix);
        let digits = if suffix > 999 {
            SUFFIX_MAX_DIGITS
        } else {
            SUFFIX_MIN_DIGITS
        };
        let mut value = suffix;
        for slot in name[4..4 + digits].iter_mut().rev() {
            *slot = b'0' + (value % 10) as u8;
            value /= 10;
        }
        name[8..].copy_from_slice(&self.extension);
        Ok(name)
    }

    /// Decimal suffix of `name` when it carries this prefix, `None` when malformed.
    pub fn parse_suffix(&self, name: &[u8]) -> Option<u16> {
        if name.len() < 8 || name[..4] != self.prefix {
            return None;
        }
        let field = &name[4..8];
        let digits = field.iter().take_while(|byte| byte.is_ascii_digit()).count();
        if digits < SUFFIX_MIN_DIGITS || field[digits..].iter().any(|byte| *byte != b' ') {
            return None;
        }
        Some(
            field[..digits]
                .iter()
                .fold(0u16, |acc, byte| acc * 10 + (byte - b'0') as u16),
        )
    }
}

/// Where a committed directory entry landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirSlot {
    pub block_offset: u32,
    pub index: usize,
    pub name: [u8; 11],
}

impl DirSlot {
    /// `DATA001.WAV` form of the stored name.
    pub fn display_name(&self) -> heapless::String<12> {
        let mut text = heapless::String::new();
        let stem = self.name[..8].iter().take_while(|byte| **byte != b' ');
        let extension = self.name[8..].iter().take_while(|byte| **byte != b' ');
        for byte in stem {
            let _ = text.push(*byte as char);
        }
        let _ = text.push('.');
        for byte in extension {
            let _ = text.push(*byte as char);
        }
        text
    }
}

impl<D: BlockDevice> Fat16Volume<D> {
    /// Writes a file record into the first never-used or deleted root slot.
    pub fn commit_directory_entry(
        &mut self,
        start_cluster: u16,
        size: u32,
        suffix: u16,
        kind: &FileKind,
    ) -> Result<DirSlot, SdFatError> {
        let name = kind.short_name(suffix)?;
        let found = self.scan_directory(|block_offset, index, entry| {
            if entry[0] == ENTRY_END || entry[0] == ENTRY_DELETED {
                ControlFlow::Break((block_offset, index))
            } else {
                ControlFlow::Continue(())
            }
        })?;
        let Some((block_offset, index)) = found else {
            log::warn!("sdfat: directory full start_cluster={} size={}", start_cluster, size);
            return Err(SdFatError::DirFull);
        };

        let mut block = [0u8; BLOCK_SIZE];
        self.read_block(block_offset, &mut block)?;
        let base = index * DIR_ENTRY_SIZE;
        let entry = &mut block[base..base + DIR_ENTRY_SIZE];
        entry.fill(0);
        entry[..11].copy_from_slice(&name);
        entry[11] = ATTR_ARCHIVE;
        entry[26..28].copy_from_slice(&start_cluster.to_le_bytes());
        entry[28..32].copy_from_slice(&size.to_le_bytes());
        self.write_block(block_offset, &block)?;

        let slot = DirSlot {
            block_offset,
            index,
            name,
        };
        log::info!(
            "sdfat: commit name={} start_cluster={} size={}",
            slot.display_name(),
            start_cluster,
            size
        );
        Ok(slot)
    }

    /// One past the highest suffix among live entries of `kind`; 1 when none exist.
    pub fn next_file_suffix(&mut self, kind: &FileKind) -> Result<u16, SdFatError> {
        let mut highest = 0u16;
        self.scan_directory(|_, _, entry| {
            match entry[0] {
                ENTRY_END => return ControlFlow::Break(()),
                ENTRY_DELETED => return ControlFlow::Continue(()),
                _ => {}
            }
            let attr = entry[11];
            if attr == ATTR_LONG_NAME || attr & ATTR_VOLUME != 0 {
                return ControlFlow::Continue(());
            }
            if let Some(suffix) = kind.parse_suffix(&entry[..11]) {
                highest = highest.max(suffix);
            }
            ControlFlow::Continue(())
        })?;
        if highest >= FILE_SUFFIX_MAX {
            return Err(SdFatError::SuffixExhausted);
        }
        Ok(highest + 1)
    }

    /// Visits root directory entries in order until `visit` breaks.
    fn scan_directory<T>(
        &mut self,
        mut visit: impl FnMut(u32, usize, &[u8]) -> ControlFlow<T>,
    ) -> Result<Option<T>, SdFatError> {
        let mut block = [0u8; BLOCK_SIZE];
        let entries = self.geometry.root_entry_count as usize;
        let per_block = BLOCK_SIZE / DIR_ENTRY_SIZE;

        for block_index in 0..self.geometry.dir_table_blocks() {
            let block_offset = self.geometry.dir_table_offset + block_index * BLOCK_SIZE as u32;
            self.read_block(block_offset, &mut block)?;
            for index in 0..per_block {
                if block_index as usize * per_block + index >= entries {
                    return Ok(None);
                }
                let base = index * DIR_ENTRY_SIZE;
                if let ControlFlow::Break(value) =
                    visit(block_offset, index, &block[base..base + DIR_ENTRY_SIZE])
                {
                    return Ok(Some(value));
                }
            }
        }
        Ok(None)
    }
}
