use crate::block::{BlockDevice, BLOCK_SIZE};
use crate::fat::{ChainWriter, DirSlot, Fat16Volume, FileKind, SdFatError, WriteProgress};

pub const WAV_HEADER_LEN: usize = 44;
const WAVE_FORMAT_PCM: u16 = 1;
const FMT_CHUNK_LEN: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    pub const fn new(channels: u16, sample_rate: u32, bits_per_sample: u16) -> Self {
        Self {
            channels,
            sample_rate,
            bits_per_sample,
        }
    }

    pub fn block_align(&self) -> u16 {
        self.channels * self.bits_per_sample.div_ceil(8)
    }

    pub fn byte_rate(&self) -> u32 {
        self.sample_rate * self.block_align() as u32
    }

    /// Canonical RIFF/WAVE header for a file of `total_size` bytes, header included.
    pub fn header(&self, total_size: u32) -> [u8; WAV_HEADER_LEN] {
        let mut out = [0u8; WAV_HEADER_LEN];
        out[0..4].copy_from_slice(b"RIFF");
        out[8..12].copy_from_slice(b"WAVE");
        out[12..16].copy_from_slice(b"fmt ");
        out[16..20].copy_from_slice(&FMT_CHUNK_LEN.to_le_bytes());
        out[20..22].copy_from_slice(&WAVE_FORMAT_PCM.to_le_bytes());
        out[22..24].copy_from_slice(&self.channels.to_le_bytes());
        out[24..28].copy_from_slice(&self.sample_rate.to_le_bytes());
        out[28..32].copy_from_slice(&self.byte_rate().to_le_bytes());
        out[32..34].copy_from_slice(&self.block_align().to_le_bytes());
        out[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        out[36..40].copy_from_slice(b"data");
        patch_sizes(&mut out, total_size);
        out
    }
}

/// Rewrites the RIFF and data chunk sizes in a header that starts `block`.
pub fn patch_sizes(block: &mut [u8], total_size: u32) {
    let riff = total_size.saturating_sub(8);
    let data = total_size.saturating_sub(WAV_HEADER_LEN as u32);
    block[4..8].copy_from_slice(&riff.to_le_bytes());
    block[40..44].copy_from_slice(&data.to_le_bytes());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavSizes {
    pub riff_size: u32,
    pub data_size: u32,
}

pub fn read_sizes(block: &[u8]) -> Option<WavSizes> {
    if block.len() < WAV_HEADER_LEN || &block[0..4] != b"RIFF" || &block[36..40] != b"data" {
        return None;
    }
    let riff_size = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
    let data_size = u32::from_le_bytes([block[40], block[41], block[42], block[43]]);
    Some(WavSizes {
        riff_size,
        data_size,
    })
}

/// Streams audio bytes into a new chain behind a placeholder header, then
/// patches the header once the size is known and only then commits the entry.
pub struct WavWriter {
    chain: ChainWriter,
    format: WavFormat,
    staging: [u8; BLOCK_SIZE],
    fill: usize,
    full: bool,
}

impl WavWriter {
    pub fn start<D: BlockDevice>(
        volume: &mut Fat16Volume<D>,
        format: WavFormat,
    ) -> Result<Option<Self>, SdFatError> {
        let Some(chain) = ChainWriter::start(volume)? else {
            return Ok(None);
        };
        let mut staging = [0u8; BLOCK_SIZE];
        staging[..WAV_HEADER_LEN].copy_from_slice(&format.header(WAV_HEADER_LEN as u32));
        Ok(Some(Self {
            chain,
            format,
            staging,
            fill: WAV_HEADER_LEN,
            full: false,
        }))
    }

    pub fn format(&self) -> WavFormat {
        self.format
    }

    /// Bytes accepted so far, header included.
    pub fn size(&self) -> u32 {
        self.chain.size() + self.fill as u32
    }

    pub fn push<D: BlockDevice>(
        &mut self,
        volume: &mut Fat16Volume<D>,
        mut data: &[u8],
    ) -> Result<WriteProgress, SdFatError> {
        while !data.is_empty() {
            if self.full {
                return Ok(WriteProgress::VolumeFull);
            }
            let take = (BLOCK_SIZE - self.fill).min(data.len());
            self.staging[self.fill..self.fill + take].copy_from_slice(&data[..take]);
            self.fill += take;
            data = &data[take..];
            if self.fill == BLOCK_SIZE {
                self.flush(volume)?;
            }
        }
        Ok(if self.full {
            WriteProgress::VolumeFull
        } else {
            WriteProgress::Written
        })
    }

    pub fn finish<D: BlockDevice>(
        mut self,
        volume: &mut Fat16Volume<D>,
        kind: &FileKind,
    ) -> Result<DirSlot, SdFatError> {
        if self.fill > 0 && !self.full {
            self.flush(volume)?;
        }

        let total = self.chain.size();
        let first = volume.geometry().cluster_byte_offset(self.chain.first_cluster());
        let mut block = [0u8; BLOCK_SIZE];
        volume.read_block(first, &mut block)?;
        patch_sizes(&mut block, total);
        volume.write_block(first, &block)?;
        log::info!(
            "sdfat: wav patched total={} data={}",
            total,
            total.saturating_sub(WAV_HEADER_LEN as u32)
        );

        self.chain.commit(volume, kind)
    }

    fn flush<D: BlockDevice>(&mut self, volume: &mut Fat16Volume<D>) -> Result<(), SdFatError> {
        match self.chain.append(volume, &self.staging[..self.fill])? {
            WriteProgress::Written => {}
            WriteProgress::VolumeFull => self.full = true,
        }
        self.fill = 0;
        Ok(())
    }
}
