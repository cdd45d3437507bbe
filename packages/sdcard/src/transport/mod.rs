use embedded_hal::{
    digital::OutputPin,
    spi::{Error as _, ErrorKind as SpiErrorKind, SpiBus},
};

use crate::block::StorageErrorKind;

mod init;
mod io;
#[cfg(test)]
mod tests;

const SD_CMD0: u8 = 0;
const SD_CMD8: u8 = 8;
const SD_CMD13: u8 = 13;
const SD_CMD16: u8 = 16;
const SD_CMD17: u8 = 17;
const SD_CMD24: u8 = 24;
const SD_CMD55: u8 = 55;
const SD_ACMD41: u8 = 41;
const SD_CMD58: u8 = 58;

const SD_START_TOKEN: u8 = 0xFE;
const SD_DATA_ACCEPTED: u8 = 0x05;

const CMD0_ATTEMPTS: u32 = 16;
const ACMD41_ATTEMPTS: u32 = 0x1000;
const R1_POLL_BYTES: u32 = 16;
const DATA_TOKEN_POLL_BYTES: u32 = 50_000;
const WRITE_BUSY_POLL_BYTES: u32 = 200_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdCardVersion {
    V1,
    V2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SdCardInfo {
    pub version: SdCardVersion,
    pub high_capacity: bool,
    pub ocr: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SdError {
    Spi(SpiErrorKind),
    ChipSelect,
    Cmd0Failed(u8),
    Cmd8Unexpected(u8),
    Cmd8EchoMismatch([u8; 4]),
    Acmd41Timeout(u8),
    Cmd16Unexpected(u8),
    Cmd58Unexpected(u8),
    Cmd17Unexpected(u8),
    Cmd24Unexpected(u8),
    NoResponse(u8),
    DataTokenTimeout(u8),
    DataTokenUnexpected(u8, u8),
    WriteDataRejected(u8),
    WriteBusyTimeout,
    StatusNonZero(u8, u8),
    MisalignedOffset(u32),
    OutOfRange(u32),
    OversizedWrite(usize),
    NotInitialized,
}

impl SdError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::Cmd0Failed(_)
            | Self::Cmd8Unexpected(_)
            | Self::Cmd8EchoMismatch(_)
            | Self::Acmd41Timeout(_)
            | Self::Cmd16Unexpected(_)
            | Self::Cmd58Unexpected(_)
            | Self::NotInitialized => StorageErrorKind::DeviceNotPresent,
            Self::NoResponse(cmd) if is_negotiation_command(*cmd) => {
                StorageErrorKind::DeviceNotPresent
            }
            _ => StorageErrorKind::Io,
        }
    }
}

fn is_negotiation_command(cmd: u8) -> bool {
    matches!(
        cmd,
        SD_CMD0 | SD_CMD8 | SD_CMD16 | SD_CMD55 | SD_ACMD41 | SD_CMD58
    )
}

/// SD card in SPI mode, one 512-byte block per transaction.
///
/// `feed` runs on every iteration of every polling loop so long negotiations
/// and busy waits never starve the watchdog.
pub struct SdTransport<SPI, CS, F> {
    spi: SPI,
    cs: CS,
    feed: F,
    info: Option<SdCardInfo>,
}

impl<SPI, CS, F> SdTransport<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(),
{
    pub fn new(spi: SPI, cs: CS, feed: F) -> Self {
        Self {
            spi,
            cs,
            feed,
            info: None,
        }
    }

    pub fn info(&self) -> Option<SdCardInfo> {
        self.info
    }

    /// Bus access for clock changes after negotiation.
    pub fn spi_mut(&mut self) -> &mut SPI {
        &mut self.spi
    }

    fn select(&mut self) -> Result<(), SdError> {
        self.cs.set_low().map_err(|_| SdError::ChipSelect)
    }

    /// Raises chip-select and clocks one trailing byte so the card frees MISO.
    fn deselect(&mut self) {
        let _ = self.cs.set_high();
        let _ = self.transfer_byte(0xFF);
    }

    /// Runs `op` with the card selected and deselects on every exit path.
    fn transaction<T>(
        &mut self,
        op: impl FnOnce(&mut Self) -> Result<T, SdError>,
    ) -> Result<T, SdError> {
        if let Err(err) = self.select() {
            self.deselect();
            return Err(err);
        }
        let result = op(self);
        self.deselect();
        result
    }

    fn transfer_byte(&mut self, byte: u8) -> Result<u8, SdError> {
        let mut frame = [byte];
        self.spi
            .transfer_in_place(&mut frame)
            .map_err(|err| SdError::Spi(err.kind()))?;
        Ok(frame[0])
    }

    /// Clocks 0xFF until `accept` matches, feeding the watchdog every byte.
    fn poll_byte(
        &mut self,
        limit: u32,
        accept: impl Fn(u8) -> bool,
    ) -> Result<Option<u8>, SdError> {
        for _ in 0..limit {
            (self.feed)();
            let byte = self.transfer_byte(0xFF)?;
            if accept(byte) {
                return Ok(Some(byte));
            }
        }
        Ok(None)
    }

    fn block_argument(&self, offset: u32) -> Result<u32, SdError> {
        let info = self.info.ok_or(SdError::NotInitialized)?;
        if offset % crate::block::BLOCK_SIZE as u32 != 0 {
            return Err(SdError::MisalignedOffset(offset));
        }
        Ok(if info.high_capacity {
            offset / crate::block::BLOCK_SIZE as u32
        } else {
            offset
        })
    }
}
