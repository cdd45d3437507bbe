use embedded_hal::{digital::OutputPin, spi::SpiBus};

use super::{
    SdCardInfo, SdCardVersion, SdError, SdTransport, ACMD41_ATTEMPTS, CMD0_ATTEMPTS, SD_ACMD41,
    SD_CMD0, SD_CMD16, SD_CMD55, SD_CMD58, SD_CMD8,
};
use crate::block::BLOCK_SIZE;

const CMD8_CHECK_PATTERN: u32 = 0x0000_01AA;
const ACMD41_HCS: u32 = 1 << 30;
const OCR_CCS: u8 = 0x40;
const R1_IDLE: u8 = 0x01;
const R1_ILLEGAL_COMMAND: u8 = 0x04;

impl<SPI, CS, F> SdTransport<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(),
{
    /// Puts the card in SPI mode and negotiates voltage and addressing.
    pub fn reset(&mut self) -> Result<SdCardInfo, SdError> {
        self.info = None;
        self.cs.set_high().map_err(|_| SdError::ChipSelect)?;
        for _ in 0..10 {
            (self.feed)();
            let _ = self.transfer_byte(0xFF)?;
        }

        let mut cmd0_r1 = 0xFFu8;
        for _ in 0..CMD0_ATTEMPTS {
            (self.feed)();
            cmd0_r1 = match self.command(SD_CMD0, 0, 0x95, &mut []) {
                Ok(r1) => r1,
                Err(SdError::NoResponse(_)) => 0xFF,
                Err(err) => return Err(err),
            };
            if cmd0_r1 == R1_IDLE {
                break;
            }
        }
        if cmd0_r1 != R1_IDLE {
            log::warn!("sdcard: reset cmd0_r1=0x{:02x}", cmd0_r1);
            return Err(SdError::Cmd0Failed(cmd0_r1));
        }

        let mut r7 = [0u8; 4];
        let cmd8_r1 = self.command(SD_CMD8, CMD8_CHECK_PATTERN, 0x87, &mut r7)?;
        let version = if cmd8_r1 == R1_IDLE {
            if r7[2] != 0x01 || r7[3] != 0xAA {
                return Err(SdError::Cmd8EchoMismatch(r7));
            }
            SdCardVersion::V2
        } else if cmd8_r1 & R1_ILLEGAL_COMMAND != 0 {
            SdCardVersion::V1
        } else {
            return Err(SdError::Cmd8Unexpected(cmd8_r1));
        };

        let acmd41_arg = match version {
            SdCardVersion::V2 => ACMD41_HCS,
            SdCardVersion::V1 => 0,
        };
        let mut acmd41_r1 = 0xFFu8;
        for _ in 0..ACMD41_ATTEMPTS {
            (self.feed)();
            let _ = self.command(SD_CMD55, 0, 0x65, &mut [])?;
            acmd41_r1 = self.command(SD_ACMD41, acmd41_arg, 0x77, &mut [])?;
            if acmd41_r1 == 0x00 {
                break;
            }
        }
        if acmd41_r1 != 0x00 {
            log::warn!("sdcard: reset acmd41_r1=0x{:02x}", acmd41_r1);
            return Err(SdError::Acmd41Timeout(acmd41_r1));
        }

        if version == SdCardVersion::V1 {
            let cmd16_r1 = self.command(SD_CMD16, BLOCK_SIZE as u32, 0xFF, &mut [])?;
            if cmd16_r1 != 0x00 {
                return Err(SdError::Cmd16Unexpected(cmd16_r1));
            }
        }

        let mut ocr = [0u8; 4];
        let cmd58_r1 = self.command(SD_CMD58, 0, 0xFD, &mut ocr)?;
        if cmd58_r1 != 0x00 {
            return Err(SdError::Cmd58Unexpected(cmd58_r1));
        }
        let high_capacity = version == SdCardVersion::V2 && ocr[0] & OCR_CCS != 0;

        let info = SdCardInfo {
            version,
            high_capacity,
            ocr: u32::from_be_bytes(ocr),
        };
        log::info!(
            "sdcard: ready version={:?} high_capacity={} ocr=0x{:08x}",
            info.version,
            info.high_capacity,
            info.ocr
        );
        self.info = Some(info);
        Ok(info)
    }

    pub fn is_initialized(&self) -> bool {
        self.info.is_some()
    }
}
