use embedded_hal::{digital::OutputPin, spi::SpiBus};

use super::{
    SdError, SdTransport, DATA_TOKEN_POLL_BYTES, R1_POLL_BYTES, SD_CMD13, SD_CMD17, SD_CMD24,
    SD_DATA_ACCEPTED, SD_START_TOKEN, WRITE_BUSY_POLL_BYTES,
};
use crate::block::{BlockDevice, BLOCK_SIZE};

impl<SPI, CS, F> SdTransport<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(),
{
    /// Single command in its own transaction.
    pub(super) fn command(
        &mut self,
        cmd: u8,
        arg: u32,
        crc: u8,
        extra_response: &mut [u8],
    ) -> Result<u8, SdError> {
        self.transaction(|this| this.send_frame(cmd, arg, crc, extra_response))
    }

    /// Sends one command frame with the card already selected and returns R1.
    fn send_frame(
        &mut self,
        cmd: u8,
        arg: u32,
        crc: u8,
        extra_response: &mut [u8],
    ) -> Result<u8, SdError> {
        let arg = arg.to_be_bytes();
        let frame = [0x40 | cmd, arg[0], arg[1], arg[2], arg[3], crc];
        for byte in frame {
            let _ = self.transfer_byte(byte)?;
        }

        let r1 = self
            .poll_byte(R1_POLL_BYTES, |byte| byte & 0x80 == 0)?
            .ok_or(SdError::NoResponse(cmd))?;
        for slot in extra_response {
            *slot = self.transfer_byte(0xFF)?;
        }
        Ok(r1)
    }

    fn read_block_selected(
        &mut self,
        arg: u32,
        out: &mut [u8; BLOCK_SIZE],
    ) -> Result<(), SdError> {
        let r1 = self.send_frame(SD_CMD17, arg, 0xFF, &mut [])?;
        if r1 != 0x00 {
            return Err(SdError::Cmd17Unexpected(r1));
        }

        let token = self
            .poll_byte(DATA_TOKEN_POLL_BYTES, |byte| byte != 0xFF)?
            .ok_or(SdError::DataTokenTimeout(SD_CMD17))?;
        if token != SD_START_TOKEN {
            return Err(SdError::DataTokenUnexpected(SD_CMD17, token));
        }

        out.fill(0xFF);
        self.spi
            .transfer_in_place(out)
            .map_err(|err| SdError::Spi(embedded_hal::spi::Error::kind(&err)))?;
        // CRC16, unchecked in SPI mode.
        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(0xFF)?;
        Ok(())
    }

    fn write_block_selected(&mut self, arg: u32, data: &[u8]) -> Result<(), SdError> {
        let r1 = self.send_frame(SD_CMD24, arg, 0xFF, &mut [])?;
        if r1 != 0x00 {
            return Err(SdError::Cmd24Unexpected(r1));
        }

        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(SD_START_TOKEN)?;
        for &byte in data {
            let _ = self.transfer_byte(byte)?;
        }
        for _ in data.len()..BLOCK_SIZE {
            let _ = self.transfer_byte(0x00)?;
        }
        let _ = self.transfer_byte(0xFF)?;
        let _ = self.transfer_byte(0xFF)?;

        let response = self.transfer_byte(0xFF)? & 0x1F;
        if response != SD_DATA_ACCEPTED {
            return Err(SdError::WriteDataRejected(response));
        }

        if self
            .poll_byte(WRITE_BUSY_POLL_BYTES, |byte| byte == 0xFF)?
            .is_none()
        {
            return Err(SdError::WriteBusyTimeout);
        }

        let mut status = [0u8; 1];
        let r1 = self.send_frame(SD_CMD13, 0, 0xFF, &mut status)?;
        if r1 != 0x00 || status[0] != 0x00 {
            return Err(SdError::StatusNonZero(r1, status[0]));
        }
        Ok(())
    }
}

impl<SPI, CS, F> BlockDevice for SdTransport<SPI, CS, F>
where
    SPI: SpiBus<u8>,
    CS: OutputPin,
    F: FnMut(),
{
    fn read_block(&mut self, offset: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<(), SdError> {
        let arg = self.block_argument(offset)?;
        let result = self.transaction(|this| this.read_block_selected(arg, out));
        if let Err(err) = &result {
            log::warn!("sdcard: read_block offset={} err={:?}", offset, err);
        }
        result
    }

    fn write_block(&mut self, offset: u32, data: &[u8]) -> Result<(), SdError> {
        if data.len() > BLOCK_SIZE {
            return Err(SdError::OversizedWrite(data.len()));
        }
        let arg = self.block_argument(offset)?;
        let result = self.transaction(|this| this.write_block_selected(arg, data));
        if let Err(err) = &result {
            log::warn!("sdcard: write_block offset={} err={:?}", offset, err);
        }
        result
    }
}
