use std::{cell::RefCell, collections::HashMap, collections::VecDeque, rc::Rc, vec::Vec};

use embedded_hal::{digital, spi};

use super::*;
use crate::block::{BlockDevice, StorageErrorKind, BLOCK_SIZE};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    AwaitToken(u32),
    Receive(u32),
}

struct CardModel {
    present: bool,
    version: SdCardVersion,
    high_capacity: bool,
    idle_polls: u32,
    selected: bool,
    app_command: bool,
    frame: Vec<u8>,
    tx: VecDeque<u8>,
    mode: Mode,
    incoming: Vec<u8>,
    blocks: HashMap<u32, [u8; BLOCK_SIZE]>,
    write_response: u8,
    status_after_write: u8,
    read_token: u8,
    commands: Vec<(u8, u32)>,
}

impl CardModel {
    fn new() -> Self {
        Self {
            present: true,
            version: SdCardVersion::V2,
            high_capacity: false,
            idle_polls: 3,
            selected: false,
            app_command: false,
            frame: Vec::new(),
            tx: VecDeque::new(),
            mode: Mode::Command,
            incoming: Vec::new(),
            blocks: HashMap::new(),
            write_response: 0xE5,
            status_after_write: 0x00,
            read_token: 0xFE,
            commands: Vec::new(),
        }
    }

    fn block_offset(&self, arg: u32) -> u32 {
        if self.high_capacity {
            arg * BLOCK_SIZE as u32
        } else {
            arg
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.tx.push_back(0xFF);
        self.tx.extend(bytes.iter().copied());
    }

    fn handle_command(&mut self, cmd: u8, arg: u32) {
        self.commands.push((cmd, arg));
        let app = core::mem::replace(&mut self.app_command, false);
        match (cmd, app) {
            (0, _) => self.respond(&[0x01]),
            (8, _) => match self.version {
                SdCardVersion::V2 => {
                    let echo = arg.to_be_bytes();
                    self.respond(&[0x01, 0x00, 0x00, echo[2], echo[3]]);
                }
                SdCardVersion::V1 => self.respond(&[0x05]),
            },
            (55, _) => {
                self.app_command = true;
                self.respond(&[0x01]);
            }
            (41, true) => {
                if self.idle_polls > 0 {
                    self.idle_polls -= 1;
                    self.respond(&[0x01]);
                } else {
                    self.respond(&[0x00]);
                }
            }
            (16, _) => self.respond(&[0x00]),
            (58, _) => {
                let ocr0 = if self.high_capacity { 0xC0 } else { 0x80 };
                self.respond(&[0x00, ocr0, 0xFF, 0x80, 0x00]);
            }
            (17, _) => {
                let offset = self.block_offset(arg);
                let block = self
                    .blocks
                    .get(&offset)
                    .copied()
                    .unwrap_or([0u8; BLOCK_SIZE]);
                self.respond(&[0x00, 0xFF, 0xFF, self.read_token]);
                if self.read_token == 0xFE {
                    self.tx.extend(block.iter().copied());
                    self.tx.extend([0x12, 0x34]);
                }
            }
            (24, _) => {
                self.respond(&[0x00]);
                self.mode = Mode::AwaitToken(self.block_offset(arg));
            }
            (13, _) => self.respond(&[0x00, self.status_after_write]),
            _ => self.respond(&[0x04]),
        }
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected || !self.present {
            return 0xFF;
        }
        let miso = self.tx.pop_front().unwrap_or(0xFF);
        match self.mode {
            Mode::Command => {
                if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
                    return miso;
                }
                self.frame.push(mosi);
                if self.frame.len() == 6 {
                    let cmd = self.frame[0] & 0x3F;
                    let arg = u32::from_be_bytes([
                        self.frame[1],
                        self.frame[2],
                        self.frame[3],
                        self.frame[4],
                    ]);
                    self.frame.clear();
                    self.handle_command(cmd, arg);
                }
            }
            Mode::AwaitToken(offset) => {
                if mosi == 0xFE {
                    self.mode = Mode::Receive(offset);
                    self.incoming.clear();
                }
            }
            Mode::Receive(offset) => {
                self.incoming.push(mosi);
                if self.incoming.len() == BLOCK_SIZE + 2 {
                    let mut block = [0u8; BLOCK_SIZE];
                    block.copy_from_slice(&self.incoming[..BLOCK_SIZE]);
                    if self.write_response & 0x1F == 0x05 {
                        self.blocks.insert(offset, block);
                    }
                    self.tx.push_back(self.write_response);
                    self.tx.extend([0x00, 0x00, 0x00]);
                    self.mode = Mode::Command;
                }
            }
        }
        miso
    }
}

#[derive(Clone)]
struct SimBus(Rc<RefCell<CardModel>>);

struct SimCs(Rc<RefCell<CardModel>>);

impl spi::ErrorType for SimBus {
    type Error = spi::ErrorKind;
}

impl spi::SpiBus<u8> for SimBus {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words {
            *word = card.exchange(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for &word in words {
            let _ = card.exchange(word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for (index, slot) in read.iter_mut().enumerate() {
            *slot = card.exchange(write.get(index).copied().unwrap_or(0xFF));
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words {
            *word = card.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl digital::ErrorType for SimCs {
    type Error = core::convert::Infallible;
}

impl digital::OutputPin for SimCs {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().selected = true;
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        card.selected = false;
        card.frame.clear();
        card.tx.clear();
        card.mode = Mode::Command;
        Ok(())
    }
}

type SimTransport<'a> = SdTransport<SimBus, SimCs, &'a mut dyn FnMut()>;

fn transport<'a>(bus: SimBus, cs: SimCs, feed: &'a mut dyn FnMut()) -> SimTransport<'a> {
    SdTransport::new(bus, cs, feed)
}

fn sim_card(model: CardModel) -> (Rc<RefCell<CardModel>>, SimBus, SimCs) {
    let card = Rc::new(RefCell::new(model));
    (card.clone(), SimBus(card.clone()), SimCs(card))
}

#[test]
fn reset_negotiates_v2_byte_addressed_card() {
    let (card, bus, cs) = sim_card(CardModel::new());
    let mut feeds = 0u32;
    let mut feed = || feeds += 1;
    let mut sd = transport(bus, cs, &mut feed);

    let info = sd.reset().expect("reset");
    assert_eq!(info.version, SdCardVersion::V2);
    assert!(!info.high_capacity);
    assert!(sd.is_initialized());
    drop(sd);

    assert!(feeds > 0);
    let card = card.borrow();
    assert!(!card.selected);
    let acmd41_args: Vec<u32> = card
        .commands
        .iter()
        .filter(|(cmd, _)| *cmd == 41)
        .map(|(_, arg)| *arg)
        .collect();
    assert_eq!(acmd41_args.len(), 4);
    assert!(acmd41_args.iter().all(|arg| *arg == 1 << 30));
    assert!(card.commands.contains(&(8, 0x1AA)));
}

#[test]
fn reset_detects_v1_card_and_sets_block_length() {
    let mut model = CardModel::new();
    model.version = SdCardVersion::V1;
    let (card, bus, cs) = sim_card(model);
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);

    let info = sd.reset().expect("reset");
    assert_eq!(info.version, SdCardVersion::V1);
    assert!(!info.high_capacity);
    assert!(card.borrow().commands.contains(&(16, 512)));
}

#[test]
fn absent_card_reports_device_not_present_and_releases_bus() {
    let mut model = CardModel::new();
    model.present = false;
    let (card, bus, cs) = sim_card(model);
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);

    let err = sd.reset().expect_err("absent card");
    assert!(matches!(err, SdError::Cmd0Failed(0xFF)));
    assert_eq!(err.kind(), StorageErrorKind::DeviceNotPresent);
    assert!(!card.borrow().selected);
}

#[test]
fn card_stuck_idle_times_out_acmd41() {
    let mut model = CardModel::new();
    model.idle_polls = u32::MAX;
    let (_card, bus, cs) = sim_card(model);
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);

    let err = sd.reset().expect_err("never leaves idle");
    assert!(matches!(err, SdError::Acmd41Timeout(0x01)));
    assert_eq!(err.kind(), StorageErrorKind::DeviceNotPresent);
}

#[test]
fn short_write_reads_back_zero_padded() {
    let (card, bus, cs) = sim_card(CardModel::new());
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);
    sd.reset().expect("reset");

    let payload: Vec<u8> = (1..=100u8).collect();
    sd.write_block(1024, &payload).expect("write");
    let mut out = [0xAAu8; BLOCK_SIZE];
    sd.read_block(1024, &mut out).expect("read");

    assert_eq!(&out[..100], payload.as_slice());
    assert!(out[100..].iter().all(|byte| *byte == 0));
    assert!(card.borrow().commands.contains(&(13, 0)));
    assert!(!card.borrow().selected);
}

#[test]
fn high_capacity_card_uses_block_numbers() {
    let mut model = CardModel::new();
    model.high_capacity = true;
    let (card, bus, cs) = sim_card(model);
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);
    assert!(sd.reset().expect("reset").high_capacity);

    sd.write_block(3 * 512, &[7u8; BLOCK_SIZE]).expect("write");
    assert!(card.borrow().commands.contains(&(24, 3)));
    let mut out = [0u8; BLOCK_SIZE];
    sd.read_block(3 * 512, &mut out).expect("read");
    assert_eq!(out, [7u8; BLOCK_SIZE]);
}

#[test]
fn rejected_data_response_is_io_error_and_deselects() {
    let mut model = CardModel::new();
    model.write_response = 0xEB;
    let (card, bus, cs) = sim_card(model);
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);
    sd.reset().expect("reset");

    let err = sd.write_block(0, &[1, 2, 3]).expect_err("rejected");
    assert!(matches!(err, SdError::WriteDataRejected(0x0B)));
    assert_eq!(err.kind(), StorageErrorKind::Io);
    assert!(!card.borrow().selected);
}

#[test]
fn nonzero_status_after_write_fails() {
    let mut model = CardModel::new();
    model.status_after_write = 0x04;
    let (_card, bus, cs) = sim_card(model);
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);
    sd.reset().expect("reset");

    let err = sd.write_block(512, &[0u8; 16]).expect_err("status");
    assert!(matches!(err, SdError::StatusNonZero(0x00, 0x04)));
}

#[test]
fn missing_start_token_times_out() {
    let mut model = CardModel::new();
    model.read_token = 0xFF;
    let (card, bus, cs) = sim_card(model);
    let mut feeds = 0u32;
    let mut feed = || feeds += 1;
    let mut sd = transport(bus, cs, &mut feed);
    sd.reset().expect("reset");

    let mut out = [0u8; BLOCK_SIZE];
    let err = sd.read_block(0, &mut out).expect_err("no token");
    assert!(matches!(err, SdError::DataTokenTimeout(17)));
    drop(sd);
    assert!(feeds >= DATA_TOKEN_POLL_BYTES);
    assert!(!card.borrow().selected);
}

#[test]
fn misaligned_and_oversized_requests_are_refused() {
    let (_card, bus, cs) = sim_card(CardModel::new());
    let mut feed = || {};
    let mut sd = transport(bus, cs, &mut feed);

    let mut out = [0u8; BLOCK_SIZE];
    assert!(matches!(
        sd.read_block(0, &mut out),
        Err(SdError::NotInitialized)
    ));
    sd.reset().expect("reset");
    assert!(matches!(
        sd.read_block(100, &mut out),
        Err(SdError::MisalignedOffset(100))
    ));
    assert!(matches!(
        sd.write_block(0, &[0u8; BLOCK_SIZE + 1]),
        Err(SdError::OversizedWrite(513))
    ));
}
