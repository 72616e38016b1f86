//! A card that lives in memory and speaks the SPI protocol, used to exercise
//! the driver without hardware.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::mem;
use std::rc::Rc;

use embedded_hal::digital::{self, OutputPin};
use embedded_hal::spi::{self, SpiBus};

use super::bus::{BusClock, ClockControl};
use super::command::*;
use super::csd::set_bits;
use crate::disk::ram::RamDisk;
use crate::disk::{BlockDevice, SECTOR_SIZE};

const DEFAULT_INIT_POLLS: u32 = 3;
const PROGRAMMING_BUSY_BYTES: u32 = 8;
const DATA_ERROR_OUT_OF_RANGE: u8 = 0x08;
const DATA_CRC_ERROR: u8 = 0x0B;
const DATA_WRITE_ERROR: u8 = 0x0D;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EmulatedKind {
    SdHc,
    /// Standard capacity, v2 protocol.
    SdV2,
    SdV1,
    Mmc,
    /// Nothing in the slot, the bus floats high.
    Absent,
}

/// Command as seen by the card.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct LoggedCommand {
    pub index: u8,
    pub argument: u32,
    /// Sent right after an accepted CMD55.
    pub app: bool,
}

enum Phase {
    Command,
    Streaming { next: u32 },
    AwaitToken { sector: u32, multi: bool },
    Receiving { sector: u32, multi: bool, data: Vec<u8> },
}

struct CardModel {
    kind: EmulatedKind,
    disk: RamDisk,
    csd: [u8; 16],
    init_polls: Option<u32>,
    polls_left: Option<u32>,
    /// Extra R1 bits in every answer to ACMD41/CMD1.
    init_fault: u8,
    selected: bool,
    idle: bool,
    app_command: bool,
    frame: Vec<u8>,
    output: VecDeque<u8>,
    busy: u32,
    phase: Phase,
    clock: Option<BusClock>,
    log: Vec<LoggedCommand>,
}

/// Shared handle to the emulated card; [`connect`](Self::connect) hands out
/// the bus and chip select the driver talks to.
#[derive(Clone)]
pub struct EmulatedCard(Rc<RefCell<CardModel>>);

pub struct EmulatedSpi(Rc<RefCell<CardModel>>);

pub struct EmulatedChipSelect(Rc<RefCell<CardModel>>);

impl EmulatedCard {
    pub fn new(kind: EmulatedKind, disk: RamDisk) -> Self {
        let csd = build_csd(kind, disk.num_sectors());
        Self(Rc::new(RefCell::new(CardModel {
            kind,
            disk,
            csd,
            init_polls: Some(DEFAULT_INIT_POLLS),
            polls_left: Some(DEFAULT_INIT_POLLS),
            init_fault: 0,
            selected: false,
            idle: true,
            app_command: false,
            frame: Vec::with_capacity(6),
            output: VecDeque::new(),
            busy: 0,
            phase: Phase::Command,
            clock: None,
            log: Vec::new(),
        })))
    }

    /// Number of initialization polls answered with the idle bit.
    pub fn ready_after(self, polls: u32) -> Self {
        {
            let mut card = self.0.borrow_mut();
            card.init_polls = Some(polls);
            card.polls_left = Some(polls);
        }
        self
    }

    /// The card never leaves the idle state.
    pub fn never_ready(self) -> Self {
        {
            let mut card = self.0.borrow_mut();
            card.init_polls = None;
            card.polls_left = None;
        }
        self
    }

    /// Answers initialization polls with `error` set next to the idle bit.
    pub fn failing_init(self, error: R1) -> Self {
        self.0.borrow_mut().init_fault = error.bits();
        self
    }

    pub fn connect(&self) -> (EmulatedSpi, EmulatedChipSelect) {
        (
            EmulatedSpi(Rc::clone(&self.0)),
            EmulatedChipSelect(Rc::clone(&self.0)),
        )
    }

    pub fn kind(&self) -> EmulatedKind {
        self.0.borrow().kind
    }

    pub fn clock(&self) -> Option<BusClock> {
        self.0.borrow().clock
    }

    pub fn commands(&self) -> Vec<LoggedCommand> {
        self.0.borrow().log.clone()
    }

    /// Copy of the card's storage.
    pub fn image(&self) -> Vec<u8> {
        self.0.borrow().disk.as_slice().to_vec()
    }

    pub fn set_write_protected(&self, protected: bool) {
        self.0.borrow_mut().disk.set_write_protected(protected);
    }
}

fn build_csd(kind: EmulatedKind, sectors: u32) -> [u8; 16] {
    let mut csd = [0u8; 16];
    match kind {
        EmulatedKind::SdHc => {
            set_bits(&mut csd, 127, 126, 1);
            set_bits(&mut csd, 83, 80, 9);
            set_bits(&mut csd, 69, 48, (sectors >> 10).saturating_sub(1));
        }
        _ => {
            // 512 byte blocks, multiplier 512: one C_SIZE unit per 512 sectors.
            set_bits(&mut csd, 83, 80, 9);
            set_bits(&mut csd, 73, 62, (sectors >> 9).saturating_sub(1).min(0xFFF));
            set_bits(&mut csd, 49, 47, 7);
        }
    }
    set_bits(&mut csd, 45, 39, 0x7F);
    set_bits(&mut csd, 25, 22, 9);
    csd[15] = (crc7(&csd[..15]) << 1) | 0x01;
    csd
}

impl CardModel {
    fn select(&mut self, selected: bool) {
        if self.selected && !selected {
            self.output.clear();
            self.frame.clear();
            if let Phase::Streaming { .. } = self.phase {
                self.phase = Phase::Command;
            }
        }
        self.selected = selected;
    }

    fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.selected || self.kind == EmulatedKind::Absent {
            return 0xFF;
        }
        let miso = self.next_output();
        self.consume(mosi);
        miso
    }

    fn next_output(&mut self) -> u8 {
        if let Some(byte) = self.output.pop_front() {
            return byte;
        }
        if self.busy > 0 {
            self.busy -= 1;
            return 0x00;
        }
        if let Phase::Streaming { next } = self.phase {
            self.phase = if self.queue_block(next) {
                Phase::Streaming { next: next + 1 }
            } else {
                Phase::Command
            };
            return self.output.pop_front().unwrap_or(0xFF);
        }
        0xFF
    }

    fn consume(&mut self, mosi: u8) {
        match mem::replace(&mut self.phase, Phase::Command) {
            Phase::AwaitToken { sector, multi } => {
                self.phase = match mosi {
                    TOKEN_START_BLOCK if !multi => Phase::Receiving {
                        sector,
                        multi,
                        data: Vec::with_capacity(SECTOR_SIZE + 2),
                    },
                    TOKEN_START_MULTI_WRITE if multi => Phase::Receiving {
                        sector,
                        multi,
                        data: Vec::with_capacity(SECTOR_SIZE + 2),
                    },
                    TOKEN_STOP_TRAN if multi => {
                        self.busy = PROGRAMMING_BUSY_BYTES;
                        Phase::Command
                    }
                    _ => Phase::AwaitToken { sector, multi },
                };
            }
            Phase::Receiving {
                sector,
                multi,
                mut data,
            } => {
                data.push(mosi);
                if data.len() < SECTOR_SIZE + 2 {
                    self.phase = Phase::Receiving {
                        sector,
                        multi,
                        data,
                    };
                    return;
                }
                let response = self.store_block(sector, &data);
                self.output.push_back(response);
                self.busy = PROGRAMMING_BUSY_BYTES;
                self.phase = if multi && response == DATA_ACCEPTED {
                    Phase::AwaitToken {
                        sector: sector + 1,
                        multi,
                    }
                } else if multi {
                    // Still wait for the stop token after a rejected block.
                    Phase::AwaitToken { sector, multi }
                } else {
                    Phase::Command
                };
            }
            phase => {
                self.phase = phase;
                self.consume_command_byte(mosi);
            }
        }
    }

    fn consume_command_byte(&mut self, mosi: u8) {
        if self.frame.is_empty() && mosi & 0xC0 != 0x40 {
            return;
        }
        self.frame.push(mosi);
        if self.frame.len() == 6 {
            let frame = mem::take(&mut self.frame);
            self.execute(&frame);
        }
    }

    fn execute(&mut self, frame: &[u8]) {
        let index = frame[0] & 0x3F;
        let argument = u32::from_be_bytes([frame[1], frame[2], frame[3], frame[4]]);
        let app = mem::replace(&mut self.app_command, false);
        self.log.push(LoggedCommand {
            index,
            argument,
            app,
        });

        // CRC checking is only on for the commands sent before it can be turned off.
        if (index == CMD0 || index == CMD8) && frame[5] != (crc7(&frame[..5]) << 1) | 0x01 {
            let r1 = self.idle_bit() | R1::CRC_ERROR.bits();
            self.respond(&[r1]);
            return;
        }

        let idle = self.idle_bit();
        let illegal = idle | R1::ILLEGAL_COMMAND.bits();
        match (app, index) {
            (_, CMD0) => {
                self.idle = true;
                self.polls_left = self.init_polls;
                self.phase = Phase::Command;
                self.respond(&[R1::IDLE.bits()]);
            }
            (false, CMD8) => match self.kind {
                EmulatedKind::SdHc | EmulatedKind::SdV2 => {
                    let arg = argument.to_be_bytes();
                    self.respond(&[idle, 0x00, 0x00, arg[2] & 0x0F, arg[3]]);
                }
                _ => self.respond(&[illegal]),
            },
            (false, CMD55) if self.kind != EmulatedKind::Mmc => {
                self.app_command = true;
                self.respond(&[idle]);
            }
            (true, ACMD41) => {
                let r1 = self.poll_init();
                self.respond(&[r1]);
            }
            (false, CMD1) if self.kind == EmulatedKind::Mmc => {
                let r1 = self.poll_init();
                self.respond(&[r1]);
            }
            (false, CMD58) => {
                let mut ocr = 0x00FF_8000u32;
                if !self.idle {
                    ocr |= 0x8000_0000;
                    if self.kind == EmulatedKind::SdHc {
                        ocr |= HCS;
                    }
                }
                let ocr = ocr.to_be_bytes();
                self.respond(&[idle, ocr[0], ocr[1], ocr[2], ocr[3]]);
            }
            _ if self.idle => self.respond(&[illegal]),
            (false, CMD9) => {
                self.respond(&[0x00]);
                let csd = self.csd;
                self.queue_data(&csd);
            }
            (false, CMD12) => {
                self.phase = Phase::Command;
                self.respond(&[0x00]);
                self.busy = 2;
            }
            (false, CMD16) => {
                if argument == SECTOR_SIZE as u32 {
                    self.respond(&[0x00]);
                } else {
                    self.respond(&[R1::PARAMETER_ERROR.bits()]);
                }
            }
            (false, CMD17) | (false, CMD18) | (false, CMD24) | (false, CMD25) => {
                let sector = match self.sector(argument) {
                    Some(sector) => sector,
                    None => {
                        self.respond(&[R1::ADDRESS_ERROR.bits()]);
                        return;
                    }
                };
                self.respond(&[0x00]);
                match index {
                    CMD17 => {
                        self.queue_block(sector);
                    }
                    CMD18 => self.phase = Phase::Streaming { next: sector },
                    CMD24 => {
                        self.phase = Phase::AwaitToken {
                            sector,
                            multi: false,
                        }
                    }
                    _ => {
                        self.phase = Phase::AwaitToken {
                            sector,
                            multi: true,
                        }
                    }
                }
            }
            (true, ACMD23) => self.respond(&[0x00]),
            _ => self.respond(&[illegal]),
        }
    }

    fn idle_bit(&self) -> u8 {
        if self.idle {
            R1::IDLE.bits()
        } else {
            0
        }
    }

    fn poll_init(&mut self) -> u8 {
        if self.idle {
            match self.polls_left {
                Some(0) => self.idle = false,
                Some(n) => self.polls_left = Some(n - 1),
                None => {}
            }
        }
        self.idle_bit() | self.init_fault
    }

    fn sector(&self, argument: u32) -> Option<u32> {
        let sector = if self.kind == EmulatedKind::SdHc {
            argument
        } else if argument % SECTOR_SIZE as u32 == 0 {
            argument / SECTOR_SIZE as u32
        } else {
            return None;
        };
        if sector < self.disk.num_sectors() {
            Some(sector)
        } else {
            None
        }
    }

    fn respond(&mut self, bytes: &[u8]) {
        self.output.clear();
        // One byte of command response time.
        self.output.push_back(0xFF);
        self.output.extend(bytes.iter().copied());
    }

    fn queue_block(&mut self, sector: u32) -> bool {
        let mut block = [0u8; SECTOR_SIZE];
        if sector >= self.disk.num_sectors() || self.disk.read(&mut block, sector, 1).is_err() {
            self.output.push_back(0xFF);
            self.output.push_back(DATA_ERROR_OUT_OF_RANGE);
            return false;
        }
        self.queue_data(&block);
        true
    }

    fn queue_data(&mut self, data: &[u8]) {
        self.output.push_back(0xFF);
        self.output.push_back(TOKEN_START_BLOCK);
        self.output.extend(data.iter().copied());
        self.output.extend(crc16(data).to_be_bytes().iter().copied());
    }

    fn store_block(&mut self, sector: u32, data: &[u8]) -> u8 {
        let (block, crc) = data.split_at(SECTOR_SIZE);
        if crc16(block).to_be_bytes() != [crc[0], crc[1]] {
            return DATA_CRC_ERROR;
        }
        if sector >= self.disk.num_sectors() {
            return DATA_WRITE_ERROR;
        }
        match self.disk.write(block, sector, 1) {
            Ok(()) => DATA_ACCEPTED,
            Err(_) => DATA_WRITE_ERROR,
        }
    }
}

impl spi::ErrorType for EmulatedSpi {
    type Error = Infallible;
}

impl SpiBus<u8> for EmulatedSpi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(0xFF);
        }
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for &word in words {
            card.exchange(word);
        }
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for i in 0..read.len().max(write.len()) {
            let miso = card.exchange(write.get(i).copied().unwrap_or(0xFF));
            if let Some(slot) = read.get_mut(i) {
                *slot = miso;
            }
        }
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Self::Error> {
        let mut card = self.0.borrow_mut();
        for word in words.iter_mut() {
            *word = card.exchange(*word);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

impl ClockControl for EmulatedSpi {
    fn set_clock(&mut self, clock: BusClock) {
        trace!("emulated card clocked at {} Hz", clock.hz());
        self.0.borrow_mut().clock = Some(clock);
    }
}

impl digital::ErrorType for EmulatedChipSelect {
    type Error = Infallible;
}

impl OutputPin for EmulatedChipSelect {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(true);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().select(false);
        Ok(())
    }
}
