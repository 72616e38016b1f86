//! SD/MMC card driver speaking the SPI mode protocol.

pub mod bus;
pub mod command;
pub mod csd;
pub mod emulated;

use std::fmt;

use embedded_hal::digital::OutputPin;
use embedded_hal::spi::{Error as _, ErrorKind, SpiBus};
use thiserror::Error;

pub use self::bus::{BusClock, ClockControl};
use self::command::*;
pub use self::csd::{Csd, CsdVersion};
use crate::disk::{
    check_transfer, BlockDevice, DiskError, DiskResult, DiskStatus, IoctlCommand, SECTOR_SIZE,
};

/// What a bounded poll was waiting for when it gave up.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Wait {
    /// Card kept the data line low.
    Ready,
    /// No R1 arrived for the given command.
    Response(u8),
    /// Card never left the idle state.
    Initialization,
    DataToken,
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "card ready"),
            Self::Response(cmd) => write!(f, "response to CMD{}", cmd),
            Self::Initialization => write!(f, "card initialization"),
            Self::DataToken => write!(f, "data token"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SdError {
    #[error("no card answered the reset command")]
    NoCard,
    #[error("timed out waiting for {0}")]
    Timeout(Wait),
    #[error("CMD{command} failed with R1 {response:?}")]
    CommandFailed { command: u8, response: R1 },
    #[error("unexpected data token {0:#04x}")]
    DataToken(u8),
    #[error("card rejected data block (response {0:#04x})")]
    DataRejected(u8),
    #[error("data block CRC mismatch")]
    DataCrc,
    #[error("unsupported card")]
    Unsupported,
    #[error("card not initialized")]
    NotInitialized,
    #[error("sector {0} is beyond the card's address space")]
    AddressOutOfRange(u32),
    #[error("buffer of {0} bytes is not a whole number of blocks")]
    BufferSize(usize),
    #[error("SPI bus error: {0:?}")]
    Bus(ErrorKind),
    #[error("chip select error")]
    ChipSelect,
}

fn bus_error<E: embedded_hal::spi::Error>(e: E) -> SdError {
    SdError::Bus(e.kind())
}

fn expect_ready(command: u8, response: R1) -> Result<(), SdError> {
    if response.is_empty() {
        Ok(())
    } else {
        Err(SdError::CommandFailed { command, response })
    }
}

/// Retry counts and poll budgets of the driver.
#[derive(Debug, Clone)]
pub struct SdConfig {
    /// Bytes clocked with chip select released before the first command.
    pub idle_clock_bytes: usize,
    pub reset_retries: u32,
    /// ACMD41/CMD1 attempts before the card is considered stuck in idle.
    pub init_retries: u32,
    pub response_polls: u32,
    pub ready_timeout_ms: u32,
    /// How many bytes the bus moves in a millisecond, used to turn
    /// `ready_timeout_ms` into a poll count.
    pub ready_polls_per_ms: u32,
    pub data_token_polls: u32,
    pub verify_data_crc: bool,
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            idle_clock_bytes: 10,
            reset_retries: 20,
            init_retries: 1000,
            response_polls: 200,
            ready_timeout_ms: 500,
            ready_polls_per_ms: 10,
            data_token_polls: 100_000,
            verify_data_crc: false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CardState {
    Uninitialized,
    IdleNegotiating,
    Ready,
    /// An I/O failure happened, bring-up has to run again.
    Error,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CardType {
    Mmc,
    SdV1,
    /// Standard capacity card speaking the v2 protocol.
    SdV2,
    /// High or extended capacity, block addressed.
    SdHc,
}

impl CardType {
    pub fn is_block_addressed(self) -> bool {
        matches!(self, Self::SdHc)
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Mmc => "MMC",
            Self::SdV1 => "SD v1",
            Self::SdV2 => "SDSC v2",
            Self::SdHc => "SDHC/SDXC",
        };
        f.write_str(name)
    }
}

pub struct SdCard<SPI, CS> {
    spi: SPI,
    cs: CS,
    config: SdConfig,
    state: CardState,
    card_type: Option<CardType>,
    ocr: Option<u32>,
    csd: Option<Csd>,
    write_protected: bool,
    /// Nothing answered the last reset.
    no_card: bool,
}

impl<SPI, CS> SdCard<SPI, CS>
where
    SPI: SpiBus<u8> + ClockControl,
    CS: OutputPin,
{
    pub fn new(spi: SPI, cs: CS) -> Self {
        Self::with_config(spi, cs, SdConfig::default())
    }

    pub fn with_config(spi: SPI, cs: CS, config: SdConfig) -> Self {
        Self {
            spi,
            cs,
            config,
            state: CardState::Uninitialized,
            card_type: None,
            ocr: None,
            csd: None,
            write_protected: false,
            no_card: false,
        }
    }

    pub fn state(&self) -> CardState {
        self.state
    }

    pub fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    pub fn csd(&self) -> Option<&Csd> {
        self.csd.as_ref()
    }

    /// OCR register, only read from v2 cards.
    pub fn ocr(&self) -> Option<u32> {
        self.ocr
    }

    /// Reflects a write protect switch, if the board has one.
    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    pub fn release(self) -> (SPI, CS) {
        (self.spi, self.cs)
    }

    /// Runs the full bring-up sequence and returns the detected card type.
    pub fn init(&mut self) -> Result<CardType, SdError> {
        self.state = CardState::Uninitialized;
        self.card_type = None;
        self.ocr = None;
        self.csd = None;
        self.no_card = false;

        match self.bring_up() {
            Ok(card_type) => {
                self.card_type = Some(card_type);
                self.state = CardState::Ready;
                Ok(card_type)
            }
            Err(e) => {
                self.state = CardState::Error;
                self.no_card = matches!(e, SdError::NoCard);
                // The bring-up error is the one worth reporting.
                let _ = self.cs.set_high();
                Err(e)
            }
        }
    }

    /// Forgets the card, the next use requires [`init`](Self::init).
    pub fn deinit(&mut self) -> Result<(), SdError> {
        self.state = CardState::Uninitialized;
        self.no_card = false;
        self.card_type = None;
        self.ocr = None;
        self.csd = None;
        self.spi.set_clock(BusClock::Initialization);
        self.cs.set_high().map_err(|_| SdError::ChipSelect)
    }

    pub fn read_blocks(&mut self, buf: &mut [u8], sector: u32) -> Result<(), SdError> {
        let count = block_count(buf.len())?;
        let address = self.address(sector)?;
        trace!("read {} block(s) at sector {}", count, sector);

        self.select()?;
        let result = if count == 1 {
            self.read_single(address, buf)
        } else {
            self.read_multiple(address, buf)
        };
        let release = self.deselect();
        self.settle(result.and(release))
    }

    pub fn write_blocks(&mut self, buf: &[u8], sector: u32) -> Result<(), SdError> {
        let count = block_count(buf.len())?;
        let address = self.address(sector)?;
        trace!("write {} block(s) at sector {}", count, sector);

        self.select()?;
        let result = if count == 1 {
            self.write_single(address, buf)
        } else {
            self.write_multiple(address, buf, count)
        };
        let release = self.deselect();
        self.settle(result.and(release))
    }

    /// Waits until the card finished programming.
    pub fn flush(&mut self) -> Result<(), SdError> {
        if self.state != CardState::Ready {
            return Err(SdError::NotInitialized);
        }
        self.select()?;
        let result = self.wait_ready();
        let release = self.deselect();
        self.settle(result.and(release))
    }

    pub fn sector_count(&self) -> Result<u32, SdError> {
        self.csd
            .as_ref()
            .ok_or(SdError::NotInitialized)?
            .sector_count()
            .ok_or(SdError::Unsupported)
    }

    fn bring_up(&mut self) -> Result<CardType, SdError> {
        self.spi.set_clock(BusClock::Initialization);
        self.cs.set_high().map_err(|_| SdError::ChipSelect)?;
        for _ in 0..self.config.idle_clock_bytes {
            self.transfer(0xFF)?;
        }

        self.reset()?;
        self.state = CardState::IdleNegotiating;

        let mut r7 = [0u8; 4];
        let echoed = match self.command(CMD8, IF_COND_ARG, &mut r7) {
            Ok(r1) => r1 == R1::IDLE && r7[2] & 0x0F == 0x01 && r7[3] == 0xAA,
            Err(SdError::Timeout(Wait::Response(_))) => false,
            Err(e) => return Err(e),
        };

        let card_type = if echoed {
            debug!("card echoed the interface condition, negotiating as SD v2");
            self.init_v2()?
        } else {
            debug!("no interface condition echo, trying SD v1 and MMC");
            self.init_legacy()?
        };

        self.spi.set_clock(BusClock::Operating);
        let csd = self.read_csd()?;
        debug!(
            "{} card ready, {:?}, {:?} sectors",
            card_type,
            csd,
            csd.sector_count()
        );
        self.csd = Some(csd);
        Ok(card_type)
    }

    fn reset(&mut self) -> Result<(), SdError> {
        for attempt in 0..self.config.reset_retries {
            match self.command(CMD0, 0, &mut []) {
                Ok(r1) if r1 == R1::IDLE => return Ok(()),
                Ok(r1) => trace!("CMD0 attempt {}: R1 {:?}", attempt, r1),
                Err(SdError::Timeout(_)) => trace!("CMD0 attempt {}: no response", attempt),
                Err(e) => return Err(e),
            }
        }
        Err(SdError::NoCard)
    }

    fn init_v2(&mut self) -> Result<CardType, SdError> {
        self.poll_until_ready(ACMD41, |card| card.app_command(ACMD41, HCS))?;

        let mut ocr = [0u8; 4];
        let r1 = self.command(CMD58, 0, &mut ocr)?;
        expect_ready(CMD58, r1)?;
        self.ocr = Some(u32::from_be_bytes(ocr));

        if ocr[0] & OCR_CCS != 0 {
            Ok(CardType::SdHc)
        } else {
            self.set_block_length()?;
            Ok(CardType::SdV2)
        }
    }

    fn init_legacy(&mut self) -> Result<CardType, SdError> {
        let probe = self.app_command(ACMD41, 0)?;
        let card_type = if probe.bits() <= R1::IDLE.bits() {
            if !probe.is_empty() {
                self.poll_until_ready(ACMD41, |card| card.app_command(ACMD41, 0))?;
            }
            CardType::SdV1
        } else {
            debug!("ACMD41 rejected with {:?}, assuming MMC", probe);
            self.poll_until_ready(CMD1, |card| card.command(CMD1, 0, &mut []))?;
            CardType::Mmc
        };
        self.set_block_length()?;
        Ok(card_type)
    }

    /// Repeats `op` while the card answers with the bare idle bit.
    fn poll_until_ready<F>(&mut self, command: u8, mut op: F) -> Result<(), SdError>
    where
        F: FnMut(&mut Self) -> Result<R1, SdError>,
    {
        for _ in 0..self.config.init_retries {
            let response = op(self)?;
            if response.is_empty() {
                return Ok(());
            }
            if response.has_error() {
                return Err(SdError::CommandFailed { command, response });
            }
        }
        Err(SdError::Timeout(Wait::Initialization))
    }

    fn set_block_length(&mut self) -> Result<(), SdError> {
        let r1 = self.command(CMD16, SECTOR_SIZE as u32, &mut [])?;
        expect_ready(CMD16, r1)
    }

    fn read_csd(&mut self) -> Result<Csd, SdError> {
        let mut raw = [0u8; 16];
        self.select()?;
        let result = self
            .send_command(CMD9, 0, &mut [])
            .and_then(|r1| expect_ready(CMD9, r1))
            .and_then(|_| self.receive_block(&mut raw));
        let release = self.deselect();
        result.and(release)?;
        Ok(Csd::from_bytes(raw))
    }

    fn read_single(&mut self, address: u32, buf: &mut [u8]) -> Result<(), SdError> {
        let r1 = self.send_command(CMD17, address, &mut [])?;
        expect_ready(CMD17, r1)?;
        self.receive_block(buf)
    }

    fn read_multiple(&mut self, address: u32, buf: &mut [u8]) -> Result<(), SdError> {
        let r1 = self.send_command(CMD18, address, &mut [])?;
        expect_ready(CMD18, r1)?;

        let mut result = Ok(());
        for block in buf.chunks_exact_mut(SECTOR_SIZE) {
            result = self.receive_block(block);
            if result.is_err() {
                break;
            }
        }
        // The card keeps streaming until told to stop, even after a failed block.
        let stop = self.send_command(CMD12, 0, &mut []);
        result?;
        stop.map(|_| ())
    }

    fn write_single(&mut self, address: u32, buf: &[u8]) -> Result<(), SdError> {
        let r1 = self.send_command(CMD24, address, &mut [])?;
        expect_ready(CMD24, r1)?;
        self.send_block(TOKEN_START_BLOCK, buf)
    }

    fn write_multiple(&mut self, address: u32, buf: &[u8], count: u32) -> Result<(), SdError> {
        if self.card_type != Some(CardType::Mmc) {
            // Pre-erase hint, the card may ignore it.
            self.send_command(CMD55, 0, &mut [])?;
            self.send_command(ACMD23, count, &mut [])?;
        }
        let r1 = self.send_command(CMD25, address, &mut [])?;
        expect_ready(CMD25, r1)?;

        let mut result = Ok(());
        for block in buf.chunks_exact(SECTOR_SIZE) {
            result = self.send_block(TOKEN_START_MULTI_WRITE, block);
            if result.is_err() {
                break;
            }
        }

        self.wait_ready()?;
        self.transfer(TOKEN_STOP_TRAN)?;
        self.transfer(0xFF)?;
        let busy = self.wait_ready();
        result?;
        busy
    }

    fn receive_block(&mut self, buf: &mut [u8]) -> Result<(), SdError> {
        let mut token = 0xFF;
        for _ in 0..self.config.data_token_polls {
            token = self.transfer(0xFF)?;
            if token != 0xFF {
                break;
            }
        }
        match token {
            TOKEN_START_BLOCK => {}
            0xFF => return Err(SdError::Timeout(Wait::DataToken)),
            t => return Err(SdError::DataToken(t)),
        }

        for b in buf.iter_mut() {
            *b = 0xFF;
        }
        self.spi.transfer_in_place(buf).map_err(bus_error)?;
        let mut crc = [0xFF; 2];
        self.spi.transfer_in_place(&mut crc).map_err(bus_error)?;

        if self.config.verify_data_crc && u16::from_be_bytes(crc) != crc16(buf) {
            return Err(SdError::DataCrc);
        }
        Ok(())
    }

    fn send_block(&mut self, token: u8, data: &[u8]) -> Result<(), SdError> {
        self.wait_ready()?;
        self.transfer(token)?;
        self.spi.write(data).map_err(bus_error)?;
        self.spi
            .write(&crc16(data).to_be_bytes())
            .map_err(bus_error)?;

        let response = self.transfer(0xFF)? & DATA_RESPONSE_MASK;
        if response != DATA_ACCEPTED {
            return Err(SdError::DataRejected(response));
        }
        Ok(())
    }

    /// Selects the card, runs one command and releases the card again.
    fn command(&mut self, cmd: u8, argument: u32, response: &mut [u8]) -> Result<R1, SdError> {
        self.select()?;
        let result = self.send_command(cmd, argument, response);
        self.deselect()?;
        result
    }

    fn app_command(&mut self, cmd: u8, argument: u32) -> Result<R1, SdError> {
        // MMC rejects CMD55, the application command's R1 tells the story.
        let r1 = self.command(CMD55, 0, &mut [])?;
        trace!("CMD55: R1 {:?}", r1);
        self.command(cmd, argument, &mut [])
    }

    /// Sends a command frame with the card already selected. Trailing
    /// response bytes (R3/R7) are stored into `response`.
    fn send_command(&mut self, cmd: u8, argument: u32, response: &mut [u8]) -> Result<R1, SdError> {
        if cmd != CMD0 {
            self.wait_ready()?;
        }
        self.spi.write(&frame(cmd, argument)).map_err(bus_error)?;
        if cmd == CMD12 {
            // Stuff byte
            self.transfer(0xFF)?;
        }

        let mut r1 = None;
        for _ in 0..self.config.response_polls {
            let byte = self.transfer(0xFF)?;
            if byte & 0x80 == 0 {
                r1 = Some(R1::from_bits_truncate(byte));
                break;
            }
        }
        let r1 = r1.ok_or(SdError::Timeout(Wait::Response(cmd)))?;

        for b in response.iter_mut() {
            *b = self.transfer(0xFF)?;
        }
        Ok(r1)
    }

    fn wait_ready(&mut self) -> Result<(), SdError> {
        let polls = self
            .config
            .ready_timeout_ms
            .saturating_mul(self.config.ready_polls_per_ms);
        for _ in 0..polls {
            if self.transfer(0xFF)? == 0xFF {
                return Ok(());
            }
        }
        Err(SdError::Timeout(Wait::Ready))
    }

    fn transfer(&mut self, byte: u8) -> Result<u8, SdError> {
        let mut word = [byte];
        self.spi.transfer_in_place(&mut word).map_err(bus_error)?;
        Ok(word[0])
    }

    fn select(&mut self) -> Result<(), SdError> {
        self.cs.set_low().map_err(|_| SdError::ChipSelect)
    }

    fn deselect(&mut self) -> Result<(), SdError> {
        self.cs.set_high().map_err(|_| SdError::ChipSelect)?;
        // Give the card a clock to release the data line.
        self.transfer(0xFF)?;
        Ok(())
    }

    fn address(&self, sector: u32) -> Result<u32, SdError> {
        match (self.state, self.card_type) {
            (CardState::Ready, Some(t)) if t.is_block_addressed() => Ok(sector),
            (CardState::Ready, Some(_)) => sector
                .checked_mul(SECTOR_SIZE as u32)
                .ok_or(SdError::AddressOutOfRange(sector)),
            _ => Err(SdError::NotInitialized),
        }
    }

    fn settle<T>(&mut self, result: Result<T, SdError>) -> Result<T, SdError> {
        if let Err(e) = &result {
            warn!("card I/O failed: {}", e);
            self.state = CardState::Error;
        }
        result
    }
}

fn block_count(len: usize) -> Result<u32, SdError> {
    if len == 0 || len % SECTOR_SIZE != 0 {
        return Err(SdError::BufferSize(len));
    }
    Ok((len / SECTOR_SIZE) as u32)
}

impl<SPI, CS> BlockDevice for SdCard<SPI, CS>
where
    SPI: SpiBus<u8> + ClockControl,
    CS: OutputPin,
{
    fn initialize(&mut self) -> DiskStatus {
        if let Err(e) = self.init() {
            warn!("card bring-up failed: {}", e);
        }
        self.status()
    }

    fn status(&self) -> DiskStatus {
        let mut status = DiskStatus::empty();
        if self.state != CardState::Ready {
            status |= DiskStatus::NOINIT;
        }
        if self.no_card {
            status |= DiskStatus::NODISK;
        }
        if self.write_protected {
            status |= DiskStatus::PROTECT;
        }
        status
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult<()> {
        check_transfer(buf.len(), count)?;
        Ok(self.read_blocks(buf, sector)?)
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult<()> {
        check_transfer(buf.len(), count)?;
        if self.write_protected {
            return Err(DiskError::WriteProtected);
        }
        Ok(self.write_blocks(buf, sector)?)
    }

    fn ioctl(&mut self, command: IoctlCommand) -> DiskResult<u32> {
        if self.state != CardState::Ready {
            return Err(DiskError::NotReady);
        }
        match command {
            IoctlCommand::Sync => {
                self.flush()?;
                Ok(0)
            }
            IoctlCommand::GetSectorCount => self
                .sector_count()
                .map_err(|_| DiskError::InvalidParameter),
            IoctlCommand::GetSectorSize => Ok(SECTOR_SIZE as u32),
            IoctlCommand::GetBlockSize => Ok(self
                .csd
                .as_ref()
                .map(|csd| csd.erase_block_sectors())
                .unwrap_or(1)),
            IoctlCommand::Trim { start, end } => {
                trace!("trim of sectors {}..={} not issued", start, end);
                Ok(0)
            }
        }
    }
}
