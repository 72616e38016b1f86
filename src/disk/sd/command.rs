use bitflags::bitflags;
use crc::{Crc, CRC_16_XMODEM, CRC_7_MMC};

pub const CMD0: u8 = 0; // GO_IDLE_STATE
pub const CMD1: u8 = 1; // SEND_OP_COND (MMC)
pub const CMD8: u8 = 8; // SEND_IF_COND
pub const CMD9: u8 = 9; // SEND_CSD
pub const CMD12: u8 = 12; // STOP_TRANSMISSION
pub const CMD16: u8 = 16; // SET_BLOCKLEN
pub const CMD17: u8 = 17; // READ_SINGLE_BLOCK
pub const CMD18: u8 = 18; // READ_MULTIPLE_BLOCK
pub const CMD24: u8 = 24; // WRITE_BLOCK
pub const CMD25: u8 = 25; // WRITE_MULTIPLE_BLOCK
pub const CMD55: u8 = 55; // APP_CMD
pub const CMD58: u8 = 58; // READ_OCR

// Application commands, only valid right after CMD55.
pub const ACMD23: u8 = 23; // SET_WR_BLK_ERASE_COUNT
pub const ACMD41: u8 = 41; // SD_SEND_OP_COND

/// Supply voltage 2.7-3.6V plus the check pattern echoed back by v2 cards.
pub const IF_COND_ARG: u32 = 0x1AA;
/// Host capacity support bit for ACMD41.
pub const HCS: u32 = 1 << 30;
/// Card capacity status bit in the first OCR byte.
pub const OCR_CCS: u8 = 0x40;

pub const TOKEN_START_BLOCK: u8 = 0xFE;
pub const TOKEN_START_MULTI_WRITE: u8 = 0xFC;
pub const TOKEN_STOP_TRAN: u8 = 0xFD;

pub const DATA_RESPONSE_MASK: u8 = 0x1F;
pub const DATA_ACCEPTED: u8 = 0x05;

const CRC7: Crc<u8> = Crc::<u8>::new(&CRC_7_MMC);
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

bitflags! {
    /// R1 response returned for every command.
    pub struct R1: u8 {
        const IDLE = 0x01;
        const ERASE_RESET = 0x02;
        const ILLEGAL_COMMAND = 0x04;
        const CRC_ERROR = 0x08;
        const ERASE_SEQUENCE_ERROR = 0x10;
        const ADDRESS_ERROR = 0x20;
        const PARAMETER_ERROR = 0x40;
    }
}

impl R1 {
    /// Any bit other than idle is set.
    pub fn has_error(self) -> bool {
        self.intersects(!Self::IDLE)
    }
}

/// Builds the 6 byte command frame: start bits and index, argument, CRC7 and end bit.
pub fn frame(command: u8, argument: u32) -> [u8; 6] {
    let arg = argument.to_be_bytes();
    let mut frame = [0x40 | (command & 0x3F), arg[0], arg[1], arg[2], arg[3], 0];
    frame[5] = (crc7(&frame[..5]) << 1) | 0x01;
    frame
}

pub fn crc7(data: &[u8]) -> u8 {
    CRC7.checksum(data)
}

/// CRC16 appended to every data block.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}
