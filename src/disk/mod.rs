pub mod ram;
pub mod raw;
pub mod sd;

use std::{io, result};

use bitflags::bitflags;
use thiserror::Error;

use self::sd::SdError;

/// Every device in this crate transfers data in 512 byte sectors.
pub const SECTOR_SIZE: usize = 512;

bitflags! {
    pub struct DiskStatus: u8 {
        const NOINIT = 0x01;
        const NODISK = 0x02;
        const PROTECT = 0x04;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IoctlCommand {
    /// Finish any pending write.
    Sync,
    GetSectorCount,
    GetSectorSize,
    /// Erase block size in sectors.
    GetBlockSize,
    /// Hint that the inclusive sector range holds no data anymore.
    Trim { start: u32, end: u32 },
}

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("device not ready")]
    NotReady,
    #[error("device is write protected")]
    WriteProtected,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("device timeout")]
    Timeout,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Card(#[from] SdError),
}

pub type DiskResult<T> = result::Result<T, DiskError>;

/// Sector addressed storage the filesystem layer runs on.
pub trait BlockDevice {
    /// Bring the device up. Returns the status after the attempt.
    fn initialize(&mut self) -> DiskStatus;
    fn status(&self) -> DiskStatus;
    /// Read `count` sectors starting at `sector`. `buf` must hold exactly `count` sectors.
    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult<()>;
    /// Write `count` sectors starting at `sector`. `buf` must hold exactly `count` sectors.
    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult<()>;
    fn ioctl(&mut self, command: IoctlCommand) -> DiskResult<u32>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn initialize(&mut self) -> DiskStatus {
        (**self).initialize()
    }

    fn status(&self) -> DiskStatus {
        (**self).status()
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult<()> {
        (**self).read(buf, sector, count)
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult<()> {
        (**self).write(buf, sector, count)
    }

    fn ioctl(&mut self, command: IoctlCommand) -> DiskResult<u32> {
        (**self).ioctl(command)
    }
}

impl<T: BlockDevice + ?Sized> BlockDevice for Box<T> {
    fn initialize(&mut self) -> DiskStatus {
        (**self).initialize()
    }

    fn status(&self) -> DiskStatus {
        (**self).status()
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult<()> {
        (**self).read(buf, sector, count)
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult<()> {
        (**self).write(buf, sector, count)
    }

    fn ioctl(&mut self, command: IoctlCommand) -> DiskResult<u32> {
        (**self).ioctl(command)
    }
}

/// Validates a transfer request against the caller's buffer.
pub(crate) fn check_transfer(len: usize, count: u32) -> DiskResult<()> {
    if count == 0 || len != count as usize * SECTOR_SIZE {
        return Err(DiskError::InvalidParameter);
    }
    Ok(())
}
