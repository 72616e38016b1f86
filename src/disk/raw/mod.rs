use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::disk::{
    check_transfer, BlockDevice, DiskError, DiskResult, DiskStatus, IoctlCommand, SECTOR_SIZE,
};

/// Block device backed by anything seekable, usually a disk image file.
pub struct RawDisk<B>
where
    B: Read + Seek + Write,
{
    backend: B,
    num_sectors: u32,
    read_only: bool,
    initialized: bool,
}

impl<B> RawDisk<B>
where
    B: Read + Seek + Write,
{
    pub fn open(mut backend: B, read_only: bool) -> io::Result<Self> {
        let size = backend.seek(SeekFrom::End(0))?;
        if size % SECTOR_SIZE as u64 != 0 {
            warn!(
                "image size {} is not a multiple of {}, trailing bytes ignored",
                size, SECTOR_SIZE
            );
        }
        let num_sectors = size / SECTOR_SIZE as u64;
        if num_sectors > u32::MAX as u64 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "image too large for 32-bit sector addressing",
            ));
        }

        Ok(Self {
            backend,
            num_sectors: num_sectors as u32,
            read_only,
            initialized: false,
        })
    }

    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    pub fn into_inner(self) -> B {
        self.backend
    }

    fn seek_to(&mut self, sector: u32, count: u32) -> DiskResult<()> {
        if sector as u64 + count as u64 > self.num_sectors as u64 {
            return Err(DiskError::InvalidParameter);
        }
        self.backend
            .seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        Ok(())
    }
}

impl<B> BlockDevice for RawDisk<B>
where
    B: Read + Seek + Write,
{
    fn initialize(&mut self) -> DiskStatus {
        self.initialized = true;
        self.status()
    }

    fn status(&self) -> DiskStatus {
        let mut status = DiskStatus::empty();
        if !self.initialized {
            status |= DiskStatus::NOINIT;
        }
        if self.read_only {
            status |= DiskStatus::PROTECT;
        }
        status
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult<()> {
        check_transfer(buf.len(), count)?;
        if !self.initialized {
            return Err(DiskError::NotReady);
        }
        self.seek_to(sector, count)?;
        self.backend.read_exact(buf)?;
        Ok(())
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult<()> {
        check_transfer(buf.len(), count)?;
        if !self.initialized {
            return Err(DiskError::NotReady);
        }
        if self.read_only {
            return Err(DiskError::WriteProtected);
        }
        self.seek_to(sector, count)?;
        self.backend.write_all(buf)?;
        Ok(())
    }

    fn ioctl(&mut self, command: IoctlCommand) -> DiskResult<u32> {
        match command {
            IoctlCommand::Sync => {
                self.backend.flush()?;
                Ok(0)
            }
            IoctlCommand::GetSectorCount => Ok(self.num_sectors),
            IoctlCommand::GetSectorSize => Ok(SECTOR_SIZE as u32),
            IoctlCommand::GetBlockSize => Ok(1),
            IoctlCommand::Trim { .. } => Ok(0),
        }
    }
}
