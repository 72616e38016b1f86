use std::ops::Range;

use crate::disk::{
    check_transfer, BlockDevice, DiskError, DiskResult, DiskStatus, IoctlCommand, SECTOR_SIZE,
};

/// Number of device transactions issued against a [`RamDisk`].
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct TransferStats {
    pub reads: usize,
    pub writes: usize,
    pub sectors_written: usize,
}

pub struct RamDisk {
    buffer: Vec<u8>,
    initialized: bool,
    write_protected: bool,
    stats: TransferStats,
}

impl RamDisk {
    pub fn new_zeroed(num_sectors: u32) -> Self {
        Self::from_vec(vec![0u8; num_sectors as usize * SECTOR_SIZE])
    }

    pub fn from_vec(vector: Vec<u8>) -> Self {
        assert_eq!(vector.len() % SECTOR_SIZE, 0);

        Self {
            buffer: vector,
            initialized: false,
            write_protected: false,
            stats: TransferStats::default(),
        }
    }

    pub fn set_write_protected(&mut self, protected: bool) {
        self.write_protected = protected;
    }

    pub fn num_sectors(&self) -> u32 {
        (self.buffer.len() / SECTOR_SIZE) as u32
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = TransferStats::default();
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buffer
    }

    fn byte_range(&self, sector: u32, count: u32) -> DiskResult<Range<usize>> {
        let end = sector as u64 + count as u64;
        if end > self.num_sectors() as u64 {
            return Err(DiskError::InvalidParameter);
        }
        Ok(sector as usize * SECTOR_SIZE..end as usize * SECTOR_SIZE)
    }
}

impl BlockDevice for RamDisk {
    fn initialize(&mut self) -> DiskStatus {
        self.initialized = true;
        self.status()
    }

    fn status(&self) -> DiskStatus {
        let mut status = DiskStatus::empty();
        if !self.initialized {
            status |= DiskStatus::NOINIT;
        }
        if self.write_protected {
            status |= DiskStatus::PROTECT;
        }
        status
    }

    fn read(&mut self, buf: &mut [u8], sector: u32, count: u32) -> DiskResult<()> {
        check_transfer(buf.len(), count)?;
        let range = self.byte_range(sector, count)?;
        buf.copy_from_slice(&self.buffer[range]);
        self.stats.reads += 1;
        Ok(())
    }

    fn write(&mut self, buf: &[u8], sector: u32, count: u32) -> DiskResult<()> {
        check_transfer(buf.len(), count)?;
        if self.write_protected {
            return Err(DiskError::WriteProtected);
        }
        let range = self.byte_range(sector, count)?;
        self.buffer[range].copy_from_slice(buf);
        self.stats.writes += 1;
        self.stats.sectors_written += count as usize;
        Ok(())
    }

    fn ioctl(&mut self, command: IoctlCommand) -> DiskResult<u32> {
        match command {
            IoctlCommand::Sync | IoctlCommand::Trim { .. } => Ok(0),
            IoctlCommand::GetSectorCount => Ok(self.num_sectors()),
            IoctlCommand::GetSectorSize => Ok(SECTOR_SIZE as u32),
            IoctlCommand::GetBlockSize => Ok(1),
        }
    }
}
