use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::Result;

/// Where the FAT copies live, so flushing a FAT sector can update every copy.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct FatMirror {
    pub start: u32,
    pub size: u32,
    pub copies: u8,
}

/// Single sector cache shared by every metadata access of a volume.
pub(crate) struct SectorWindow {
    buf: [u8; SECTOR_SIZE],
    sector: Option<u32>,
    dirty: bool,
    mirror: Option<FatMirror>,
}

impl SectorWindow {
    pub fn new() -> Self {
        Self {
            buf: [0u8; SECTOR_SIZE],
            sector: None,
            dirty: false,
            mirror: None,
        }
    }

    pub fn set_mirror(&mut self, mirror: FatMirror) {
        self.mirror = Some(mirror);
    }

    pub fn sector(&self) -> Option<u32> {
        self.sector
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn buf(&self) -> &[u8; SECTOR_SIZE] {
        &self.buf
    }

    /// Callers editing the buffer must follow up with [`mark_dirty`](Self::mark_dirty).
    pub fn buf_mut(&mut self) -> &mut [u8; SECTOR_SIZE] {
        &mut self.buf
    }

    pub fn mark_dirty(&mut self) {
        debug_assert!(self.sector.is_some());
        self.dirty = true;
    }

    /// Makes `sector` resident, writing back the current one first if it was modified.
    pub fn move_to<D: BlockDevice + ?Sized>(&mut self, disk: &mut D, sector: u32) -> Result<()> {
        if self.sector == Some(sector) {
            return Ok(());
        }
        self.sync(disk)?;

        trace!("window: load sector {}", sector);
        if let Err(e) = disk.read(&mut self.buf, sector, 1) {
            self.sector = None;
            return Err(e.into());
        }
        self.sector = Some(sector);
        Ok(())
    }

    /// Writes the resident sector back if it was modified.
    pub fn sync<D: BlockDevice + ?Sized>(&mut self, disk: &mut D) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let sector = match self.sector {
            Some(sector) => sector,
            None => return Ok(()),
        };

        trace!("window: flush sector {}", sector);
        disk.write(&self.buf, sector, 1)?;
        if let Some(mirror) = self.mirror {
            if sector >= mirror.start && sector - mirror.start < mirror.size {
                for copy in 1..mirror.copies as u32 {
                    disk.write(&self.buf, sector + copy * mirror.size, 1)?;
                }
            }
        }
        self.dirty = false;
        Ok(())
    }

    /// Overlays the window onto data read straight from the device, where the
    /// window holds newer contents than the media.
    pub fn patch_read(&self, buf: &mut [u8], first: u32, count: u32) {
        if let Some(index) = self.index_in(first, count) {
            if self.dirty {
                buf[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE].copy_from_slice(&self.buf);
            }
        }
    }

    /// Brings the window in line with data written straight to the device.
    pub fn refresh_written(&mut self, buf: &[u8], first: u32, count: u32) {
        if let Some(index) = self.index_in(first, count) {
            self.buf
                .copy_from_slice(&buf[index * SECTOR_SIZE..(index + 1) * SECTOR_SIZE]);
            self.dirty = false;
        }
    }

    fn index_in(&self, first: u32, count: u32) -> Option<usize> {
        let sector = self.sector?;
        if sector >= first && sector - first < count {
            Some((sector - first) as usize)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::ram::RamDisk;
    use crate::disk::DiskError;
    use crate::Error;

    fn disk() -> RamDisk {
        let mut data = vec![0u8; 16 * SECTOR_SIZE];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (i / SECTOR_SIZE) as u8;
        }
        RamDisk::from_vec(data)
    }

    #[test]
    fn test_move_and_flush() {
        crate::tests_init();

        let mut disk = disk();
        let mut window = SectorWindow::new();

        window.move_to(&mut disk, 3).unwrap();
        assert_eq!(window.sector(), Some(3));
        assert_eq!(window.buf()[0], 3);
        window.move_to(&mut disk, 3).unwrap();
        assert_eq!(disk.stats().reads, 1);

        window.buf_mut()[0] = 0xAA;
        window.mark_dirty();
        window.move_to(&mut disk, 4).unwrap();
        assert!(!window.is_dirty());
        assert_eq!(disk.as_slice()[3 * SECTOR_SIZE], 0xAA);
        assert_eq!(disk.stats().writes, 1);

        // Clean sectors are never written back.
        window.move_to(&mut disk, 5).unwrap();
        window.sync(&mut disk).unwrap();
        assert_eq!(disk.stats().writes, 1);
    }

    #[test]
    fn test_fat_mirror() {
        crate::tests_init();

        let mut disk = disk();
        let mut window = SectorWindow::new();
        window.set_mirror(FatMirror {
            start: 2,
            size: 3,
            copies: 2,
        });

        window.move_to(&mut disk, 4).unwrap();
        window.buf_mut()[10] = 0x55;
        window.mark_dirty();
        window.sync(&mut disk).unwrap();
        assert_eq!(disk.as_slice()[4 * SECTOR_SIZE + 10], 0x55);
        assert_eq!(disk.as_slice()[7 * SECTOR_SIZE + 10], 0x55);

        // Outside the first FAT: no mirroring.
        window.move_to(&mut disk, 8).unwrap();
        window.buf_mut()[0] = 0x66;
        window.mark_dirty();
        window.sync(&mut disk).unwrap();
        assert_eq!(disk.as_slice()[11 * SECTOR_SIZE], 11);
        assert_eq!(disk.stats().writes, 3);
    }

    #[test]
    fn test_failed_load_leaves_window_empty() {
        crate::tests_init();

        let mut disk = disk();
        let mut window = SectorWindow::new();
        window.move_to(&mut disk, 1).unwrap();
        assert!(matches!(
            window.move_to(&mut disk, 100),
            Err(Error::Disk(DiskError::InvalidParameter))
        ));
        assert_eq!(window.sector(), None);
    }

    #[test]
    fn test_dirty_sector_kept_on_failed_flush() {
        crate::tests_init();

        let mut disk = disk();
        let mut window = SectorWindow::new();
        window.move_to(&mut disk, 2).unwrap();
        window.buf_mut()[0] = 0x99;
        window.mark_dirty();

        disk.set_write_protected(true);
        assert!(matches!(
            window.move_to(&mut disk, 3),
            Err(Error::WriteProtected)
        ));
        assert!(window.is_dirty());
        assert_eq!(window.sector(), Some(2));

        disk.set_write_protected(false);
        window.sync(&mut disk).unwrap();
        assert_eq!(disk.as_slice()[2 * SECTOR_SIZE], 0x99);
    }

    #[test]
    fn test_bulk_transfer_reconciliation() {
        crate::tests_init();

        let mut disk = disk();
        let mut window = SectorWindow::new();
        window.move_to(&mut disk, 6).unwrap();
        window.buf_mut()[1] = 0x42;
        window.mark_dirty();

        let mut buf = vec![0u8; 4 * SECTOR_SIZE];
        disk.read(&mut buf, 5, 4).unwrap();
        window.patch_read(&mut buf, 5, 4);
        assert_eq!(buf[SECTOR_SIZE + 1], 0x42);
        assert_eq!(buf[2 * SECTOR_SIZE], 7);

        let data = vec![0xEEu8; 2 * SECTOR_SIZE];
        disk.write(&data, 6, 2).unwrap();
        window.refresh_written(&data, 6, 2);
        assert!(!window.is_dirty());
        assert_eq!(window.buf()[1], 0xEE);
    }
}
