use byteorder::{ByteOrder, LittleEndian};

use super::bpb::FatType;
use super::volume::Volume;
use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::{Error, Result};

const FAT32_MASK: u32 = 0x0FFF_FFFF;

/// Value `get_fat` reports for entries that cannot be read.
pub(crate) const INVALID: u32 = 1;

/// 12 bit cells, two packed into three bytes.
pub(crate) mod fat12 {
    pub fn byte_offset(cluster: u32) -> u32 {
        cluster + cluster / 2
    }

    pub fn decode(lo: u8, hi: u8, odd: bool) -> u32 {
        let word = u16::from_le_bytes([lo, hi]) as u32;
        if odd {
            word >> 4
        } else {
            word & 0xFFF
        }
    }

    /// New value of the first byte of the cell, keeping the neighbour's nibble.
    pub fn encode_low(old: u8, value: u32, odd: bool) -> u8 {
        if odd {
            (old & 0x0F) | (value << 4) as u8
        } else {
            value as u8
        }
    }

    /// New value of the second byte of the cell, keeping the neighbour's nibble.
    pub fn encode_high(old: u8, value: u32, odd: bool) -> u8 {
        if odd {
            (value >> 4) as u8
        } else {
            (old & 0xF0) | (value >> 8 & 0x0F) as u8
        }
    }
}

/// What a FAT entry says about the cluster after it.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum Link {
    Free,
    Next(u32),
    End,
    Invalid,
}

impl Volume {
    /// Byte offset of the entry within the FAT, `None` when it lies beyond the table.
    fn entry_offset(&self, cluster: u32) -> Option<u32> {
        if !self.is_valid_cluster(cluster) {
            return None;
        }
        let (offset, last_byte) = match self.fat_type {
            FatType::Fat12 => {
                let offset = fat12::byte_offset(cluster);
                (offset, offset + 1)
            }
            FatType::Fat16 => (cluster * 2, cluster * 2 + 1),
            FatType::Fat32 => (cluster * 4, cluster * 4 + 3),
        };
        if last_byte / SECTOR_SIZE as u32 >= self.fat_size {
            return None;
        }
        Some(offset)
    }

    fn fat_byte<D: BlockDevice + ?Sized>(&mut self, disk: &mut D, offset: u32) -> Result<u8> {
        self.window
            .move_to(disk, self.fat_base + offset / SECTOR_SIZE as u32)?;
        Ok(self.window.buf()[offset as usize % SECTOR_SIZE])
    }

    fn set_fat_byte<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        offset: u32,
        f: impl FnOnce(u8) -> u8,
    ) -> Result<()> {
        self.window
            .move_to(disk, self.fat_base + offset / SECTOR_SIZE as u32)?;
        let byte = &mut self.window.buf_mut()[offset as usize % SECTOR_SIZE];
        *byte = f(*byte);
        self.window.mark_dirty();
        Ok(())
    }

    /// Raw value of the FAT entry for `cluster`. Unreadable entries report [`INVALID`].
    pub fn get_fat<D: BlockDevice + ?Sized>(&mut self, disk: &mut D, cluster: u32) -> Result<u32> {
        let offset = match self.entry_offset(cluster) {
            Some(offset) => offset,
            None => return Ok(INVALID),
        };

        let value = match self.fat_type {
            FatType::Fat12 => {
                // The cell may straddle two sectors.
                let lo = self.fat_byte(disk, offset)?;
                let hi = self.fat_byte(disk, offset + 1)?;
                fat12::decode(lo, hi, cluster & 1 != 0)
            }
            FatType::Fat16 => {
                self.window
                    .move_to(disk, self.fat_base + offset / SECTOR_SIZE as u32)?;
                let i = offset as usize % SECTOR_SIZE;
                LittleEndian::read_u16(&self.window.buf()[i..]) as u32
            }
            FatType::Fat32 => {
                self.window
                    .move_to(disk, self.fat_base + offset / SECTOR_SIZE as u32)?;
                let i = offset as usize % SECTOR_SIZE;
                LittleEndian::read_u32(&self.window.buf()[i..]) & FAT32_MASK
            }
        };
        trace!("get_fat({}) = {:#x}", cluster, value);
        Ok(value)
    }

    pub fn put_fat<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        cluster: u32,
        value: u32,
    ) -> Result<()> {
        let offset = self.entry_offset(cluster).ok_or(Error::IntegrityError)?;
        trace!("put_fat({}, {:#x})", cluster, value);

        match self.fat_type {
            FatType::Fat12 => {
                let odd = cluster & 1 != 0;
                self.set_fat_byte(disk, offset, |old| fat12::encode_low(old, value, odd))?;
                self.set_fat_byte(disk, offset + 1, |old| fat12::encode_high(old, value, odd))?;
            }
            FatType::Fat16 => {
                self.window
                    .move_to(disk, self.fat_base + offset / SECTOR_SIZE as u32)?;
                let i = offset as usize % SECTOR_SIZE;
                LittleEndian::write_u16(&mut self.window.buf_mut()[i..], value as u16);
                self.window.mark_dirty();
            }
            FatType::Fat32 => {
                self.window
                    .move_to(disk, self.fat_base + offset / SECTOR_SIZE as u32)?;
                let i = offset as usize % SECTOR_SIZE;
                let buf = self.window.buf_mut();
                let old = LittleEndian::read_u32(&buf[i..]);
                LittleEndian::write_u32(&mut buf[i..], old & !FAT32_MASK | value & FAT32_MASK);
                self.window.mark_dirty();
            }
        }
        Ok(())
    }

    pub fn link<D: BlockDevice + ?Sized>(&mut self, disk: &mut D, cluster: u32) -> Result<Link> {
        Ok(match self.get_fat(disk, cluster)? {
            0 => Link::Free,
            INVALID => Link::Invalid,
            next if self.is_valid_cluster(next) => Link::Next(next),
            _ => Link::End,
        })
    }

    /// Follows the chain one step. A free or unreadable entry inside a chain is corruption.
    pub fn next_cluster<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        cluster: u32,
    ) -> Result<Option<u32>> {
        match self.link(disk, cluster)? {
            Link::Next(next) => Ok(Some(next)),
            Link::End => Ok(None),
            Link::Free | Link::Invalid => Err(Error::IntegrityError),
        }
    }

    /// Returns the cluster following `prev`, allocating and linking a free one
    /// if `prev` ends its chain. `prev == 0` starts a new chain. `None` when
    /// the volume is full.
    pub fn create_chain<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        prev: u32,
    ) -> Result<Option<u32>> {
        let start = if prev == 0 {
            match self.last_cluster {
                Some(hint) if self.is_valid_cluster(hint) => hint,
                _ => 1,
            }
        } else {
            match self.link(disk, prev)? {
                Link::Next(next) => return Ok(Some(next)),
                Link::End => prev,
                Link::Free | Link::Invalid => return Err(Error::IntegrityError),
            }
        };
        if self.free_clusters == Some(0) {
            return Ok(None);
        }

        let mut cluster = start;
        loop {
            cluster += 1;
            if cluster >= self.n_fatent {
                cluster = 2;
                if cluster > start {
                    return Ok(None);
                }
            }
            match self.get_fat(disk, cluster)? {
                0 => break,
                INVALID => return Err(Error::IntegrityError),
                _ => {}
            }
            if cluster == start {
                return Ok(None);
            }
        }

        self.put_fat(disk, cluster, self.fat_type.end_of_chain())?;
        if prev != 0 {
            self.put_fat(disk, prev, cluster)?;
        }
        debug!("allocated cluster {} after {}", cluster, prev);

        self.last_cluster = Some(cluster);
        if let Some(free) = self.free_clusters.as_mut() {
            *free = free.saturating_sub(1);
        }
        self.touch_fsinfo();
        Ok(Some(cluster))
    }

    /// Frees every cluster of the chain starting at `start`.
    pub fn remove_chain<D: BlockDevice + ?Sized>(&mut self, disk: &mut D, start: u32) -> Result<()> {
        if !self.is_valid_cluster(start) {
            return Err(Error::IntegrityError);
        }

        let mut cluster = start;
        loop {
            let link = self.link(disk, cluster)?;
            if link == Link::Free {
                break;
            }
            if link == Link::Invalid {
                return Err(Error::IntegrityError);
            }
            self.put_fat(disk, cluster, 0)?;
            if let Some(free) = self.free_clusters.as_mut() {
                *free += 1;
            }
            match link {
                Link::Next(next) => cluster = next,
                _ => break,
            }
        }
        debug!("freed chain starting at {}", start);

        if self.last_cluster.map_or(true, |hint| hint >= start) {
            self.last_cluster = Some(start - 1);
        }
        self.touch_fsinfo();
        Ok(())
    }

    pub fn count_free<D: BlockDevice + ?Sized>(&mut self, disk: &mut D) -> Result<u32> {
        let mut free = 0;
        for cluster in 2..self.n_fatent {
            if self.get_fat(disk, cluster)? == 0 {
                free += 1;
            }
        }
        debug!("{} free clusters", free);
        Ok(free)
    }
}
