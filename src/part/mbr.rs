use std::convert::TryInto;
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};

use crate::disk::SECTOR_SIZE;

pub const PARTITION_TABLE_OFFSET: usize = 0x1BE;
const ENTRY_SIZE: usize = 0x10;

/// Partition types that may carry a FAT volume.
pub const FAT_PARTITION_TYPES: [u8; 6] = [
    0x01, // FAT12
    0x04, // FAT16 < 32 MiB
    0x06, // FAT16
    0x0B, // FAT32 CHS
    0x0C, // FAT32 LBA
    0x0E, // FAT16 LBA
];

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MbrPartition {
    pub flags: u8,
    pub start_chs: (u16, u8, u8),
    pub partition_type: u8,
    pub end_chs: (u16, u8, u8),
    pub lba: u32,
    pub num_sectors: u32,
}

impl MbrPartition {
    /// Returns `None` for an unused slot.
    pub fn decode(buf: &[u8; ENTRY_SIZE]) -> Option<Self> {
        let mut cursor = Cursor::new(&buf[..]);

        let flags = cursor.read_u8().ok()?;
        let start_chs = Self::decode_chs(&mut cursor)?;
        let partition_type = cursor.read_u8().ok()?;
        if partition_type == 0 {
            return None;
        }
        let end_chs = Self::decode_chs(&mut cursor)?;

        let lba = cursor.read_u32::<LittleEndian>().ok()?;
        let num_sectors = cursor.read_u32::<LittleEndian>().ok()?;

        debug_assert_eq!(cursor.position(), ENTRY_SIZE as u64);

        Some(Self {
            flags,
            start_chs,
            partition_type,
            end_chs,
            lba,
            num_sectors,
        })
    }

    fn decode_chs(cursor: &mut Cursor<&[u8]>) -> Option<(u16, u8, u8)> {
        let x1 = cursor.read_u8().ok()?;
        let x2 = cursor.read_u8().ok()?;
        let x3 = cursor.read_u8().ok()?;

        let head = x1;
        let sector = x2 & 0x3F;
        let cylinder = x3 as u16 | (((x2 as u16) & 0xC0) << 2);

        Some((cylinder, head, sector))
    }

    pub fn is_fat(&self) -> bool {
        FAT_PARTITION_TYPES.contains(&self.partition_type)
    }

    pub fn is_bootable(&self) -> bool {
        self.flags & 0x80 != 0
    }
}

pub struct Mbr {
    pub partitions: [Option<MbrPartition>; 4],
}

impl Mbr {
    /// Decodes the partition table of sector 0, `None` when the boot signature is missing.
    pub fn decode(sector: &[u8; SECTOR_SIZE]) -> Option<Self> {
        if sector[0x1FE] != 0x55 || sector[0x1FF] != 0xAA {
            return None;
        }

        let entry = |i: usize| {
            let start = PARTITION_TABLE_OFFSET + i * ENTRY_SIZE;
            sector[start..start + ENTRY_SIZE]
                .try_into()
                .ok()
                .and_then(|e: &[u8; ENTRY_SIZE]| MbrPartition::decode(e))
        };

        Some(Self {
            partitions: [entry(0), entry(1), entry(2), entry(3)],
        })
    }

    pub fn first_fat_partition(&self) -> Option<&MbrPartition> {
        self.partitions
            .iter()
            .flatten()
            .find(|p| p.is_fat() && p.lba != 0)
    }
}
