use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::disk::SECTOR_SIZE;
use crate::utils::blocks_for;
use crate::{Error, Result};

pub const BOOT_SIGNATURE: u16 = 0xAA55;
const FS_TYPE_OFFSET_FAT16: usize = 54;
const FS_TYPE_OFFSET_FAT32: usize = 82;
const DIR_ENTRY_SIZE: u32 = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FatType {
    Fat12,
    Fat16,
    Fat32,
}

impl FatType {
    pub fn from_cluster_count(clusters: u32) -> Self {
        if clusters <= 0xFF5 {
            Self::Fat12
        } else if clusters <= 0xFFF5 {
            Self::Fat16
        } else {
            Self::Fat32
        }
    }

    /// Value written to terminate a chain.
    pub fn end_of_chain(self) -> u32 {
        match self {
            Self::Fat12 => 0xFFF,
            Self::Fat16 => 0xFFFF,
            Self::Fat32 => 0x0FFF_FFFF,
        }
    }
}

impl fmt::Display for FatType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Fat12 => "FAT12",
            Self::Fat16 => "FAT16",
            Self::Fat32 => "FAT32",
        };
        f.write_str(name)
    }
}

/// BIOS parameter block plus the fields of the FAT32 extension.
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_id: [u8; 8],
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub number_of_fats: u8,
    pub root_entries: u16,
    pub sectors_total_16: u16,
    pub media_descriptor: u8,
    pub sectors_per_fat_16: u16,
    pub sectors_per_track: u16,
    pub number_of_heads: u16,
    pub hidden_sectors: u32,
    pub sectors_total_32: u32,
    pub sectors_per_fat_32: u32,
    pub flags: u16,
    pub fat_version: u16,
    pub root_directory_cluster: u32,
    pub fsinfo_sector: u16,
    pub backup_boot_sector: u16,
    pub fs_type: [u8; 8],
    pub fs_type_32: [u8; 8],
    pub signature: u16,
}

impl BootSector {
    pub fn decode(sector: &[u8; SECTOR_SIZE]) -> Result<Self> {
        let mut reader = Cursor::new(&sector[..]);

        macro_rules! read {
            (array($size:expr)) => {{
                let mut a = [0u8; $size];
                reader.read_exact(&mut a)?;
                a
            }};
            (u8) => {
                reader.read_u8()?
            };
            (u16) => {
                reader.read_u16::<LittleEndian>()?
            };
            (u32) => {
                reader.read_u32::<LittleEndian>()?
            };
        }

        let jump = read!(array(3));
        let oem_id = read!(array(8));
        let bytes_per_sector = read!(u16);
        let sectors_per_cluster = read!(u8);
        let reserved_sectors = read!(u16);
        let number_of_fats = read!(u8);
        let root_entries = read!(u16);
        let sectors_total_16 = read!(u16);
        let media_descriptor = read!(u8);
        let sectors_per_fat_16 = read!(u16);
        let sectors_per_track = read!(u16);
        let number_of_heads = read!(u16);
        let hidden_sectors = read!(u32);
        let sectors_total_32 = read!(u32);
        // FAT32 extension, meaningless on FAT12/16 where the same bytes hold
        // the drive number, serial and label.
        let sectors_per_fat_32 = read!(u32);
        let flags = read!(u16);
        let fat_version = read!(u16);
        let root_directory_cluster = read!(u32);
        let fsinfo_sector = read!(u16);
        let backup_boot_sector = read!(u16);
        debug_assert_eq!(reader.position(), 52);

        let mut fs_type = [0u8; 8];
        fs_type.copy_from_slice(&sector[FS_TYPE_OFFSET_FAT16..FS_TYPE_OFFSET_FAT16 + 8]);
        let mut fs_type_32 = [0u8; 8];
        fs_type_32.copy_from_slice(&sector[FS_TYPE_OFFSET_FAT32..FS_TYPE_OFFSET_FAT32 + 8]);
        let signature = u16::from_le_bytes([sector[510], sector[511]]);

        Ok(Self {
            jump,
            oem_id,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            number_of_fats,
            root_entries,
            sectors_total_16,
            media_descriptor,
            sectors_per_fat_16,
            sectors_per_track,
            number_of_heads,
            hidden_sectors,
            sectors_total_32,
            sectors_per_fat_32,
            flags,
            fat_version,
            root_directory_cluster,
            fsinfo_sector,
            backup_boot_sector,
            fs_type,
            fs_type_32,
            signature,
        })
    }

    /// Boot signature present and a "FAT" file system label at either offset.
    pub fn is_fat(&self) -> bool {
        self.signature == BOOT_SIGNATURE
            && (self.fs_type.starts_with(b"FAT") || self.fs_type_32.starts_with(b"FAT"))
    }

    pub fn total_sectors(&self) -> u32 {
        if self.sectors_total_16 != 0 {
            self.sectors_total_16 as u32
        } else {
            self.sectors_total_32
        }
    }

    pub fn sectors_per_fat(&self) -> u32 {
        if self.sectors_per_fat_16 != 0 {
            self.sectors_per_fat_16 as u32
        } else {
            self.sectors_per_fat_32
        }
    }

    /// Validates the parameters and derives the volume layout relative to the boot sector.
    pub fn geometry(&self) -> Result<Geometry> {
        if self.bytes_per_sector as usize != SECTOR_SIZE {
            debug!("unsupported sector size {}", self.bytes_per_sector);
            return Err(Error::NoFilesystem);
        }
        if !is_power_of_2!(self.sectors_per_cluster) {
            debug!("bad cluster size {}", self.sectors_per_cluster);
            return Err(Error::NoFilesystem);
        }
        if self.reserved_sectors == 0
            || !(1..=2).contains(&self.number_of_fats)
            || self.root_entries % 16 != 0
        {
            debug!(
                "bad layout: {} reserved, {} FATs, {} root entries",
                self.reserved_sectors, self.number_of_fats, self.root_entries
            );
            return Err(Error::NoFilesystem);
        }

        let total_sectors = self.total_sectors();
        let fat_size = self.sectors_per_fat();
        if fat_size == 0 {
            return Err(Error::NoFilesystem);
        }

        let root_dir_sectors = blocks_for(self.root_entries as u32 * DIR_ENTRY_SIZE, SECTOR_SIZE as u32);
        let system = (self.number_of_fats as u32)
            .checked_mul(fat_size)
            .and_then(|fats| fats.checked_add(self.reserved_sectors as u32))
            .and_then(|x| x.checked_add(root_dir_sectors))
            .ok_or(Error::NoFilesystem)?;
        if total_sectors <= system {
            return Err(Error::NoFilesystem);
        }
        let cluster_count = (total_sectors - system) / self.sectors_per_cluster as u32;
        if cluster_count == 0 {
            return Err(Error::NoFilesystem);
        }

        let fat_type = FatType::from_cluster_count(cluster_count);
        match fat_type {
            FatType::Fat32 => {
                if self.root_entries != 0
                    || self.root_directory_cluster < 2
                    || self.root_directory_cluster >= cluster_count + 2
                {
                    return Err(Error::NoFilesystem);
                }
            }
            _ => {
                if self.root_entries == 0 {
                    return Err(Error::NoFilesystem);
                }
            }
        }

        Ok(Geometry {
            fat_type,
            sectors_per_cluster: self.sectors_per_cluster as u32,
            reserved_sectors: self.reserved_sectors as u32,
            number_of_fats: self.number_of_fats,
            fat_size,
            root_entries: self.root_entries,
            root_dir_sectors,
            total_sectors,
            cluster_count,
            root_cluster: self.root_directory_cluster,
            fsinfo_sector: self.fsinfo_sector as u32,
        })
    }
}

impl fmt::Display for BootSector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Oem ID                      : {}
Bytes per sector            : {}
Sectors per cluster         : {}
Reserved sectors            : {}
Number of FATs              : {}
Number of directory entries : {}
Sectors per FAT             : {}
Number of heads             : {}
Number of hidden sectors    : {}
Total sectors               : {}",
            String::from_utf8_lossy(&self.oem_id),
            self.bytes_per_sector,
            self.sectors_per_cluster,
            self.reserved_sectors,
            self.number_of_fats,
            self.root_entries,
            self.sectors_per_fat(),
            self.number_of_heads,
            self.hidden_sectors,
            self.total_sectors(),
        )
    }
}

/// Validated volume parameters, sector numbers relative to the boot sector.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Geometry {
    pub fat_type: FatType,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub number_of_fats: u8,
    pub fat_size: u32,
    pub root_entries: u16,
    pub root_dir_sectors: u32,
    pub total_sectors: u32,
    pub cluster_count: u32,
    pub root_cluster: u32,
    pub fsinfo_sector: u32,
}
