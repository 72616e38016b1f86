//! In memory `mkfs` for tests.

use byteorder::{ByteOrder, LittleEndian};

use super::bpb::tests::{encode, Params};
use super::bpb::{BootSector, FatType};
use super::dir::DIR_ENTRY_SIZE;
use crate::disk::ram::RamDisk;
use crate::disk::SECTOR_SIZE;

pub(crate) struct ImageSpec {
    pub params: Params,
    /// Start of the volume behind an MBR, `None` for a bare volume at sector 0.
    pub partition: Option<u32>,
}

impl ImageSpec {
    /// 1.44 MB floppy layout.
    pub fn fat12() -> Self {
        Self::bare(Params {
            sectors_per_cluster: 1,
            reserved: 1,
            fats: 2,
            root_entries: 224,
            total: 2880,
            fat_size: 9,
            fat32: false,
        })
    }

    pub fn fat16() -> Self {
        Self::bare(Params {
            sectors_per_cluster: 1,
            reserved: 1,
            fats: 2,
            root_entries: 512,
            total: 20000,
            fat_size: 80,
            fat32: false,
        })
    }

    /// 32 MiB, 2 KiB clusters, with a FAT too small for its cluster count.
    pub fn scenario_a() -> Self {
        Self::bare(Params {
            sectors_per_cluster: 4,
            reserved: 1,
            fats: 2,
            root_entries: 512,
            total: 65536,
            fat_size: 32,
            fat32: false,
        })
    }

    pub fn fat32() -> Self {
        Self::bare(Params {
            sectors_per_cluster: 1,
            reserved: 32,
            fats: 2,
            root_entries: 0,
            total: 70000,
            fat_size: 540,
            fat32: true,
        })
    }

    fn bare(params: Params) -> Self {
        Self {
            params,
            partition: None,
        }
    }

    pub fn partition_at(mut self, lba: u32) -> Self {
        self.partition = Some(lba);
        self
    }

    pub fn base(&self) -> u32 {
        self.partition.unwrap_or(0)
    }

    pub fn fat_base(&self) -> u32 {
        self.base() + self.params.reserved as u32
    }

    /// First sector of the root directory, the fixed region or cluster 2.
    pub fn root_base(&self) -> u32 {
        self.fat_base() + self.params.fats as u32 * self.params.fat_size
    }

    pub fn fat_type(&self) -> FatType {
        let boot = BootSector::decode(&encode(&self.params)).unwrap();
        boot.geometry().unwrap().fat_type
    }
}

pub(crate) fn format(spec: &ImageSpec) -> RamDisk {
    let p = &spec.params;
    let base = spec.base() as usize * SECTOR_SIZE;
    let mut disk = RamDisk::new_zeroed(spec.base() + p.total);
    let image = disk.as_mut_slice();

    image[base..base + SECTOR_SIZE].copy_from_slice(&encode(p));

    let reserved: &[u8] = match spec.fat_type() {
        FatType::Fat12 => &[0xF8, 0xFF, 0xFF],
        FatType::Fat16 => &[0xF8, 0xFF, 0xFF, 0xFF],
        // Entries 0 and 1, then the root directory cluster.
        FatType::Fat32 => &[
            0xF8, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F, 0xFF, 0xFF, 0xFF, 0x0F,
        ],
    };
    for copy in 0..p.fats as u32 {
        let fat = (spec.fat_base() + copy * p.fat_size) as usize * SECTOR_SIZE;
        image[fat..fat + reserved.len()].copy_from_slice(reserved);
    }

    if p.fat32 {
        let fsinfo = base + SECTOR_SIZE;
        LittleEndian::write_u32(&mut image[fsinfo..], 0x4161_5252);
        LittleEndian::write_u32(&mut image[fsinfo + 484..], 0x6141_7272);
        LittleEndian::write_u32(&mut image[fsinfo + 488..], u32::MAX);
        LittleEndian::write_u32(&mut image[fsinfo + 492..], u32::MAX);
        LittleEndian::write_u16(&mut image[fsinfo + 510..], 0xAA55);
    }

    if let Some(lba) = spec.partition {
        let partition_type = match spec.fat_type() {
            FatType::Fat12 => 0x01,
            FatType::Fat16 => 0x06,
            FatType::Fat32 => 0x0C,
        };
        let entry = &mut image[0x1BE..0x1CE];
        entry[0] = 0x80;
        entry[4] = partition_type;
        LittleEndian::write_u32(&mut entry[8..], lba);
        LittleEndian::write_u32(&mut entry[12..], p.total);
        image[510] = 0x55;
        image[511] = 0xAA;
    }

    disk
}

pub(crate) fn entry(name: &[u8; 11], attributes: u8) -> [u8; DIR_ENTRY_SIZE] {
    let mut raw = [0u8; DIR_ENTRY_SIZE];
    raw[..11].copy_from_slice(name);
    raw[11] = attributes;
    raw
}

/// Writes `entries` to the first slots of the root directory.
pub(crate) fn put_root_entries(disk: &mut RamDisk, spec: &ImageSpec, entries: &[[u8; DIR_ENTRY_SIZE]]) {
    let root = spec.root_base() as usize * SECTOR_SIZE;
    for (i, e) in entries.iter().enumerate() {
        let at = root + i * DIR_ENTRY_SIZE;
        disk.as_mut_slice()[at..at + DIR_ENTRY_SIZE].copy_from_slice(e);
    }
}

pub(crate) fn set_fat16_entry(disk: &mut RamDisk, spec: &ImageSpec, cluster: u32, value: u16) {
    for copy in 0..spec.params.fats as u32 {
        let fat = (spec.fat_base() + copy * spec.params.fat_size) as usize * SECTOR_SIZE;
        let at = fat + cluster as usize * 2;
        LittleEndian::write_u16(&mut disk.as_mut_slice()[at..], value);
    }
}
