use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use super::bpb::FatType;
use super::name::{ShortName, NAME_LEN};
use super::time::FatTimestamp;
use super::volume::Volume;
use crate::disk::{BlockDevice, SECTOR_SIZE};
use crate::{Error, Result};

pub const DIR_ENTRY_SIZE: usize = 32;
const ENTRIES_PER_SECTOR: u32 = (SECTOR_SIZE / DIR_ENTRY_SIZE) as u32;
/// Largest directory FAT allows, 2 MiB of entries. A longer chain is cyclic.
pub(crate) const MAX_DIR_ENTRIES: u32 = 0x10000;

const NAME: usize = 0;
const ATTR: usize = 11;
const CREATE_TIME: usize = 14;
const CREATE_DATE: usize = 16;
const ACCESS_DATE: usize = 18;
const CLUSTER_HI: usize = 20;
const WRITE_TIME: usize = 22;
const WRITE_DATE: usize = 24;
const CLUSTER_LO: usize = 26;
const SIZE: usize = 28;

/// First name byte of the first never used entry.
pub(crate) const END_OF_DIRECTORY: u8 = 0x00;
/// First name byte of a deleted entry.
pub(crate) const DELETED: u8 = 0xE5;

bitflags! {
    pub struct Attributes: u8 {
        const READ_ONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME_ID = 0x08;
        const DIRECTORY = 0x10;
        const ARCHIVE = 0x20;
        const LONG_NAME = Self::READ_ONLY.bits
            | Self::HIDDEN.bits
            | Self::SYSTEM.bits
            | Self::VOLUME_ID.bits;
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum EntryKind {
    File,
    Directory,
    VolumeLabel,
    LongName,
}

impl EntryKind {
    pub fn from_attributes(attributes: Attributes) -> Self {
        if attributes.contains(Attributes::LONG_NAME) {
            Self::LongName
        } else if attributes.contains(Attributes::VOLUME_ID) {
            Self::VolumeLabel
        } else if attributes.contains(Attributes::DIRECTORY) {
            Self::Directory
        } else {
            Self::File
        }
    }
}

/// Read only view of a 32 byte directory record.
pub(crate) struct DirEntry<'a>(&'a [u8]);

impl<'a> DirEntry<'a> {
    pub fn new(raw: &'a [u8]) -> Self {
        debug_assert_eq!(raw.len(), DIR_ENTRY_SIZE);
        Self(raw)
    }

    pub fn first_byte(&self) -> u8 {
        self.0[NAME]
    }

    pub fn is_end(&self) -> bool {
        self.first_byte() == END_OF_DIRECTORY
    }

    pub fn is_free(&self) -> bool {
        self.is_end() || self.first_byte() == DELETED
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.0[NAME..NAME + NAME_LEN]
    }

    pub fn name(&self) -> ShortName {
        let mut raw = [0u8; NAME_LEN];
        raw.copy_from_slice(self.name_bytes());
        ShortName::from_raw(raw)
    }

    pub fn attributes(&self) -> Attributes {
        Attributes::from_bits_truncate(self.0[ATTR])
    }

    pub fn kind(&self) -> EntryKind {
        EntryKind::from_attributes(self.attributes())
    }

    /// The high word only exists on FAT32; elsewhere it may hold access rights.
    pub fn first_cluster(&self, fat_type: FatType) -> u32 {
        let lo = LittleEndian::read_u16(&self.0[CLUSTER_LO..]) as u32;
        if fat_type == FatType::Fat32 {
            lo | (LittleEndian::read_u16(&self.0[CLUSTER_HI..]) as u32) << 16
        } else {
            lo
        }
    }

    pub fn size(&self) -> u32 {
        LittleEndian::read_u32(&self.0[SIZE..])
    }

    pub fn modified(&self) -> FatTimestamp {
        FatTimestamp::from_parts(
            LittleEndian::read_u16(&self.0[WRITE_DATE..]),
            LittleEndian::read_u16(&self.0[WRITE_TIME..]),
        )
    }

    pub fn info(&self) -> FileInfo {
        FileInfo {
            name: self.name(),
            size: self.size(),
            attributes: self.attributes(),
            modified: self.modified(),
            kind: self.kind(),
        }
    }
}

/// Mutable view of a 32 byte directory record.
pub(crate) struct DirEntryMut<'a>(&'a mut [u8]);

impl<'a> DirEntryMut<'a> {
    pub fn new(raw: &'a mut [u8]) -> Self {
        debug_assert_eq!(raw.len(), DIR_ENTRY_SIZE);
        Self(raw)
    }

    /// Overwrites the record with a fresh, empty file.
    pub fn init(&mut self, name: &ShortName, now: FatTimestamp) {
        self.0.iter_mut().for_each(|b| *b = 0);
        self.0[NAME..NAME + NAME_LEN].copy_from_slice(name.as_bytes());
        self.0[ATTR] = Attributes::ARCHIVE.bits();
        LittleEndian::write_u16(&mut self.0[CREATE_TIME..], now.time());
        LittleEndian::write_u16(&mut self.0[CREATE_DATE..], now.date());
        self.set_modified(now);
    }

    pub fn set_first_cluster(&mut self, cluster: u32) {
        LittleEndian::write_u16(&mut self.0[CLUSTER_LO..], cluster as u16);
        LittleEndian::write_u16(&mut self.0[CLUSTER_HI..], (cluster >> 16) as u16);
    }

    pub fn set_size(&mut self, size: u32) {
        LittleEndian::write_u32(&mut self.0[SIZE..], size);
    }

    pub fn set_archive(&mut self) {
        self.0[ATTR] |= Attributes::ARCHIVE.bits();
    }

    pub fn set_modified(&mut self, now: FatTimestamp) {
        LittleEndian::write_u16(&mut self.0[WRITE_TIME..], now.time());
        LittleEndian::write_u16(&mut self.0[WRITE_DATE..], now.date());
        LittleEndian::write_u16(&mut self.0[ACCESS_DATE..], now.date());
    }
}

/// Directory entry as reported by `readdir` and `stat`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileInfo {
    pub name: ShortName,
    pub size: u32,
    pub attributes: Attributes,
    pub modified: FatTimestamp,
    pub kind: EntryKind,
}

impl FileInfo {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

/// Position within the root directory.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) struct DirCursor {
    pub index: u32,
    /// Current cluster of a FAT32 root, 0 for the fixed FAT12/16 root region.
    pub cluster: u32,
    pub sector: u32,
}

impl DirCursor {
    pub fn start(volume: &Volume) -> Option<Self> {
        match volume.fat_type {
            FatType::Fat32 => Some(Self {
                index: 0,
                cluster: volume.dir_base,
                sector: volume.cluster_to_sector(volume.dir_base)?,
            }),
            _ => Some(Self {
                index: 0,
                cluster: 0,
                sector: volume.dir_base,
            }),
        }
    }

    /// Byte offset of the entry within its sector.
    pub fn offset(&self) -> usize {
        (self.index % ENTRIES_PER_SECTOR) as usize * DIR_ENTRY_SIZE
    }

    /// Steps to the next entry. `false` once the directory has no more slots.
    pub fn advance<D: BlockDevice + ?Sized>(
        &mut self,
        volume: &mut Volume,
        disk: &mut D,
    ) -> Result<bool> {
        let index = self.index + 1;
        if index % ENTRIES_PER_SECTOR == 0 {
            if self.cluster == 0 {
                if index >= volume.root_entries as u32 {
                    return Ok(false);
                }
                self.sector += 1;
            } else if (index / ENTRIES_PER_SECTOR) % volume.cluster_sectors == 0 {
                if index >= MAX_DIR_ENTRIES {
                    warn!("root directory chain exceeds {} entries", MAX_DIR_ENTRIES);
                    return Err(Error::IntegrityError);
                }
                let next = match volume.next_cluster(disk, self.cluster)? {
                    Some(next) => next,
                    None => return Ok(false),
                };
                self.cluster = next;
                self.sector = volume
                    .cluster_to_sector(next)
                    .ok_or(Error::IntegrityError)?;
            } else {
                self.sector += 1;
            }
        }
        self.index = index;
        Ok(true)
    }
}

impl Volume {
    /// Loads the entry under `cursor` into the window.
    pub fn load_entry<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        cursor: &DirCursor,
    ) -> Result<DirEntry<'_>> {
        self.window.move_to(disk, cursor.sector)?;
        let offset = cursor.offset();
        Ok(DirEntry::new(
            &self.window.buf()[offset..offset + DIR_ENTRY_SIZE],
        ))
    }

    /// Loads the entry at `sector`/`offset` for editing. The caller marks the window dirty.
    pub fn entry_mut<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        sector: u32,
        offset: usize,
    ) -> Result<DirEntryMut<'_>> {
        self.window.move_to(disk, sector)?;
        Ok(DirEntryMut::new(
            &mut self.window.buf_mut()[offset..offset + DIR_ENTRY_SIZE],
        ))
    }

    /// Searches the root directory for a live entry called `name`.
    pub fn find_entry<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
        name: &ShortName,
    ) -> Result<Option<(DirCursor, FileInfo, u32)>> {
        let mut cursor = match DirCursor::start(self) {
            Some(cursor) => cursor,
            None => return Err(Error::IntegrityError),
        };
        loop {
            let fat_type = self.fat_type;
            let entry = self.load_entry(disk, &cursor)?;
            if entry.is_end() {
                return Ok(None);
            }
            if entry.first_byte() != DELETED
                && entry.kind() != EntryKind::LongName
                && entry.kind() != EntryKind::VolumeLabel
                && entry.name_bytes() == name.as_bytes()
            {
                let cluster = entry.first_cluster(fat_type);
                return Ok(Some((cursor, entry.info(), cluster)));
            }
            if !cursor.advance(self, disk)? {
                return Ok(None);
            }
        }
    }

    /// First deleted or never used slot of the root directory.
    pub fn find_free_slot<D: BlockDevice + ?Sized>(
        &mut self,
        disk: &mut D,
    ) -> Result<Option<DirCursor>> {
        let mut cursor = match DirCursor::start(self) {
            Some(cursor) => cursor,
            None => return Err(Error::IntegrityError),
        };
        loop {
            if self.load_entry(disk, &cursor)?.is_free() {
                return Ok(Some(cursor));
            }
            if !cursor.advance(self, disk)? {
                return Ok(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::fat::testutil::{self, ImageSpec};

    #[test]
    fn test_entry_fields() {
        crate::tests_init();

        let mut raw = testutil::entry(b"TEST    TXT", 0x21);
        raw[20..22].copy_from_slice(&0x0001u16.to_le_bytes());
        raw[26..28].copy_from_slice(&0x0203u16.to_le_bytes());
        raw[28..32].copy_from_slice(&13u32.to_le_bytes());
        raw[22..24].copy_from_slice(&0x6000u16.to_le_bytes());
        raw[24..26].copy_from_slice(&0x5B8Cu16.to_le_bytes());

        let entry = DirEntry::new(&raw);
        assert_eq!(entry.name().to_string(), "TEST.TXT");
        assert_eq!(
            entry.attributes(),
            Attributes::READ_ONLY | Attributes::ARCHIVE
        );
        assert_eq!(entry.kind(), EntryKind::File);
        assert_eq!(entry.first_cluster(FatType::Fat32), 0x0001_0203);
        assert_eq!(entry.first_cluster(FatType::Fat16), 0x0203);
        assert_eq!(entry.size(), 13);
        assert_eq!(entry.modified().to_string(), "2025-12-12 12:00:00");
    }

    #[test]
    fn test_entry_kinds() {
        crate::tests_init();

        macro_rules! test_kind {
            ($attr:expr, $kind:expr) => {{
                let raw = testutil::entry(b"X          ", $attr);
                assert_eq!(DirEntry::new(&raw).kind(), $kind);
            }};
        }

        test_kind!(0x00, EntryKind::File);
        test_kind!(0x20, EntryKind::File);
        test_kind!(0x10, EntryKind::Directory);
        test_kind!(0x08, EntryKind::VolumeLabel);
        test_kind!(0x28, EntryKind::VolumeLabel);
        test_kind!(0x0F, EntryKind::LongName);
    }

    #[test]
    fn test_init_entry() {
        crate::tests_init();

        let mut raw = [0xAAu8; DIR_ENTRY_SIZE];
        let now = FatTimestamp::from_raw(0x5B8C_6000);
        let name = ShortName::parse("new.bin").unwrap();
        {
            let mut entry = DirEntryMut::new(&mut raw);
            entry.init(&name, now);
            entry.set_first_cluster(0x0012_3456);
            entry.set_size(4096);
        }

        let entry = DirEntry::new(&raw);
        assert_eq!(entry.name(), name);
        assert_eq!(entry.attributes(), Attributes::ARCHIVE);
        assert_eq!(entry.first_cluster(FatType::Fat32), 0x0012_3456);
        assert_eq!(entry.size(), 4096);
        assert_eq!(entry.modified(), now);
        assert_eq!(raw[12], 0);
        assert_eq!(raw[13], 0);
    }

    #[test]
    fn test_cursor_fixed_root() {
        crate::tests_init();

        let mut disk = testutil::format(&ImageSpec::fat12());
        let mut volume = Volume::mount(&mut disk, 1).unwrap();
        let mut cursor = DirCursor::start(&volume).unwrap();
        assert_eq!(cursor.sector, 19);

        let mut steps = 0;
        while cursor.advance(&mut volume, &mut disk).unwrap() {
            steps += 1;
        }
        assert_eq!(steps, 223);
        assert_eq!(cursor.sector, 19 + 13);
        assert_eq!(cursor.offset(), 15 * DIR_ENTRY_SIZE);
    }

    #[test]
    fn test_cursor_follows_fat32_chain() {
        crate::tests_init();

        let mut disk = testutil::format(&ImageSpec::fat32());
        let mut volume = Volume::mount(&mut disk, 1).unwrap();

        // Root cluster 2, extended with cluster 9.
        volume.put_fat(&mut disk, 2, 9).unwrap();
        volume.put_fat(&mut disk, 9, 0x0FFF_FFFF).unwrap();

        let mut cursor = DirCursor::start(&volume).unwrap();
        for _ in 0..15 {
            assert!(cursor.advance(&mut volume, &mut disk).unwrap());
        }
        assert_eq!(cursor.cluster, 2);
        assert!(cursor.advance(&mut volume, &mut disk).unwrap());
        assert_eq!(cursor.cluster, 9);
        assert_eq!(cursor.sector, volume.cluster_to_sector(9).unwrap());
        for _ in 0..15 {
            assert!(cursor.advance(&mut volume, &mut disk).unwrap());
        }
        assert!(!cursor.advance(&mut volume, &mut disk).unwrap());
    }

    #[test]
    fn test_find_entry() {
        crate::tests_init();

        let mut disk = testutil::format(&ImageSpec::fat16());
        testutil::put_root_entries(
            &mut disk,
            &ImageSpec::fat16(),
            &[
                testutil::entry(b"VOLUME     ", 0x08),
                testutil::entry(b"\xE5ONE    TXT", 0x20),
                testutil::entry(b"TWO     TXT", 0x20),
                testutil::entry(b"SUB        ", 0x10),
            ],
        );
        let mut volume = Volume::mount(&mut disk, 1).unwrap();

        let (cursor, info, _) = volume
            .find_entry(&mut disk, &ShortName::parse("two.txt").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(cursor.index, 2);
        assert_eq!(info.kind, EntryKind::File);

        assert!(volume
            .find_entry(&mut disk, &ShortName::parse("ONE.TXT").unwrap())
            .unwrap()
            .is_none());
        assert!(volume
            .find_entry(&mut disk, &ShortName::parse("VOLUME").unwrap())
            .unwrap()
            .is_none());

        // The tombstone is the first reusable slot.
        let slot = volume.find_free_slot(&mut disk).unwrap().unwrap();
        assert_eq!(slot.index, 1);
    }
}
