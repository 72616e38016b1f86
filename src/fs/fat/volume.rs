use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::bpb::{BootSector, FatType};
use super::window::{FatMirror, SectorWindow};
use crate::disk::{BlockDevice, DiskStatus, IoctlCommand, SECTOR_SIZE};
use crate::part::Mbr;
use crate::{Error, Result};

const FSINFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIGNATURE: u16 = 0xAA55;
const FSINFO_STRUCT_OFFSET: usize = 484;
const FSINFO_FREE_COUNT_OFFSET: usize = 488;
const FSINFO_NEXT_FREE_OFFSET: usize = 492;

struct FsInfo {
    sector: u32,
    dirty: bool,
}

/// Mounted FAT volume. Sector numbers are absolute on the device.
pub(crate) struct Volume {
    pub id: u16,
    pub fat_type: FatType,
    pub cluster_sectors: u32,
    pub fat_count: u8,
    pub fat_size: u32,
    pub root_entries: u16,
    /// Number of FAT entries, `cluster_count + 2`.
    pub n_fatent: u32,
    pub volume_base: u32,
    pub fat_base: u32,
    /// First root directory sector, or the root cluster on FAT32.
    pub dir_base: u32,
    pub data_base: u32,
    pub last_cluster: Option<u32>,
    pub free_clusters: Option<u32>,
    fsinfo: Option<FsInfo>,
    pub window: SectorWindow,
}

impl Volume {
    pub fn mount<D: BlockDevice + ?Sized>(disk: &mut D, id: u16) -> Result<Self> {
        let status = disk.initialize();
        if status.intersects(DiskStatus::NOINIT | DiskStatus::NODISK) {
            return Err(Error::NotReady);
        }

        let mut window = SectorWindow::new();
        window.move_to(disk, 0)?;
        let mut volume_base = 0;
        let mut boot = BootSector::decode(window.buf())?;
        if !boot.is_fat() {
            let lba = Mbr::decode(window.buf())
                .and_then(|mbr| mbr.first_fat_partition().map(|p| p.lba))
                .ok_or(Error::NoFilesystem)?;
            debug!("no boot record at sector 0, trying partition at {}", lba);

            window.move_to(disk, lba)?;
            boot = BootSector::decode(window.buf())?;
            if !boot.is_fat() {
                return Err(Error::NoFilesystem);
            }
            volume_base = lba;
        }
        debug!("boot sector at {}\n{}", volume_base, boot);

        let g = boot.geometry()?;
        // Every absolute sector below lies within the volume.
        if volume_base.checked_add(g.total_sectors).is_none() {
            debug!(
                "volume of {} sectors at {} exceeds 32-bit sector numbers",
                g.total_sectors, volume_base
            );
            return Err(Error::NoFilesystem);
        }
        let fat_base = volume_base + g.reserved_sectors;
        let fats_end = fat_base + g.number_of_fats as u32 * g.fat_size;
        let dir_base = match g.fat_type {
            FatType::Fat32 => g.root_cluster,
            _ => fats_end,
        };
        window.set_mirror(FatMirror {
            start: fat_base,
            size: g.fat_size,
            copies: g.number_of_fats,
        });

        let mut volume = Self {
            id,
            fat_type: g.fat_type,
            cluster_sectors: g.sectors_per_cluster,
            fat_count: g.number_of_fats,
            fat_size: g.fat_size,
            root_entries: g.root_entries,
            n_fatent: g.cluster_count + 2,
            volume_base,
            fat_base,
            dir_base,
            data_base: fats_end + g.root_dir_sectors,
            last_cluster: None,
            free_clusters: None,
            fsinfo: None,
            window,
        };
        debug!(
            "{} volume: {} clusters of {} sectors, FAT at {}, data at {}",
            volume.fat_type,
            g.cluster_count,
            volume.cluster_sectors,
            volume.fat_base,
            volume.data_base
        );

        if g.fat_type == FatType::Fat32
            && g.fsinfo_sector != 0
            && g.fsinfo_sector < g.reserved_sectors
        {
            volume.load_fsinfo(disk, volume_base + g.fsinfo_sector)?;
        }
        Ok(volume)
    }

    fn load_fsinfo<D: BlockDevice + ?Sized>(&mut self, disk: &mut D, sector: u32) -> Result<()> {
        self.window.move_to(disk, sector)?;
        let buf = self.window.buf();
        if LittleEndian::read_u32(&buf[0..4]) != FSINFO_LEAD_SIGNATURE
            || LittleEndian::read_u32(&buf[FSINFO_STRUCT_OFFSET..]) != FSINFO_STRUCT_SIGNATURE
            || LittleEndian::read_u16(&buf[SECTOR_SIZE - 2..]) != FSINFO_TRAIL_SIGNATURE
        {
            warn!("FSInfo sector {} has no valid signature, ignoring it", sector);
            return Ok(());
        }

        let free = LittleEndian::read_u32(&buf[FSINFO_FREE_COUNT_OFFSET..]);
        let next = LittleEndian::read_u32(&buf[FSINFO_NEXT_FREE_OFFSET..]);
        if free <= self.n_fatent - 2 {
            self.free_clusters = Some(free);
        } else if free != u32::MAX {
            warn!("stale FSInfo free count {}", free);
        }
        if next >= 2 && next < self.n_fatent {
            self.last_cluster = Some(next);
        }
        trace!("FSInfo: free {:?}, next {:?}", self.free_clusters, self.last_cluster);

        self.fsinfo = Some(FsInfo {
            sector,
            dirty: false,
        });
        Ok(())
    }

    /// Records that the free count or allocation hint changed.
    pub fn touch_fsinfo(&mut self) {
        if let Some(fsinfo) = self.fsinfo.as_mut() {
            fsinfo.dirty = true;
        }
    }

    /// Flushes the window and FSInfo, then asks the device to finish pending writes.
    pub fn sync<D: BlockDevice + ?Sized>(&mut self, disk: &mut D) -> Result<()> {
        if let Some(FsInfo { sector, dirty: true }) = self.fsinfo {
            self.window.move_to(disk, sector)?;
            let free = self.free_clusters.unwrap_or(u32::MAX);
            let next = match self.last_cluster {
                Some(hint) if self.is_valid_cluster(hint) => hint,
                _ => u32::MAX,
            };
            let buf = self.window.buf_mut();
            LittleEndian::write_u32(&mut buf[FSINFO_FREE_COUNT_OFFSET..], free);
            LittleEndian::write_u32(&mut buf[FSINFO_NEXT_FREE_OFFSET..], next);
            self.window.mark_dirty();
            self.window.sync(disk)?;
            if let Some(fsinfo) = self.fsinfo.as_mut() {
                fsinfo.dirty = false;
            }
        }
        self.window.sync(disk)?;
        disk.ioctl(IoctlCommand::Sync)?;
        Ok(())
    }

    pub fn cluster_bytes(&self) -> u32 {
        self.cluster_sectors * SECTOR_SIZE as u32
    }

    pub fn cluster_count(&self) -> u32 {
        self.n_fatent - 2
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        cluster >= 2 && cluster < self.n_fatent
    }

    /// First sector of `cluster`, `None` when it is not a data cluster.
    pub fn cluster_to_sector(&self, cluster: u32) -> Option<u32> {
        if !self.is_valid_cluster(cluster) {
            return None;
        }
        Some(self.data_base + (cluster - 2) * self.cluster_sectors)
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo {
            fat_type: self.fat_type,
            cluster_sectors: self.cluster_sectors,
            cluster_count: self.cluster_count(),
            fat_count: self.fat_count,
            fat_size: self.fat_size,
            root_entries: self.root_entries,
            volume_base: self.volume_base,
            fat_base: self.fat_base,
            data_base: self.data_base,
        }
    }
}

/// Layout of a mounted volume as reported to callers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VolumeInfo {
    pub fat_type: FatType,
    pub cluster_sectors: u32,
    pub cluster_count: u32,
    pub fat_count: u8,
    pub fat_size: u32,
    /// Zero on FAT32.
    pub root_entries: u16,
    pub volume_base: u32,
    pub fat_base: u32,
    pub data_base: u32,
}

impl VolumeInfo {
    pub fn cluster_bytes(&self) -> u32 {
        self.cluster_sectors * SECTOR_SIZE as u32
    }
}

impl fmt::Display for VolumeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "File system                 : {}
Volume start                : {}
Sectors per cluster         : {}
Clusters                    : {}
Number of FATs              : {}
Sectors per FAT             : {}
Root directory entries      : {}
FAT start                   : {}
Data start                  : {}",
            self.fat_type,
            self.volume_base,
            self.cluster_sectors,
            self.cluster_count,
            self.fat_count,
            self.fat_size,
            self.root_entries,
            self.fat_base,
            self.data_base,
        )
    }
}
