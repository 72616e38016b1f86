//! FAT12/16/32 engine working on the root directory of a single volume.

pub mod bpb;
pub mod dir;
mod file;
pub mod name;
mod table;
pub mod time;
mod volume;
mod window;

#[cfg(test)]
pub(crate) mod testutil;
#[cfg(test)]
mod tests;

pub use self::bpb::FatType;
pub use self::dir::{Attributes, EntryKind, FileInfo};
pub use self::file::{File, OpenMode};
pub use self::name::ShortName;
pub use self::time::{FatTimestamp, FixedTime, LocalTime, TimeSource};
pub use self::volume::VolumeInfo;

use self::dir::DirCursor;
use self::name::split_path;
use self::volume::Volume;
use crate::disk::{BlockDevice, DiskStatus};
use crate::{Error, Result};

/// Number of logical drives.
pub const MAX_VOLUMES: usize = 1;

/// Owns the block device and every volume mounted from it.
pub struct FileSystem<D: BlockDevice> {
    disk: D,
    volumes: [Option<Volume>; MAX_VOLUMES],
    mount_seq: u16,
    time: Box<dyn TimeSource>,
}

/// Open root directory listing.
#[derive(Debug)]
pub struct Dir {
    drive: u8,
    mount_id: u16,
    /// `None` once the end of the directory was reached.
    cursor: Option<DirCursor>,
}

fn volume_slot(volumes: &mut [Option<Volume>; MAX_VOLUMES], drive: u8) -> Result<&mut Volume> {
    volumes
        .get_mut(drive as usize)
        .ok_or(Error::InvalidDrive)?
        .as_mut()
        .ok_or(Error::NotEnabled)
}

/// Volume a handle was opened on, as long as it is still mounted.
fn object_volume<'a, D: BlockDevice + ?Sized>(
    volumes: &'a mut [Option<Volume>; MAX_VOLUMES],
    disk: &D,
    drive: u8,
    mount_id: u16,
) -> Result<&'a mut Volume> {
    let volume = volumes
        .get_mut(drive as usize)
        .and_then(Option::as_mut)
        .filter(|v| v.id == mount_id)
        .ok_or(Error::InvalidObject)?;
    if disk.status().contains(DiskStatus::NOINIT) {
        return Err(Error::NotReady);
    }
    Ok(volume)
}

impl<D: BlockDevice> FileSystem<D> {
    pub fn new(disk: D) -> Self {
        Self::with_time_source(disk, FixedTime::default())
    }

    pub fn with_time_source(disk: D, time: impl TimeSource + 'static) -> Self {
        Self {
            disk,
            volumes: Default::default(),
            mount_seq: 0,
            time: Box::new(time),
        }
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// Direct device access. Anything written here bypasses the sector
    /// window, so remount afterwards.
    pub fn disk_mut(&mut self) -> &mut D {
        &mut self.disk
    }

    pub fn into_disk(self) -> D {
        self.disk
    }

    /// Mounts (`enable`) or forgets the volume of `drive`. Forgetting never
    /// touches the media, so unsynced changes are lost.
    pub fn mount(&mut self, drive: u8, enable: bool) -> Result<()> {
        let slot = self
            .volumes
            .get_mut(drive as usize)
            .ok_or(Error::InvalidDrive)?;
        let previous = slot.take();
        if !enable {
            if previous.is_some() {
                debug!("drive {} unmounted", drive);
            }
            return Ok(());
        }

        self.mount_seq = self.mount_seq.wrapping_add(1).max(1);
        let volume = Volume::mount(&mut self.disk, self.mount_seq)?;
        info!(
            "drive {} mounted: {}, {} clusters",
            drive,
            volume.fat_type,
            volume.cluster_count()
        );
        self.volumes[drive as usize] = Some(volume);
        Ok(())
    }

    pub fn unmount(&mut self, drive: u8) -> Result<()> {
        self.mount(drive, false)
    }

    pub fn volume_info(&self, drive: u8) -> Result<VolumeInfo> {
        self.volumes
            .get(drive as usize)
            .ok_or(Error::InvalidDrive)?
            .as_ref()
            .map(Volume::info)
            .ok_or(Error::NotEnabled)
    }

    /// Number of free clusters on the volume named by `path`.
    pub fn getfree(&mut self, path: &str) -> Result<u32> {
        let (drive, _) = split_path(path)?;
        let volume = volume_slot(&mut self.volumes, drive)?;
        match volume.free_clusters {
            Some(free) if free <= volume.cluster_count() => Ok(free),
            _ => {
                let free = volume.count_free(&mut self.disk)?;
                volume.free_clusters = Some(free);
                volume.touch_fsinfo();
                Ok(free)
            }
        }
    }

    /// Only the root directory can be listed.
    pub fn opendir(&mut self, path: &str) -> Result<Dir> {
        let (drive, name) = split_path(path)?;
        let volume = volume_slot(&mut self.volumes, drive)?;
        if !name.is_empty() {
            let name = ShortName::parse(name)?;
            return match volume.find_entry(&mut self.disk, &name)? {
                Some(_) => Err(Error::NoPath),
                None => Err(Error::NoFile),
            };
        }
        Ok(Dir {
            drive,
            mount_id: volume.id,
            cursor: Some(DirCursor::start(volume).ok_or(Error::IntegrityError)?),
        })
    }

    /// Next live entry, skipping deleted entries, long name fragments and the
    /// volume label. `None` at the end of the directory.
    pub fn readdir(&mut self, dir: &mut Dir) -> Result<Option<FileInfo>> {
        let volume = object_volume(&mut self.volumes, &self.disk, dir.drive, dir.mount_id)?;
        let disk = &mut self.disk;
        while let Some(mut cursor) = dir.cursor {
            let info = {
                let entry = volume.load_entry(disk, &cursor)?;
                if entry.is_end() {
                    dir.cursor = None;
                    break;
                }
                match entry.kind() {
                    EntryKind::File | EntryKind::Directory if !entry.is_free() => {
                        Some(entry.info())
                    }
                    _ => None,
                }
            };
            dir.cursor = if cursor.advance(volume, disk)? {
                Some(cursor)
            } else {
                None
            };
            if info.is_some() {
                return Ok(info);
            }
        }
        Ok(None)
    }

    pub fn rewinddir(&mut self, dir: &mut Dir) -> Result<()> {
        let volume = object_volume(&mut self.volumes, &self.disk, dir.drive, dir.mount_id)?;
        dir.cursor = Some(DirCursor::start(volume).ok_or(Error::IntegrityError)?);
        Ok(())
    }

    pub fn closedir(&mut self, dir: &mut Dir) -> Result<()> {
        object_volume(&mut self.volumes, &self.disk, dir.drive, dir.mount_id)?;
        dir.mount_id = 0;
        Ok(())
    }

    pub fn stat(&mut self, path: &str) -> Result<FileInfo> {
        let (drive, name) = split_path(path)?;
        let volume = volume_slot(&mut self.volumes, drive)?;
        if name.is_empty() {
            return Err(Error::InvalidName);
        }
        let name = ShortName::parse(name)?;
        match volume.find_entry(&mut self.disk, &name)? {
            Some((_, info, _)) => Ok(info),
            None => Err(Error::NoFile),
        }
    }
}
