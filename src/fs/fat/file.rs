use bitflags::bitflags;

use super::dir::{Attributes, EntryKind};
use super::name::{split_path, ShortName};
use super::time::FatTimestamp;
use super::volume::Volume;
use super::{object_volume, volume_slot, FileSystem};
use crate::disk::{BlockDevice, DiskStatus, SECTOR_SIZE};
use crate::{Error, Result};

bitflags! {
    pub struct OpenMode: u8 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// Create the file, failing if it exists.
        const CREATE_NEW = 0x04;
        /// Create the file, truncating it if it exists.
        const CREATE_ALWAYS = 0x08;
        /// Open the file, creating it if it does not exist.
        const OPEN_ALWAYS = 0x10;
        /// Like `OPEN_ALWAYS`, positioned at the end of the file.
        const OPEN_APPEND = 0x30;
    }
}

/// Open file. Only valid for the mount it was opened on.
#[derive(Debug)]
pub struct File {
    drive: u8,
    mount_id: u16,
    mode: OpenMode,
    offset: u32,
    size: u32,
    first_cluster: u32,
    /// Cluster holding the byte before `offset`, or the first cluster at offset 0.
    cluster: u32,
    dir_sector: u32,
    dir_offset: usize,
    modified: bool,
    poisoned: bool,
}

impl File {
    pub fn tell(&self) -> u32 {
        self.offset
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.size
    }

    fn sector(&self, volume: &Volume) -> Result<u32> {
        let base = volume
            .cluster_to_sector(self.cluster)
            .ok_or(Error::IntegrityError)?;
        Ok(base + (self.offset / SECTOR_SIZE as u32) % volume.cluster_sectors)
    }

    /// Sectors that can be transferred in one go from a sector aligned offset.
    fn run_length(&self, volume: &Volume, bytes: usize) -> u32 {
        let left_in_cluster =
            volume.cluster_sectors - (self.offset / SECTOR_SIZE as u32) % volume.cluster_sectors;
        ((bytes / SECTOR_SIZE) as u32).min(left_in_cluster)
    }

    fn advance(&mut self, n: usize) {
        self.offset += n as u32;
    }

    fn read<D: BlockDevice + ?Sized>(
        &mut self,
        volume: &mut Volume,
        disk: &mut D,
        buf: &mut [u8],
    ) -> Result<usize> {
        let want = buf.len().min(self.size.saturating_sub(self.offset) as usize);
        let cluster_bytes = volume.cluster_bytes();

        let mut done = 0;
        while done < want {
            if self.offset % cluster_bytes == 0 {
                self.cluster = if self.offset == 0 {
                    self.first_cluster
                } else {
                    volume
                        .next_cluster(disk, self.cluster)?
                        .ok_or(Error::IntegrityError)?
                };
            }
            let sector = self.sector(volume)?;
            let in_sector = self.offset as usize % SECTOR_SIZE;
            let left = want - done;

            let n = if in_sector == 0 && left >= SECTOR_SIZE {
                let count = self.run_length(volume, left);
                let chunk = &mut buf[done..done + count as usize * SECTOR_SIZE];
                disk.read(chunk, sector, count)?;
                volume.window.patch_read(chunk, sector, count);
                chunk.len()
            } else {
                volume.window.move_to(disk, sector)?;
                let n = left.min(SECTOR_SIZE - in_sector);
                buf[done..done + n]
                    .copy_from_slice(&volume.window.buf()[in_sector..in_sector + n]);
                n
            };
            done += n;
            self.advance(n);
        }
        Ok(done)
    }

    fn write<D: BlockDevice + ?Sized>(
        &mut self,
        volume: &mut Volume,
        disk: &mut D,
        buf: &[u8],
    ) -> Result<usize> {
        let len = buf.len().min((u32::MAX - self.offset) as usize);
        let cluster_bytes = volume.cluster_bytes();

        let mut done = 0;
        while done < len {
            if self.offset % cluster_bytes == 0 {
                let next = if self.offset == 0 && self.first_cluster != 0 {
                    Some(self.first_cluster)
                } else if self.offset == 0 {
                    volume.create_chain(disk, 0)?
                } else {
                    volume.create_chain(disk, self.cluster)?
                };
                match next {
                    Some(cluster) => {
                        self.cluster = cluster;
                        if self.first_cluster == 0 {
                            self.first_cluster = cluster;
                        }
                    }
                    None => {
                        debug!("volume full after {} bytes", done);
                        break;
                    }
                }
            }
            let sector = self.sector(volume)?;
            let in_sector = self.offset as usize % SECTOR_SIZE;
            let left = len - done;

            let n = if in_sector == 0 && left >= SECTOR_SIZE {
                let count = self.run_length(volume, left);
                let chunk = &buf[done..done + count as usize * SECTOR_SIZE];
                disk.write(chunk, sector, count)?;
                volume.window.refresh_written(chunk, sector, count);
                chunk.len()
            } else {
                volume.window.move_to(disk, sector)?;
                let n = left.min(SECTOR_SIZE - in_sector);
                volume.window.buf_mut()[in_sector..in_sector + n]
                    .copy_from_slice(&buf[done..done + n]);
                volume.window.mark_dirty();
                n
            };
            done += n;
            self.advance(n);
            self.size = self.size.max(self.offset);
            self.modified = true;
        }

        if done == 0 && !buf.is_empty() {
            return Err(Error::Denied);
        }
        Ok(done)
    }

    /// Going backwards restarts the walk at the first cluster.
    fn seek<D: BlockDevice + ?Sized>(
        &mut self,
        volume: &mut Volume,
        disk: &mut D,
        mut offset: u32,
    ) -> Result<()> {
        let writable = self.mode.contains(OpenMode::WRITE);
        if !writable {
            offset = offset.min(self.size);
        }

        let current = self.offset;
        self.offset = 0;
        if offset > 0 {
            let cluster_bytes = volume.cluster_bytes();
            let mut cluster;
            if current > 0 && (offset - 1) / cluster_bytes >= (current - 1) / cluster_bytes {
                self.offset = (current - 1) & !(cluster_bytes - 1);
                offset -= self.offset;
                cluster = self.cluster;
            } else {
                cluster = self.first_cluster;
                if cluster == 0 {
                    if !writable {
                        return Err(Error::IntegrityError);
                    }
                    if let Some(first) = volume.create_chain(disk, 0)? {
                        cluster = first;
                        self.first_cluster = first;
                        self.modified = true;
                    }
                }
                self.cluster = cluster;
            }

            if cluster != 0 {
                while offset > cluster_bytes {
                    offset -= cluster_bytes;
                    self.offset += cluster_bytes;
                    let next = if writable {
                        volume.create_chain(disk, cluster)?
                    } else {
                        Some(
                            volume
                                .next_cluster(disk, cluster)?
                                .ok_or(Error::IntegrityError)?,
                        )
                    };
                    match next {
                        Some(next) => cluster = next,
                        None => {
                            offset = 0;
                            break;
                        }
                    }
                    self.cluster = cluster;
                }
                self.offset += offset;
            }
        }

        if self.offset > self.size {
            self.size = self.offset;
            self.modified = true;
        }
        Ok(())
    }

    /// Writes size, first cluster and timestamp back to the directory entry.
    fn sync<D: BlockDevice + ?Sized>(
        &mut self,
        volume: &mut Volume,
        disk: &mut D,
        now: FatTimestamp,
    ) -> Result<()> {
        if self.modified {
            let mut entry = volume.entry_mut(disk, self.dir_sector, self.dir_offset)?;
            entry.set_archive();
            entry.set_first_cluster(self.first_cluster);
            entry.set_size(self.size);
            entry.set_modified(now);
            volume.window.mark_dirty();
            self.modified = false;
        }
        volume.sync(disk)
    }

    fn check_usable(&self) -> Result<()> {
        if self.poisoned {
            return Err(Error::IntegrityError);
        }
        Ok(())
    }

    /// Marks the handle unusable after a failure that may have left it inconsistent.
    fn settle<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!("file handle poisoned: {}", e);
                self.poisoned = true;
            }
        }
        result
    }
}

impl<D: BlockDevice> FileSystem<D> {
    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<File> {
        let (drive, name) = split_path(path)?;
        let volume = volume_slot(&mut self.volumes, drive)?;
        let disk = &mut self.disk;
        if name.is_empty() {
            return Err(Error::InvalidName);
        }
        let name = ShortName::parse(name)?;
        let protected = disk.status().contains(DiskStatus::PROTECT);
        if protected
            && mode.intersects(OpenMode::WRITE | OpenMode::CREATE_NEW | OpenMode::CREATE_ALWAYS)
        {
            return Err(Error::WriteProtected);
        }
        let now = self.time.now();

        let (cursor, first_cluster, size) = match volume.find_entry(disk, &name)? {
            Some((cursor, info, cluster)) => {
                if info.kind != EntryKind::File {
                    return Err(Error::NoFile);
                }
                if mode.contains(OpenMode::CREATE_NEW) {
                    return Err(Error::Exists);
                }
                if info.attributes.contains(Attributes::READ_ONLY)
                    && mode.intersects(OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
                {
                    return Err(Error::Denied);
                }

                if mode.contains(OpenMode::CREATE_ALWAYS) {
                    if cluster != 0 {
                        volume.remove_chain(disk, cluster)?;
                    }
                    let mut entry = volume.entry_mut(disk, cursor.sector, cursor.offset())?;
                    entry.set_first_cluster(0);
                    entry.set_size(0);
                    entry.set_archive();
                    entry.set_modified(now);
                    volume.window.mark_dirty();
                    volume.window.sync(disk)?;
                    debug!("truncated {}", name);
                    (cursor, 0, 0)
                } else {
                    (cursor, cluster, info.size)
                }
            }
            None => {
                if !mode.intersects(
                    OpenMode::CREATE_NEW | OpenMode::CREATE_ALWAYS | OpenMode::OPEN_ALWAYS,
                ) {
                    return Err(Error::NoFile);
                }
                if protected {
                    return Err(Error::WriteProtected);
                }
                let cursor = volume.find_free_slot(disk)?.ok_or(Error::Denied)?;
                volume
                    .entry_mut(disk, cursor.sector, cursor.offset())?
                    .init(&name, now);
                volume.window.mark_dirty();
                volume.window.sync(disk)?;
                debug!("created {} at directory index {}", name, cursor.index);
                (cursor, 0, 0)
            }
        };

        let mut file = File {
            drive,
            mount_id: volume.id,
            mode,
            offset: 0,
            size,
            first_cluster,
            cluster: first_cluster,
            dir_sector: cursor.sector,
            dir_offset: cursor.offset(),
            modified: false,
            poisoned: false,
        };
        if mode.contains(OpenMode::OPEN_APPEND) {
            let result = file.seek(volume, disk, size);
            file.settle(result)?;
        }
        Ok(file)
    }

    /// Reads up to `buf.len()` bytes, fewer at the end of the file.
    pub fn read(&mut self, file: &mut File, buf: &mut [u8]) -> Result<usize> {
        let volume = object_volume(&mut self.volumes, &self.disk, file.drive, file.mount_id)?;
        file.check_usable()?;
        if !file.mode.contains(OpenMode::READ) {
            return Err(Error::Denied);
        }
        let result = file.read(volume, &mut self.disk, buf);
        file.settle(result)
    }

    /// Writes `buf` at the current offset, growing the file as needed. On a
    /// full volume the bytes stored so far are reported.
    pub fn write(&mut self, file: &mut File, buf: &[u8]) -> Result<usize> {
        let volume = object_volume(&mut self.volumes, &self.disk, file.drive, file.mount_id)?;
        file.check_usable()?;
        if !file.mode.contains(OpenMode::WRITE) {
            return Err(Error::Denied);
        }
        if self.disk.status().contains(DiskStatus::PROTECT) {
            return Err(Error::WriteProtected);
        }
        let result = file.write(volume, &mut self.disk, buf);
        file.settle(result)
    }

    pub fn seek(&mut self, file: &mut File, offset: u32) -> Result<()> {
        let volume = object_volume(&mut self.volumes, &self.disk, file.drive, file.mount_id)?;
        file.check_usable()?;
        let result = file.seek(volume, &mut self.disk, offset);
        file.settle(result)
    }

    pub fn sync(&mut self, file: &mut File) -> Result<()> {
        let volume = object_volume(&mut self.volumes, &self.disk, file.drive, file.mount_id)?;
        file.check_usable()?;
        let now = self.time.now();
        let result = file.sync(volume, &mut self.disk, now);
        file.settle(result)
    }

    /// Flushes the file and invalidates the handle. A poisoned handle is
    /// invalidated as well, but reports the failure that poisoned it.
    pub fn close(&mut self, file: &mut File) -> Result<()> {
        if let Err(Error::IntegrityError) = file.check_usable() {
            object_volume(&mut self.volumes, &self.disk, file.drive, file.mount_id)?;
            file.mount_id = 0;
            return Err(Error::IntegrityError);
        }
        self.sync(file)?;
        file.mount_id = 0;
        Ok(())
    }

    pub fn putc(&mut self, file: &mut File, c: u8) -> Result<()> {
        self.write(file, &[c]).map(|_| ())
    }

    pub fn puts(&mut self, file: &mut File, s: &str) -> Result<usize> {
        self.write(file, s.as_bytes())
    }

    /// Reads one line of at most `max` bytes. The `\n` is kept, `\r` is dropped.
    /// Returns an empty string at the end of the file.
    pub fn gets(&mut self, file: &mut File, max: usize) -> Result<String> {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        while line.len() < max {
            if self.read(file, &mut byte)? == 0 {
                break;
            }
            match byte[0] {
                b'\r' => {}
                b'\n' => {
                    line.push(b'\n');
                    break;
                }
                c => line.push(c),
            }
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}
