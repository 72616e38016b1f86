//! Whole stack scenarios: mount, directory and file operations on formatted images.

use byteorder::{ByteOrder, LittleEndian};

use super::testutil::{self, ImageSpec};
use super::*;
use crate::disk::ram::RamDisk;
use crate::disk::sd::emulated::{EmulatedCard, EmulatedKind};
use crate::disk::sd::SdCard;
use crate::disk::SECTOR_SIZE;

fn mounted(spec: &ImageSpec) -> FileSystem<RamDisk> {
    let mut fs = FileSystem::new(testutil::format(spec));
    fs.mount(0, true).unwrap();
    fs
}

fn list(fs: &mut FileSystem<RamDisk>) -> Vec<String> {
    let mut dir = fs.opendir("/").unwrap();
    let mut names = Vec::new();
    while let Some(info) = fs.readdir(&mut dir).unwrap() {
        names.push(info.name.to_string());
    }
    fs.closedir(&mut dir).unwrap();
    names
}

#[test]
fn test_scenario_a_mount() {
    crate::tests_init();

    let fs = mounted(&ImageSpec::scenario_a());
    let info = fs.volume_info(0).unwrap();
    assert_eq!(info.fat_type, FatType::Fat16);
    assert_eq!(info.cluster_count, (65536 - (1 + 64 + 32)) / 4);
    assert_eq!(info.cluster_count, 16359);
    assert_eq!(info.cluster_bytes(), 2048);
}

#[test]
fn test_scenario_b_hello() {
    crate::tests_init();

    macro_rules! hello {
        ($spec:expr) => {{
            let mut fs = mounted(&$spec);

            let mut f = fs
                .open("TEST.TXT", OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
                .unwrap();
            assert_eq!(fs.write(&mut f, b"Hello FatFS!\n").unwrap(), 13);
            fs.close(&mut f).unwrap();

            let mut f = fs.open("TEST.TXT", OpenMode::READ).unwrap();
            let mut buf = [0u8; 32];
            assert_eq!(fs.read(&mut f, &mut buf).unwrap(), 13);
            assert_eq!(&buf[..13], b"Hello FatFS!\n");
            assert_eq!(f.size(), 13);
            fs.close(&mut f).unwrap();

            // The data is on the media, not only in memory.
            let mut fs = FileSystem::new(fs.into_disk());
            fs.mount(0, true).unwrap();
            let info = fs.stat("test.txt").unwrap();
            assert_eq!(info.size, 13);
            assert_eq!(info.kind, EntryKind::File);
            assert!(info.attributes.contains(Attributes::ARCHIVE));
            assert_eq!(info.modified, FixedTime::default().now());
        }};
    }

    hello!(ImageSpec::fat12());
    hello!(ImageSpec::fat16());
    hello!(ImageSpec::scenario_a());
    hello!(ImageSpec::fat32());
    hello!(ImageSpec::fat16().partition_at(63));
}

#[test]
fn test_idempotent_sync() {
    crate::tests_init();

    let mut fs = mounted(&ImageSpec::fat16());
    let mut f = fs
        .open("SYNC.TXT", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    fs.write(&mut f, &[0x5A; 700]).unwrap();

    fs.sync(&mut f).unwrap();
    let writes = fs.disk().stats().writes;
    assert!(writes > 0);
    fs.sync(&mut f).unwrap();
    assert_eq!(fs.disk().stats().writes, writes);
    fs.close(&mut f).unwrap();
    assert_eq!(fs.disk().stats().writes, writes);
}

#[test]
fn test_fat_copies_and_fsinfo_after_writes() {
    crate::tests_init();

    let spec = ImageSpec::fat32();
    let mut fs = mounted(&spec);
    let free_before = fs.getfree("").unwrap();

    let mut f = fs
        .open("FAT32.BIN", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    fs.write(&mut f, &[1u8; 3 * SECTOR_SIZE]).unwrap();
    fs.close(&mut f).unwrap();

    let image = fs.disk().as_slice();
    let first = spec.fat_base() as usize * SECTOR_SIZE;
    let second = (spec.fat_base() + spec.params.fat_size) as usize * SECTOR_SIZE;
    assert_eq!(&image[first..first + SECTOR_SIZE], &image[second..second + SECTOR_SIZE]);

    // Root directory is cluster 2, the file got 3, 4 and 5.
    assert_eq!(LittleEndian::read_u32(&image[first + 12..]), 4);
    assert_eq!(LittleEndian::read_u32(&image[first + 20..]), 0x0FFF_FFFF);

    let fsinfo = SECTOR_SIZE;
    assert_eq!(
        LittleEndian::read_u32(&image[fsinfo + 488..]),
        free_before - 3
    );
    assert_eq!(LittleEndian::read_u32(&image[fsinfo + 492..]), 5);

    let mut fs = FileSystem::new(fs.into_disk());
    fs.mount(0, true).unwrap();
    assert_eq!(fs.getfree("").unwrap(), free_before - 3);
}

#[test]
fn test_directory_scan_termination() {
    crate::tests_init();

    let spec = ImageSpec::fat12();
    let mut fs = mounted(&spec);
    assert!(list(&mut fs).is_empty());

    // Entries after the end marker are never reported.
    testutil::put_root_entries(
        fs.disk_mut(),
        &spec,
        &[[0u8; 32], testutil::entry(b"HIDDEN  TXT", 0x20)],
    );
    fs.mount(0, true).unwrap();
    assert!(list(&mut fs).is_empty());

    testutil::put_root_entries(
        fs.disk_mut(),
        &spec,
        &[
            testutil::entry(b"LABEL      ", 0x08),
            testutil::entry(b"\xE5GONE   TXT", 0x20),
            testutil::entry(b"A       TXT", 0x20),
            testutil::entry(b"B       TXT", 0x0F),
            testutil::entry(b"SUBDIR     ", 0x10),
            testutil::entry(b"\x05LATIN  TXT", 0x20),
        ],
    );
    fs.mount(0, true).unwrap();
    assert_eq!(list(&mut fs), vec!["A.TXT", "SUBDIR", "\u{e5}LATIN.TXT"]);
    assert!(fs.stat("SUBDIR").unwrap().is_dir());
    assert!(matches!(fs.stat("GONE.TXT"), Err(Error::NoFile)));
}

#[test]
fn test_full_root_directory() {
    crate::tests_init();

    let mut fs = mounted(&ImageSpec::fat12());
    for i in 0..224 {
        let mut f = fs
            .open(&format!("F{}.TXT", i), OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        fs.close(&mut f).unwrap();
    }
    assert!(matches!(
        fs.open("ONEMORE.TXT", OpenMode::WRITE | OpenMode::CREATE_NEW),
        Err(Error::Denied)
    ));
    assert_eq!(list(&mut fs).len(), 224);

    // Truncating an existing name still works.
    let mut f = fs
        .open("F7.TXT", OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
        .unwrap();
    fs.close(&mut f).unwrap();
}

#[test]
fn test_fat32_root_spans_clusters() {
    crate::tests_init();

    let mut fs = mounted(&ImageSpec::fat32());
    // One sector clusters hold 16 entries; grow the root by hand.
    let volume = fs.volumes[0].as_mut().unwrap();
    volume.put_fat(&mut fs.disk, 2, 3).unwrap();
    volume.put_fat(&mut fs.disk, 3, 0x0FFF_FFFF).unwrap();
    volume.window.sync(&mut fs.disk).unwrap();

    for i in 0..32 {
        let mut f = fs
            .open(&format!("R{}.BIN", i), OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        fs.write(&mut f, &[i as u8]).unwrap();
        fs.close(&mut f).unwrap();
    }
    assert!(matches!(
        fs.open("R32.BIN", OpenMode::WRITE | OpenMode::CREATE_NEW),
        Err(Error::Denied)
    ));

    let names = list(&mut fs);
    assert_eq!(names.len(), 32);
    assert_eq!(names[31], "R31.BIN");

    let mut f = fs.open("R20.BIN", OpenMode::READ).unwrap();
    let mut byte = [0u8; 1];
    fs.read(&mut f, &mut byte).unwrap();
    assert_eq!(byte[0], 20);
}

#[test]
fn test_cyclic_root_chain() {
    crate::tests_init();

    let spec = ImageSpec::fat32();
    let mut disk = testutil::format(&spec);
    // A root cluster linking to itself, with no end of directory marker.
    let deleted = testutil::entry(b"\xE5ELETED TXT", 0x20);
    testutil::put_root_entries(&mut disk, &spec, &[deleted; 16]);
    for copy in 0..spec.params.fats as u32 {
        let fat = (spec.fat_base() + copy * spec.params.fat_size) as usize * SECTOR_SIZE;
        LittleEndian::write_u32(&mut disk.as_mut_slice()[fat + 2 * 4..], 2);
    }

    let mut fs = FileSystem::new(disk);
    fs.mount(0, true).unwrap();
    assert!(matches!(fs.stat("X.TXT"), Err(Error::IntegrityError)));
    assert!(matches!(
        fs.open("X.TXT", OpenMode::WRITE | OpenMode::OPEN_ALWAYS),
        Err(Error::IntegrityError)
    ));

    let mut dir = fs.opendir("").unwrap();
    assert!(matches!(fs.readdir(&mut dir), Err(Error::IntegrityError)));
}

#[test]
fn test_rewinddir() {
    crate::tests_init();

    let mut fs = mounted(&ImageSpec::fat16());
    for name in &["ONE", "TWO", "THREE"] {
        let mut f = fs
            .open(name, OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        fs.close(&mut f).unwrap();
    }

    let mut dir = fs.opendir("0:/").unwrap();
    assert_eq!(fs.readdir(&mut dir).unwrap().unwrap().name.to_string(), "ONE");
    assert_eq!(fs.readdir(&mut dir).unwrap().unwrap().name.to_string(), "TWO");
    fs.rewinddir(&mut dir).unwrap();
    assert_eq!(fs.readdir(&mut dir).unwrap().unwrap().name.to_string(), "ONE");
    fs.closedir(&mut dir).unwrap();
    assert!(matches!(fs.readdir(&mut dir), Err(Error::InvalidObject)));

    assert!(matches!(fs.opendir("ONE"), Err(Error::NoPath)));
    assert!(matches!(fs.opendir("NONE"), Err(Error::NoFile)));
    assert!(matches!(fs.opendir("A/B"), Err(Error::NoPath)));
}

#[test]
fn test_delete_and_reuse_slot() {
    crate::tests_init();

    let spec = ImageSpec::fat16();
    let mut fs = mounted(&spec);
    for name in &["KEEP.TXT", "DROP.TXT"] {
        let mut f = fs
            .open(name, OpenMode::WRITE | OpenMode::CREATE_NEW)
            .unwrap();
        fs.close(&mut f).unwrap();
    }

    // Tombstone the first entry.
    let root = spec.root_base() as usize * SECTOR_SIZE;
    fs.disk_mut().as_mut_slice()[root] = 0xE5;
    fs.mount(0, true).unwrap();
    assert_eq!(list(&mut fs), vec!["DROP.TXT"]);

    let mut f = fs
        .open("NEW.TXT", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    fs.close(&mut f).unwrap();
    assert_eq!(list(&mut fs), vec!["NEW.TXT", "DROP.TXT"]);
}

#[test]
fn test_bulk_read_sees_pending_window() {
    crate::tests_init();

    // Four sector clusters, so the file data needs no FAT access.
    let mut fs = mounted(&ImageSpec::scenario_a());
    let mut f = fs
        .open("MIX.BIN", OpenMode::READ | OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    fs.write(&mut f, &[0u8; 4 * SECTOR_SIZE]).unwrap();
    // A short write leaves the second sector dirty in the window.
    fs.seek(&mut f, SECTOR_SIZE as u32 + 3).unwrap();
    fs.write(&mut f, b"abc").unwrap();

    fs.seek(&mut f, 0).unwrap();
    let mut buf = vec![0u8; 4 * SECTOR_SIZE];
    assert_eq!(fs.read(&mut f, &mut buf).unwrap(), buf.len());
    assert_eq!(&buf[SECTOR_SIZE + 3..SECTOR_SIZE + 6], b"abc");

    // A bulk write over the window sector replaces what it held.
    fs.seek(&mut f, 0).unwrap();
    fs.write(&mut f, &[9u8; 2 * SECTOR_SIZE]).unwrap();
    fs.close(&mut f).unwrap();

    let mut f = fs.open("MIX.BIN", OpenMode::READ).unwrap();
    fs.read(&mut f, &mut buf).unwrap();
    assert!(buf[..2 * SECTOR_SIZE].iter().all(|&b| b == 9));
    assert!(buf[2 * SECTOR_SIZE..].iter().all(|&b| b == 0));
}

#[test]
fn test_mount_errors() {
    crate::tests_init();

    let mut fs = FileSystem::new(RamDisk::new_zeroed(128));
    assert!(matches!(fs.mount(0, true), Err(Error::NoFilesystem)));
    assert!(matches!(fs.mount(1, true), Err(Error::InvalidDrive)));
    assert!(matches!(fs.volume_info(0), Err(Error::NotEnabled)));
    assert!(matches!(fs.getfree(""), Err(Error::NotEnabled)));
    assert!(matches!(fs.getfree("5:"), Err(Error::InvalidDrive)));
    fs.unmount(0).unwrap();
}

#[test]
fn test_time_source() {
    crate::tests_init();

    struct Frozen;

    impl TimeSource for Frozen {
        fn now(&self) -> FatTimestamp {
            FatTimestamp::new(2001, 9, 8, 7, 6, 4)
        }
    }

    let mut fs = FileSystem::with_time_source(testutil::format(&ImageSpec::fat12()), Frozen);
    fs.mount(0, true).unwrap();
    let mut f = fs
        .open("CLOCK.TXT", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    fs.write(&mut f, b"tick").unwrap();
    fs.close(&mut f).unwrap();
    assert_eq!(
        fs.stat("CLOCK.TXT").unwrap().modified.to_string(),
        "2001-09-08 07:06:04"
    );
}

#[test]
fn test_over_emulated_card() {
    crate::tests_init();

    let image = testutil::format(&ImageSpec::fat16()).into_inner();
    let card = EmulatedCard::new(EmulatedKind::SdHc, RamDisk::from_vec(image));
    let (spi, cs) = card.connect();
    let mut fs = FileSystem::new(SdCard::new(spi, cs));
    fs.mount(0, true).unwrap();

    let data: Vec<u8> = (0..5000u32).map(|i| (i % 253) as u8).collect();
    let mut f = fs
        .open("CARD.BIN", OpenMode::WRITE | OpenMode::CREATE_NEW)
        .unwrap();
    assert_eq!(fs.write(&mut f, &data).unwrap(), data.len());
    fs.close(&mut f).unwrap();

    // Remount through a fresh bring-up and read it back.
    fs.mount(0, true).unwrap();
    let mut f = fs.open("CARD.BIN", OpenMode::READ).unwrap();
    let mut back = vec![0u8; data.len()];
    assert_eq!(fs.read(&mut f, &mut back).unwrap(), data.len());
    assert_eq!(back, data);

    // The card's storage holds a valid volume too.
    let mut fs = FileSystem::new(RamDisk::from_vec(card.image()));
    fs.mount(0, true).unwrap();
    assert_eq!(fs.stat("CARD.BIN").unwrap().size, 5000);
}

#[test]
fn test_not_ready_card() {
    crate::tests_init();

    let card = EmulatedCard::new(EmulatedKind::SdV1, RamDisk::new_zeroed(2048)).never_ready();
    let (spi, cs) = card.connect();
    let mut fs = FileSystem::new(SdCard::new(spi, cs));
    assert!(matches!(fs.mount(0, true), Err(Error::NotReady)));
}
