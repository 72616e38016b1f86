#[macro_use]
extern crate log;

mod utils;

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::result;

use anyhow::{bail, Context};
use cardfs::disk::raw::RawDisk;
use cardfs::disk::ram::RamDisk;
use cardfs::disk::sd::emulated::{EmulatedCard, EmulatedKind};
use cardfs::disk::sd::SdCard;
use cardfs::disk::{BlockDevice, SECTOR_SIZE};
use cardfs::fs::fat::{FileSystem, LocalTime, OpenMode};
use clap::{Args, Parser, Subcommand};

const DRIVE: u8 = 0;

fn parse_card_kind(x: &str) -> result::Result<EmulatedKind, &'static str> {
    match x.to_ascii_lowercase().as_str() {
        "sdhc" => Ok(EmulatedKind::SdHc),
        "sdv2" => Ok(EmulatedKind::SdV2),
        "sdv1" => Ok(EmulatedKind::SdV1),
        "mmc" => Ok(EmulatedKind::Mmc),
        _ => Err("Unknown card kind, expected sdhc, sdv2, sdv1 or mmc"),
    }
}

#[derive(Parser)]
struct Options {
    #[clap(short, long, parse(from_occurrences))]
    pub verbose: u32,

    #[clap(name = "image", parse(from_os_str))]
    pub image: PathBuf,

    #[clap(
        long,
        long_help = "Load the image into an emulated SD card and go through the SPI driver instead of accessing the file directly."
    )]
    pub spi: bool,

    #[clap(long, parse(try_from_str = parse_card_kind), default_value = "sdhc")]
    pub card: EmulatedKind,

    #[clap(long)]
    pub read_only: bool,

    #[clap(subcommand)]
    pub subcommand: SubCommand,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Print the layout of the volume.
    Info,
    /// List the root directory.
    #[clap(alias = "dir")]
    Ls,
    #[clap(alias = "type")]
    Cat(SubCommandName),
    /// Copy a host file into the root directory, replacing any existing file.
    Put(SubCommandPut),
    Stat(SubCommandName),
    /// Report free space.
    Df,
}

#[derive(Args)]
struct SubCommandName {
    pub name: String,
}

#[derive(Args)]
struct SubCommandPut {
    #[clap(parse(from_os_str))]
    pub source: PathBuf,
    /// 8.3 name on the volume, defaults to the source file name.
    pub name: Option<String>,
}

impl SubCommand {
    fn modifies(&self) -> bool {
        matches!(self, Self::Put(_))
    }
}

type Disk = Box<dyn BlockDevice>;

fn open_raw(path: &Path, read_only: bool) -> anyhow::Result<Disk> {
    let file = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let disk = RawDisk::open(file, read_only).context("Failed to open raw disk")?;
    debug!("{}: {} sectors", path.display(), disk.num_sectors());
    Ok(Box::new(disk))
}

fn open_card(path: &Path, kind: EmulatedKind, read_only: bool) -> anyhow::Result<(Disk, EmulatedCard)> {
    let image =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if image.is_empty() || image.len() % SECTOR_SIZE != 0 {
        bail!(
            "Image size {} is not a non-zero multiple of {}",
            image.len(),
            SECTOR_SIZE
        );
    }

    let card = EmulatedCard::new(kind, RamDisk::from_vec(image));
    let (spi, cs) = card.connect();
    let mut sd = SdCard::new(spi, cs);
    if read_only {
        card.set_write_protected(true);
        sd.set_write_protected(true);
    }
    Ok((Box::new(sd), card))
}

fn list(fs: &mut FileSystem<Disk>) -> anyhow::Result<()> {
    let mut dir = fs.opendir("").context("Failed to open root directory")?;
    let mut files = 0;
    let mut bytes = 0u64;
    while let Some(info) = fs.readdir(&mut dir).context("Failed to read directory")? {
        if info.is_dir() {
            println!("{:<12} {:>10}  {}", info.name, "<DIR>", info.modified);
        } else {
            println!("{:<12} {:>10}  {}", info.name, info.size, info.modified);
            files += 1;
            bytes += info.size as u64;
        }
    }
    fs.closedir(&mut dir)?;
    println!("{} file(s), {}", files, utils::size_to_string(bytes));
    Ok(())
}

fn cat(fs: &mut FileSystem<Disk>, name: &str) -> anyhow::Result<()> {
    let mut file = fs
        .open(name, OpenMode::READ)
        .with_context(|| format!("Failed to open {}", name))?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut buf = vec![0u8; 8 * SECTOR_SIZE];
    loop {
        let n = fs.read(&mut file, &mut buf).context("Read failed")?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])?;
    }
    out.flush()?;
    fs.close(&mut file)?;
    Ok(())
}

fn put(fs: &mut FileSystem<Disk>, source: &Path, name: Option<&str>) -> anyhow::Result<()> {
    let name = match name {
        Some(x) => x.to_owned(),
        None => source
            .file_name()
            .and_then(|x| x.to_str())
            .map(str::to_owned)
            .with_context(|| format!("Cannot derive a name from {}", source.display()))?,
    };
    let data = std::fs::read(source).with_context(|| format!("Failed to read {}", source.display()))?;
    if data.len() > u32::MAX as usize {
        bail!("{} is too large for FAT", source.display());
    }

    let mut file = fs
        .open(&name, OpenMode::WRITE | OpenMode::CREATE_ALWAYS)
        .with_context(|| format!("Failed to create {}", name))?;
    let written = fs.write(&mut file, &data).context("Write failed")?;
    fs.close(&mut file).context("Failed to close file")?;
    if written < data.len() {
        bail!(
            "Volume full, only {} of {} bytes written",
            written,
            data.len()
        );
    }
    info!("{}: {} bytes written", name, written);
    Ok(())
}

fn stat(fs: &mut FileSystem<Disk>, name: &str) -> anyhow::Result<()> {
    let info = fs.stat(name).with_context(|| format!("Failed to stat {}", name))?;
    println!("Name       : {}", info.name);
    println!("Kind       : {:?}", info.kind);
    println!("Size       : {}", info.size);
    println!("Attributes : {:?}", info.attributes);
    println!("Modified   : {}", info.modified);
    Ok(())
}

fn df(fs: &mut FileSystem<Disk>) -> anyhow::Result<()> {
    let free = fs.getfree("").context("Failed to count free clusters")?;
    let volume = fs.volume_info(DRIVE)?;
    let cluster = volume.cluster_bytes() as u64;
    println!(
        "{} free of {} ({} of {} clusters)",
        utils::size_to_string(free as u64 * cluster),
        utils::size_to_string(volume.cluster_count as u64 * cluster),
        free,
        volume.cluster_count
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let o = Options::parse();
    utils::setup_logging(o.verbose)?;

    let read_only = o.read_only || !o.subcommand.modifies();
    let (disk, card) = if o.spi {
        let (disk, card) = open_card(&o.image, o.card, read_only)?;
        (disk, Some(card))
    } else {
        (open_raw(&o.image, read_only)?, None)
    };

    let mut fs = FileSystem::with_time_source(disk, LocalTime);
    fs.mount(DRIVE, true).context("Failed to mount volume")?;

    match &o.subcommand {
        SubCommand::Info => {
            if let Some(card) = &card {
                println!("Card                        : {:?}", card.kind());
            }
            println!("{}", fs.volume_info(DRIVE)?);
        }
        SubCommand::Ls => list(&mut fs)?,
        SubCommand::Cat(c) => cat(&mut fs, &c.name)?,
        SubCommand::Put(c) => put(&mut fs, &c.source, c.name.as_deref())?,
        SubCommand::Stat(c) => stat(&mut fs, &c.name)?,
        SubCommand::Df => df(&mut fs)?,
    }
    fs.unmount(DRIVE)?;

    // The emulated card works on a copy of the image.
    if let Some(card) = card {
        if !read_only {
            std::fs::write(&o.image, card.image())
                .with_context(|| format!("Failed to write back {}", o.image.display()))?;
            info!("image written back to {}", o.image.display());
        }
    }

    Ok(())
}
