//! Block device access over Linux device nodes

use super::{BlockDev, Emmc, MmcPartition, SECTOR_SIZE};

use anyhow::{ensure, Context};

use std::fs::File;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::{Path, PathBuf};

/// A sector-addressed region backed by an open block device file
#[derive(Debug)]
pub struct FileDisk {
    file: File,
    sectors: u64,
}

impl FileDisk {
    /// Open a block device node (e.g. "/dev/mmcblk0boot0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(&path)?;

        let mut size: u64 = 0;
        let bytes = match unsafe { ioctl::blkgetsize64(file.as_raw_fd(), &mut size) } {
            Ok(_) => size,
            // Not a block device; fall back to the file length (disk images)
            Err(_) => file.metadata()?.len(),
        };
        ensure!(
            bytes % SECTOR_SIZE as u64 == 0,
            "device size not a multiple of the sector size"
        );

        Ok(Self {
            file,
            sectors: bytes / SECTOR_SIZE as u64,
        })
    }

    fn offset_for(&self, sector: u64, bytes: usize) -> anyhow::Result<u64> {
        ensure!(
            bytes % SECTOR_SIZE == 0,
            "buffer not a multiple of sector size"
        );
        let end = sector + (bytes / SECTOR_SIZE) as u64;
        ensure!(end <= self.sectors, "sector range {sector}..{end} out of bounds");
        Ok(sector * SECTOR_SIZE as u64)
    }
}

impl BlockDev for FileDisk {
    fn sector_count(&self) -> u64 {
        self.sectors
    }

    fn read(&mut self, sector: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(sector, buf.len())?;
        Ok(self.file.read_exact_at(buf, offset)?)
    }

    fn write(&mut self, sector: u64, buf: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(sector, buf.len())?;
        Ok(self.file.write_all_at(buf, offset)?)
    }
}

/// An eMMC device exposed by Linux as a set of device nodes:
/// `<base>boot0`, `<base>boot1` and `<base>` itself for the GPP.
#[derive(Debug)]
pub struct FileEmmc {
    boot0: FileDisk,
    boot1: FileDisk,
    gpp: FileDisk,
    serial: String,
}

impl FileEmmc {
    /// Open an mmcblk device by its GPP node path (e.g. "/dev/mmcblk0")
    pub fn open<P: AsRef<Path>>(base: P) -> anyhow::Result<Self> {
        let base = base.as_ref();
        let name = base
            .file_name()
            .and_then(|n| n.to_str())
            .context("device path has no name")?;

        let node = |suffix: &str| -> PathBuf {
            let mut p = base.as_os_str().to_owned();
            p.push(suffix);
            p.into()
        };

        let serial = std::fs::read_to_string(format!("/sys/block/{name}/device/serial"))
            .map(|s| s.trim().trim_start_matches("0x").to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Ok(Self {
            boot0: FileDisk::open(node("boot0")).context("opening boot0")?,
            boot1: FileDisk::open(node("boot1")).context("opening boot1")?,
            gpp: FileDisk::open(base).context("opening GPP")?,
            serial,
        })
    }
}

impl Emmc for FileEmmc {
    type Part<'a> = &'a mut FileDisk;

    fn partition(&mut self, part: MmcPartition) -> anyhow::Result<Self::Part<'_>> {
        Ok(match part {
            MmcPartition::Boot0 => &mut self.boot0,
            MmcPartition::Boot1 => &mut self.boot1,
            MmcPartition::Gpp => &mut self.gpp,
        })
    }

    fn serial(&self) -> &str {
        &self.serial
    }
}

mod ioctl {
    //! The block-device ioctls we need

    use nix::ioctl_read;

    // BLKGETSIZE64: size of a block device in bytes
    ioctl_read!(blkgetsize64, 0x12, 114, u64);
}
