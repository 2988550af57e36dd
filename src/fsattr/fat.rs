//! DirFs implementation over a mounted vfat filesystem, via the FAT ioctls

use super::{DirEntry, DirFs};

use anyhow::Context;

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

/// The FAT archive attribute bit, as used by `FAT_IOCTL_*_ATTRIBUTES`
pub const ATTR_ARCH: u32 = 0x20;

/// A mounted vfat tree rooted at some directory
#[derive(Debug)]
pub struct FatFs {
    base: PathBuf,
}

impl FatFs {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self {
            base: base.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if path.is_empty() {
            self.base.clone()
        } else {
            self.base.join(path)
        }
    }

    fn attributes(path: &Path) -> anyhow::Result<u32> {
        let file = File::open(path)?;
        let mut attrs: u32 = 0;
        unsafe { ioctl::fat_get_attributes(file.as_raw_fd(), &mut attrs) }
            .with_context(|| format!("FAT_IOCTL_GET_ATTRIBUTES on {}", path.display()))?;
        Ok(attrs)
    }
}

impl DirFs for FatFs {
    fn read_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>> {
        let dir = self.resolve(path);
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type()?.is_dir();
            let archive = Self::attributes(&entry.path())? & ATTR_ARCH != 0;
            entries.push(DirEntry {
                name,
                is_dir,
                archive,
            });
        }
        Ok(entries)
    }

    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn set_archive(&mut self, path: &str, set: bool) -> anyhow::Result<()> {
        let path = self.resolve(path);
        let attrs = Self::attributes(&path)?;
        let attrs = if set {
            attrs | ATTR_ARCH
        } else {
            attrs & !ATTR_ARCH
        };

        let file = File::open(&path)?;
        unsafe { ioctl::fat_set_attributes(file.as_raw_fd(), &attrs) }
            .with_context(|| format!("FAT_IOCTL_SET_ATTRIBUTES on {}", path.display()))?;
        Ok(())
    }
}

mod ioctl {
    //! The vfat attribute ioctls

    use nix::{ioctl_read, ioctl_write_ptr};

    const FAT_IOC_MAGIC: u8 = b'r';

    ioctl_read!(fat_get_attributes, FAT_IOC_MAGIC, 0x10, u32);
    ioctl_write_ptr!(fat_set_attributes, FAT_IOC_MAGIC, 0x11, u32);
}
